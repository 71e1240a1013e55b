use std::ops::AddAssign;
use std::time::SystemTime;

use derivative::Derivative;

use crate::{LedgerIndex, Validation};
use crate::test_utils::ledgers::LedgerId;

#[derive(Copy, Clone, Debug, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct PeerId(pub u32);

impl AddAssign<u32> for PeerId {
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs
    }
}

/// A signing key of a peer: the peer plus the index of its current key.
#[derive(Copy, Clone, Debug, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct PeerKey(pub PeerId, pub usize);

#[derive(Derivative)]
#[derivative(Eq, PartialEq, Ord, PartialOrd, Clone, Copy, Debug)]
pub struct TestValidation {
    ledger_id: LedgerId,
    seq: LedgerIndex,
    sign_time: SystemTime,
    seen_time: SystemTime,
    key: PeerKey,
    node_id: PeerId,
    load_fee: Option<u32>,
    full: bool,
    #[derivative(PartialEq = "ignore")]
    #[derivative(Ord = "ignore")]
    #[derivative(PartialOrd = "ignore")]
    trusted: bool,
    #[derivative(PartialEq = "ignore")]
    #[derivative(Ord = "ignore")]
    #[derivative(PartialOrd = "ignore")]
    cookie: u64,
}

impl TestValidation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger_id: LedgerId,
        seq: LedgerIndex,
        sign_time: SystemTime,
        seen_time: SystemTime,
        key: PeerKey,
        node_id: PeerId,
        trusted: bool,
        full: bool,
        load_fee: Option<u32>,
        cookie: Option<u64>,
    ) -> Self {
        TestValidation {
            ledger_id,
            seq,
            sign_time,
            seen_time,
            key,
            node_id,
            trusted,
            full,
            load_fee,
            cookie: cookie.unwrap_or(0),
        }
    }

    pub fn set_seen(&mut self, seen: SystemTime) {
        self.seen_time = seen;
    }
}

impl Validation for TestValidation {
    type LedgerIdType = LedgerId;
    type NodeIdType = PeerId;
    type NodeKeyType = PeerKey;

    fn seq(&self) -> LedgerIndex {
        self.seq
    }

    fn ledger_id(&self) -> LedgerId {
        self.ledger_id
    }

    fn sign_time(&self) -> SystemTime {
        self.sign_time
    }

    fn seen_time(&self) -> SystemTime {
        self.seen_time
    }

    fn node_id(&self) -> PeerId {
        self.node_id
    }

    fn key(&self) -> PeerKey {
        self.key
    }

    fn cookie(&self) -> u64 {
        self.cookie
    }

    fn trusted(&self) -> bool {
        self.trusted
    }

    fn set_trusted(&mut self) {
        self.trusted = true;
    }

    fn set_untrusted(&mut self) {
        self.trusted = false;
    }

    fn full(&self) -> bool {
        self.full
    }

    fn load_fee(&self) -> Option<u32> {
        self.load_fee
    }
}
