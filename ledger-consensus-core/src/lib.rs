use std::collections::BTreeMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::{Duration, SystemTime};

pub mod aged_unordered_map;
pub mod duration_millis;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub type LedgerIndex = u32;

/// Identifier of a ledger. Ordering is used to break ties between ledgers with
/// equal support.
pub trait LedgerId: Eq + PartialEq + Ord + PartialOrd + Hash + Copy + Clone + Debug {}

impl<T: Eq + Ord + Hash + Copy + Debug> LedgerId for T {}

/// An immutable, closed ledger.
///
/// Ledgers are identified by a content derived id and know the ids of all of
/// their ancestors, so that two ledgers can be compared for common history.
pub trait Ledger: Clone + Debug {
    type IdType: LedgerId;

    fn id(&self) -> Self::IdType;

    fn seq(&self) -> LedgerIndex;

    /// The id of the ancestor of this ledger with the given sequence. `seq` must be
    /// less than or equal to `self.seq()`.
    fn get_ancestor(&self, seq: LedgerIndex) -> Self::IdType;

    fn make_genesis() -> Self;

    /// The sequence number of the first ledger in which `self` and `other` differ.
    fn mismatch(&self, other: &Self) -> LedgerIndex;

    fn parent_id(&self) -> Self::IdType;

    fn close_time(&self) -> SystemTime;

    fn parent_close_time(&self) -> SystemTime;

    fn close_time_resolution(&self) -> Duration;

    /// Whether the network agreed on this ledger's close time.
    fn close_agree(&self) -> bool;

    /// Whether `ancestor` is a strict ancestor of this ledger.
    fn is_ancestor(&self, ancestor: &Self) -> bool {
        ancestor.seq() < self.seq() && self.get_ancestor(ancestor.seq()) == ancestor.id()
    }
}

/// Source of network time.
pub trait NetClock {
    fn now(&self) -> SystemTime;
}

/// A single transaction as seen by consensus. Only its id matters.
pub trait Tx: Clone + Debug {
    type IdType: Eq + Ord + Hash + Copy + Debug;

    fn id(&self) -> Self::IdType;
}

pub type TxIdOf<S> = <<S as TxSet>::TxType as Tx>::IdType;

/// An immutable set of transactions identified by a content derived id.
pub trait TxSet: Clone + Debug {
    type IdType: Eq + Ord + Hash + Copy + Debug;
    type TxType: Tx;
    type MutableType: MutableTxSet<TxSetType = Self>;

    fn id(&self) -> Self::IdType;

    fn exists(&self, tx_id: &TxIdOf<Self>) -> bool;

    fn find(&self, tx_id: &TxIdOf<Self>) -> Option<Self::TxType>;

    /// For every transaction in exactly one of the two sets, whether it is in
    /// `self` (`true`) or only in `other` (`false`).
    fn compare(&self, other: &Self) -> BTreeMap<TxIdOf<Self>, bool>;

    fn to_mutable(&self) -> Self::MutableType;
}

/// A transaction set under construction.
pub trait MutableTxSet {
    type TxSetType: TxSet;

    fn insert(&mut self, tx: <Self::TxSetType as TxSet>::TxType) -> bool;

    fn erase(&mut self, tx_id: &TxIdOf<Self::TxSetType>) -> bool;

    /// Freeze into an immutable, id bearing set.
    fn freeze(self) -> Self::TxSetType;
}

/// A signed statement from a validator that it built a given ledger.
pub trait Validation: Clone + Debug {
    type LedgerIdType: LedgerId;
    type NodeIdType: Eq + Hash + Ord + Copy + Debug;
    type NodeKeyType: Eq + Hash + Copy + Debug;

    fn seq(&self) -> LedgerIndex;

    fn ledger_id(&self) -> Self::LedgerIdType;

    fn sign_time(&self) -> SystemTime;

    /// When this node first saw the validation. `UNIX_EPOCH` if unknown.
    fn seen_time(&self) -> SystemTime;

    fn node_id(&self) -> Self::NodeIdType;

    /// The signing key, which may rotate underneath a stable node id.
    fn key(&self) -> Self::NodeKeyType;

    /// Random value chosen by the validator at startup, used to detect
    /// several instances running with the same key.
    fn cookie(&self) -> u64;

    fn trusted(&self) -> bool;

    fn set_trusted(&mut self);

    fn set_untrusted(&mut self);

    /// Full validations vote for a ledger; partial ones only signal the node
    /// is alive.
    fn full(&self) -> bool;

    fn load_fee(&self) -> Option<u32>;
}
