use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::SystemTime;

use ledger_consensus_core::{Ledger, LedgerId, LedgerIndex, Validation};

/// Disagreement between trusted validators, or between trusted validators and
/// the local node, about which ledger holds a given sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch<I> {
    /// Trusted validators fully validated different ledgers with the same sequence.
    Fork {
        seq: LedgerIndex,
        /// Every conflicting ledger id seen so far at `seq`, in ascending order.
        ledger_ids: Vec<I>,
    },
    /// A quorum of trusted validators validated a different ledger than our own.
    Local {
        seq: LedgerIndex,
        local: I,
        validated: I,
    },
}

/// Everything `Validations` needs from the surrounding application.
///
/// Methods take `&self` because the adaptor is shared by every thread using the
/// tracker. It is never called while the tracker's lock is held, so any method
/// may query the tracker.
pub trait Adaptor {
    type ValidationType: Validation<
        LedgerIdType = Self::LedgerIdType,
        NodeIdType = Self::NodeIdType,
        NodeKeyType = Self::NodeKeyType,
    >;
    type LedgerType: Ledger<IdType = Self::LedgerIdType>;
    type LedgerIdType: LedgerId;
    type NodeIdType: Eq + Hash + Ord + Copy + Debug;
    type NodeKeyType: Eq + Hash + Copy + Debug;

    /// The current network time.
    fn now(&self) -> SystemTime;

    /// Attempt to acquire a specific ledger.
    ///
    /// Returns `None` if the ledger is not yet available; the tracker will ask
    /// again later, so an implementation should start fetching it. Queries made
    /// from here see the tracker before the ledger is added to the trie.
    fn acquire(&self, ledger_id: &Self::LedgerIdType) -> Option<Self::LedgerType>;

    /// Handle a validation that was replaced by a newer one from the same node
    /// or went stale. The adaptor is responsible for persisting it.
    fn on_stale(&self, validation: Self::ValidationType);

    /// Hand over all remaining current validations at shutdown.
    fn flush(&self, remaining: HashMap<Self::NodeIdType, Self::ValidationType>);

    /// Report a fork between trusted validators or a mismatch with our own ledger.
    fn on_mismatch(&self, mismatch: Mismatch<Self::LedgerIdType>);
}
