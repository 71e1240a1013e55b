use ledger_consensus_core::{Ledger, LedgerIndex};

use crate::span::SpanTip;

/// Ancestry trie of ledgers, tracking how many validators currently support
/// each ledger (tip support) and each ledger or any of its descendants (branch
/// support).
pub trait LedgerTrie<T: Ledger>: Default {

    /// Insert and/or increment the support for the given ledger.
    fn insert(&mut self, ledger: &T, count: Option<u32>);

    /// Decrease support for a ledger, removing and compressing if possible.
    ///
    /// Returns whether a matching node was decremented and possibly removed.
    fn remove(&mut self, ledger: &T, count: Option<u32>) -> bool;

    /// Number of validators whose latest validation is exactly this ledger.
    fn tip_support(&self, ledger: &T) -> u32;

    /// Number of validators whose latest validation is this ledger or a descendant.
    fn branch_support(&self, ledger: &T) -> u32;

    /// Return the preferred ledger ID.
    ///
    /// The preferred ledger is used to determine the working ledger for
    /// consensus amongst competing alternatives. Support for a ledger that has
    /// not yet been validated by a node whose largest issued validation is
    /// `largest_issued` counts as uncommitted and could swing to any branch.
    fn get_preferred(&self, largest_issued: LedgerIndex) -> Option<SpanTip<T>>;

    fn is_empty(&self) -> bool;

    /// Verify the support counts are internally consistent.
    fn check_invariants(&self) -> bool;
}
