//! Tracking of ledger validations received from the network.
//!
//! [`Validations`] stores the most recent validation from each node, groups
//! recent validations by ledger and sequence, detects forks between trusted
//! validators and uses a [`LedgerTrie`] to pick the preferred working ledger.

pub mod adaptor;
pub mod arena_ledger_trie;
pub mod ledger_trie;
mod seq_enforcer;
pub mod span;
pub mod validation_params;
pub mod validations;

pub use adaptor::{Adaptor, Mismatch};
pub use arena_ledger_trie::ArenaLedgerTrie;
pub use ledger_trie::LedgerTrie;
pub use validation_params::ValidationParams;
pub use validations::{ValidationStatus, Validations};
