use ledger_consensus_core::LedgerIndex;
use thiserror::Error;

/// Failures that stop a consensus round from making progress on this node.
///
/// Disagreement with peers is never an error; it is resolved by the round
/// itself. These cover local resource failures and bad configuration.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// The application could not build a candidate transaction set on top of
    /// the previous ledger. The round stays open and retries on the next tick.
    #[error("unable to close ledger {seq}: {reason}")]
    CloseFailed { seq: LedgerIndex, reason: String },

    /// A round result was built whose transaction set differs from the
    /// position it claims to hold.
    #[error("transaction set does not match the proposed position")]
    PositionMismatch,

    #[error("invalid consensus parameters: {0}")]
    InvalidParams(String),

    #[error("unable to parse consensus parameters")]
    Config(#[from] serde_json::Error),
}
