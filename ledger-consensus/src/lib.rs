//! Byzantine fault tolerant agreement on the next ledger.
//!
//! A [`Consensus`] round takes the last closed ledger, waits for the open
//! ledger to close, then exchanges [`ConsensusProposal`]s with peers until a
//! supermajority agrees on both the set of transactions and the close time of
//! the next ledger. Everything outside the round, such as storage, networking
//! and ledger building, is reached through the [`Adaptor`] trait.

use std::fmt::{self, Display};

pub mod adaptor;
pub mod censorship_detector;
pub mod consensus;
pub mod consensus_params;
pub mod consensus_proposal;
pub mod consensus_result;
pub mod consensus_times;
pub mod disputed_tx;
pub mod error;
pub mod ledger_timing;

pub use adaptor::Adaptor;
pub use censorship_detector::{CensorshipDetector, TxIdSeq};
pub use consensus::Consensus;
pub use consensus_params::ConsensusParams;
pub use consensus_proposal::{ConsensusProposal, SEQ_JOIN, SEQ_LEAVE};
pub use consensus_result::{ConsensusResult, ConsensusState};
pub use consensus_times::{ConsensusCloseTimes, ConsensusTimer};
pub use disputed_tx::DisputedTx;
pub use error::ConsensusError;

/// Represents how a node currently participates in Consensus.
///
/// A node participates in consensus in varying modes, depending on how
/// the node was configured by its operator and how well it stays in sync
/// with the network during consensus.
///
/// ```text
/// Proposing               Observing
///    \                       /
///     \---> WrongLedger <---/
///                ^
///                |
///                |
///                v
///          SwitchedLedger
/// ```
///
/// We enter the round Proposing or Observing. If we detect we are working
/// on the wrong prior ledger, we go to WrongLedger and attempt to acquire
/// the right one. Once we acquire the right one, we go to the SwitchedLedger
/// mode. It is possible we fall behind again and find there is a new better
/// ledger, moving back and forth between WrongLedger and SwitchedLedger as
/// we attempt to catch up.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConsensusMode {
    /// We are normal participant in consensus and propose our position
    Proposing,
    /// We are observing peer positions, but not proposing our position
    Observing,
    /// We have the wrong ledger and are attempting to acquire it
    WrongLedger,
    /// We switched ledgers since we started this consensus round but are now
    /// running on what we believe is the correct ledger. This mode is as
    /// if we entered the round observing, but is used to indicate we did
    /// have the wrong ledger at some point.
    SwitchedLedger,
}

impl Display for ConsensusMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusMode::Proposing => write!(f, "proposing"),
            ConsensusMode::Observing => write!(f, "observing"),
            ConsensusMode::WrongLedger => write!(f, "wrongLedger"),
            ConsensusMode::SwitchedLedger => write!(f, "switchedLedger"),
        }
    }
}

/// Phases of consensus for a single ledger round.
///
/// ```text
///       "close"             "accept"
///  open ------- > establish ---------> accepted
///    ^               |                    |
///    |---------------|                    |
///    ^                     "startRound"   |
///    |------------------------------------|
/// ```
///
/// The typical transition goes from open to establish to accepted and
/// then a call to `start_round` begins the process anew. However, if a wrong
/// prior ledger is detected and recovered during the establish or accept
/// phase, consensus will internally go back to open.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConsensusPhase {
    /// We haven't closed our ledger yet, but others might have
    Open,
    /// Establishing consensus by exchanging proposals with our peers
    Establish,
    /// We have accepted a new last closed ledger and are waiting on a call
    /// to `start_round` to begin the next consensus round. No changes
    /// to consensus phase occur while in this phase.
    Accepted,
}

impl Display for ConsensusPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusPhase::Open => write!(f, "open"),
            ConsensusPhase::Establish => write!(f, "establish"),
            ConsensusPhase::Accepted => write!(f, "accepted"),
        }
    }
}
