use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug, Display};

use ledger_consensus_core::{TxIdOf, TxSet};

use crate::consensus_proposal::ConsensusProposal;
use crate::consensus_times::ConsensusTimer;
use crate::disputed_tx::DisputedTx;
use crate::error::ConsensusError;

/// Whether we have or don't have a consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusState {
    /// We do not have consensus
    No,
    /// The network has consensus without us
    MovedOn,
    /// We have consensus along with the network
    Yes,
}

impl Display for ConsensusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusState::No => write!(f, "no"),
            ConsensusState::MovedOn => write!(f, "movedOn"),
            ConsensusState::Yes => write!(f, "yes"),
        }
    }
}

/// Encapsulates the result of consensus.
///
/// Stores all relevant data for the outcome of consensus on a single ledger.
#[derive(Debug, Clone)]
pub struct ConsensusResult<S: TxSet, N, L> {
    /// The set of transactions consensus agrees go in the ledger
    pub txns: S,

    /// Our proposed position on transactions/close time
    pub position: ConsensusProposal<N, L, S::IdType>,

    /// Transactions which are under dispute with our peers
    pub disputes: HashMap<TxIdOf<S>, DisputedTx<S::TxType, N>>,

    /// Set of TxSet ids we have already compared/created disputes
    pub compares: HashSet<S::IdType>,

    /// Measures the duration of the establish phase for this consensus round
    pub round_time: ConsensusTimer,

    /// Indicates state in which consensus ended. Once in the accept phase
    /// will be either `Yes` or `MovedOn`
    pub state: ConsensusState,

    /// The number of peers proposing during the round
    pub proposers: usize,
}

impl<S, N, L> ConsensusResult<S, N, L>
where
    S: TxSet,
    N: Copy + Debug,
    L: Copy + Debug + Eq,
{
    /// Start a round result from our initial transaction set and the position
    /// we propose for it. The position must name `txns`.
    pub fn new(txns: S, position: ConsensusProposal<N, L, S::IdType>) -> Result<Self, ConsensusError> {
        debug_assert!(txns.id() == position.position(), "position does not match its transaction set");
        if txns.id() != position.position() {
            return Err(ConsensusError::PositionMismatch);
        }

        Ok(ConsensusResult {
            txns,
            position,
            disputes: HashMap::new(),
            compares: HashSet::new(),
            round_time: ConsensusTimer::default(),
            state: ConsensusState::No,
            proposers: 0,
        })
    }
}
