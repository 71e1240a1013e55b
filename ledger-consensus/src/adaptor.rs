use std::fmt::Debug;
use std::hash::Hash;
use std::time::{Duration, SystemTime};

use ledger_consensus_core::{Ledger, TxSet};

use crate::consensus_params::ConsensusParams;
use crate::consensus_proposal::ConsensusProposal;
use crate::consensus_result::ConsensusResult;
use crate::consensus_times::ConsensusCloseTimes;
use crate::error::ConsensusError;
use crate::ConsensusMode;

pub type LedgerIdOf<A> = <<A as Adaptor>::LedgerType as Ledger>::IdType;
pub type TxSetIdOf<A> = <<A as Adaptor>::TxSetType as TxSet>::IdType;
pub type TxOf<A> = <<A as Adaptor>::TxSetType as TxSet>::TxType;

/// A position taken by this node or a peer during a round.
pub type ProposalOf<A> = ConsensusProposal<<A as Adaptor>::NodeIdType, LedgerIdOf<A>, TxSetIdOf<A>>;

/// The outcome of a round as handed to [`Adaptor::on_accept`].
pub type ResultOf<A> = ConsensusResult<<A as Adaptor>::TxSetType, <A as Adaptor>::NodeIdType, LedgerIdOf<A>>;

/// Everything a consensus round needs from the application around it:
/// ledger and transaction set storage, the open ledger, the network and
/// validation counts.
///
/// Calls are made synchronously from the round's entry points. Anything slow,
/// such as fetching a ledger from peers, should be started in the background
/// and reported back later (for transaction sets, via `Consensus::got_tx_set`).
pub trait Adaptor: Sized {
    type LedgerType: Ledger;
    type TxSetType: TxSet;
    type NodeIdType: Eq + Hash + Ord + Copy + Debug;

    /// The id this node signs its proposals with.
    fn node_id(&self) -> Self::NodeIdType;

    /// Whether this node is configured to validate ledgers.
    fn validating(&self) -> bool;

    /// Attempt to acquire a specific ledger.
    fn acquire_ledger(&mut self, ledger_id: &LedgerIdOf<Self>) -> Option<Self::LedgerType>;

    /// Acquire the transaction set associated with a proposed position.
    ///
    /// Returns `None` if it is not available yet; the implementation should
    /// request it and hand it over later.
    fn acquire_tx_set(&mut self, set_id: &TxSetIdOf<Self>) -> Option<Self::TxSetType>;

    /// Whether any transactions are in the open ledger
    fn has_open_transactions(&self) -> bool;

    /// Number of proposers that have validated the given ledger
    fn proposers_validated(&self, prev_ledger: &LedgerIdOf<Self>) -> usize;

    /// Number of proposers that have validated a ledger descended from the
    /// given ledger; if prev_ledger.id() != prev_ledger_id, use prev_ledger_id
    /// for the determination
    fn proposers_finished(&self, prev_ledger: &Self::LedgerType, prev_ledger_id: &LedgerIdOf<Self>) -> usize;

    /// The id of the last closed (and validated) ledger the application thinks
    /// consensus should use as the prior ledger.
    fn get_prev_ledger(
        &mut self,
        prev_ledger_id: LedgerIdOf<Self>,
        prev_ledger: &Self::LedgerType,
        mode: ConsensusMode,
    ) -> LedgerIdOf<Self>;

    /// Called whenever the consensus operating mode changes.
    fn on_mode_change(&mut self, before: ConsensusMode, after: ConsensusMode);

    /// Called when the open ledger closes. Returns the transaction set we
    /// initially propose to apply on top of `prev_ledger`.
    fn on_close(
        &mut self,
        prev_ledger: &Self::LedgerType,
        close_time: SystemTime,
        mode: ConsensusMode,
    ) -> Result<Self::TxSetType, ConsensusError>;

    /// Called when the network reached consensus. The application builds,
    /// validates and publishes the new ledger, then starts the next round.
    fn on_accept(
        &mut self,
        result: &ResultOf<Self>,
        prev_ledger: &Self::LedgerType,
        close_resolution: Duration,
        raw_close_times: &ConsensusCloseTimes,
        mode: ConsensusMode,
        consensus_json: serde_json::Value,
    );

    /// Like `on_accept`, when the ledger was forcibly accepted via
    /// `Consensus::simulate`.
    fn on_force_accept(
        &mut self,
        result: &ResultOf<Self>,
        prev_ledger: &Self::LedgerType,
        close_resolution: Duration,
        raw_close_times: &ConsensusCloseTimes,
        mode: ConsensusMode,
        consensus_json: serde_json::Value,
    );

    /// Propose our position to peers.
    fn propose(&mut self, position: &ProposalOf<Self>);

    /// Relay a peer's proposal to other peers.
    fn share_position(&mut self, position: &ProposalOf<Self>);

    /// Share a disputed transaction with peers.
    fn share_tx(&mut self, tx: &TxOf<Self>);

    /// Share a transaction set with peers.
    fn share_tx_set(&mut self, tx_set: &Self::TxSetType);

    fn params(&self) -> &ConsensusParams;
}
