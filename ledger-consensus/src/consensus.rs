use std::cmp::max;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;
use tracing::{debug, error, info, trace, warn};

use ledger_consensus_core::{Ledger, MutableTxSet, TxSet};

use crate::adaptor::{Adaptor, LedgerIdOf, ProposalOf, ResultOf, TxSetIdOf};
use crate::consensus_params::ConsensusParams;
use crate::consensus_proposal::{secs_since_epoch, ConsensusProposal, SEQ_JOIN};
use crate::consensus_result::{ConsensusResult, ConsensusState};
use crate::consensus_times::{ConsensusCloseTimes, ConsensusTimer};
use crate::disputed_tx::DisputedTx;
use crate::error::ConsensusError;
use crate::ledger_timing::{
    check_consensus, get_next_ledger_time_resolution, round_close_time, should_close_ledger,
    LEDGER_DEFAULT_TIME_RESOLUTION,
};
use crate::{ConsensusMode, ConsensusPhase};

/// Recent proposals kept per peer, replayed when a round starts.
const RECENT_POSITIONS_PER_PEER: usize = 10;

/// The current mode, reporting every change to the adaptor.
#[derive(Debug, Clone, Copy)]
struct MonitoredMode(ConsensusMode);

impl MonitoredMode {
    fn get(&self) -> ConsensusMode {
        self.0
    }

    fn set<A: Adaptor>(&mut self, mode: ConsensusMode, adaptor: &mut A) {
        adaptor.on_mode_change(self.0, mode);
        self.0 = mode;
    }
}

/// Generic implementation of consensus algorithm.
///
/// Achieves consensus on the next ledger.
///
/// Two things need consensus:
///
///   1. The set of transactions included in the ledger.
///   2. The close time for the ledger.
///
/// The basic flow:
///
///   1. A call to [`Consensus::start_round`] places the node in the `Open`
///      phase. In this phase, the node is waiting for transactions to include
///      in its open ledger.
///   2. Successive calls to [`Consensus::timer_entry`] check if the node can
///      close the ledger. Once the node closes the open ledger, it transitions
///      to the `Establish` phase. In this phase, the node shares/receives peer
///      proposals on which transactions should be accepted in the closed
///      ledger.
///   3. During a subsequent call to `timer_entry`, the node determines it has
///      reached consensus with its peers on which transactions to include. It
///      transitions to the `Accepted` phase. In this phase, the node works on
///      applying the transactions to the prior ledger to generate a new closed
///      ledger. Once the new ledger is completed, the node shares the validated
///      ledger with the network, does some book-keeping, then makes a call to
///      `start_round` to start the cycle again.
///
/// Every entry point takes the current network time; the round never reads a
/// clock of its own.
pub struct Consensus<A: Adaptor> {
    adaptor: A,

    phase: ConsensusPhase,
    mode: MonitoredMode,
    first_round: bool,
    have_close_time_consensus: bool,

    /// How long the consensus convergence has taken, expressed as a percentage
    /// of the time that we expected it to take.
    converge_percent: usize,

    /// How long has this round been open
    open_time: ConsensusTimer,

    close_resolution: Duration,

    /// Time it took for the last consensus round to converge
    prev_round_time: Duration,

    /// Network time measurements of consensus progress.
    /// The current network adjusted time. This is the network time the ledger
    /// would close if it closed now.
    now: SystemTime,
    prev_close_time: SystemTime,

    // Non-peer (self) consensus data

    /// Last validated ledger ID provided to consensus
    prev_ledger_id: LedgerIdOf<A>,
    /// Last validated ledger seen by consensus
    previous_ledger: A::LedgerType,

    /// Transaction Sets, indexed by hash of transaction tree
    acquired: HashMap<TxSetIdOf<A>, A::TxSetType>,

    result: Option<ResultOf<A>>,
    raw_close_times: ConsensusCloseTimes,

    // Peer related consensus data

    /// Peer proposed positions for the current round
    curr_peer_positions: HashMap<A::NodeIdType, ProposalOf<A>>,

    /// Recently received peer positions, available when transitioning between
    /// ledgers or rounds
    recent_peer_positions: HashMap<A::NodeIdType, VecDeque<ProposalOf<A>>>,

    /// The number of proposers who participated in the last consensus round
    prev_proposers: usize,

    /// nodes that have bowed out of this consensus process
    dead_nodes: HashSet<A::NodeIdType>,
}

impl<A: Adaptor> Consensus<A> {
    /// Create a consensus instance that waits for its first `start_round`.
    pub fn new(adaptor: A) -> Self {
        let previous_ledger = A::LedgerType::make_genesis();
        Consensus {
            adaptor,
            phase: ConsensusPhase::Accepted,
            mode: MonitoredMode(ConsensusMode::Observing),
            first_round: true,
            have_close_time_consensus: false,
            converge_percent: 0,
            open_time: ConsensusTimer::default(),
            close_resolution: LEDGER_DEFAULT_TIME_RESOLUTION,
            prev_round_time: Duration::ZERO,
            now: UNIX_EPOCH,
            prev_close_time: UNIX_EPOCH,
            prev_ledger_id: previous_ledger.id(),
            previous_ledger,
            acquired: HashMap::new(),
            result: None,
            raw_close_times: ConsensusCloseTimes::default(),
            curr_peer_positions: HashMap::new(),
            recent_peer_positions: HashMap::new(),
            prev_proposers: 0,
            dead_nodes: HashSet::new(),
        }
    }

    pub fn adaptor(&self) -> &A {
        &self.adaptor
    }

    pub fn adaptor_mut(&mut self) -> &mut A {
        &mut self.adaptor
    }

    pub fn phase(&self) -> ConsensusPhase {
        self.phase
    }

    pub fn mode(&self) -> ConsensusMode {
        self.mode.get()
    }

    /// The id of the ledger this round builds on.
    pub fn prev_ledger_id(&self) -> LedgerIdOf<A> {
        self.prev_ledger_id
    }

    /// Our position and disputes, once we closed the ledger this round.
    pub fn result(&self) -> Option<&ResultOf<A>> {
        self.result.as_ref()
    }

    pub fn close_resolution(&self) -> Duration {
        self.close_resolution
    }

    pub fn converge_percent(&self) -> usize {
        self.converge_percent
    }

    pub fn prev_proposers(&self) -> usize {
        self.prev_proposers
    }

    pub fn prev_round_time(&self) -> Duration {
        self.prev_round_time
    }

    /// The current position of the given peer this round, if any.
    pub fn peer_position(&self, node_id: &A::NodeIdType) -> Option<&ProposalOf<A>> {
        self.curr_peer_positions.get(node_id)
    }

    pub fn peer_positions(&self) -> usize {
        self.curr_peer_positions.len()
    }

    /// Kick-off the next round of consensus.
    ///
    /// Called by the client code to start each round of consensus.
    ///
    /// * `now` - the network adjusted time
    /// * `prev_ledger_id` - the id of the last ledger
    /// * `prev_ledger` - the last ledger
    /// * `now_untrusted` - ids of nodes that are newly untrusted this round
    /// * `proposing` - whether we want to send proposals to peers this round
    ///
    /// `prev_ledger` is not necessarily the same as `prev_ledger_id`; if it is
    /// not, we try to acquire the right one and otherwise start out of sync.
    pub fn start_round(
        &mut self,
        now: SystemTime,
        prev_ledger_id: LedgerIdOf<A>,
        mut prev_ledger: A::LedgerType,
        now_untrusted: &HashSet<A::NodeIdType>,
        proposing: bool,
    ) -> Result<(), ConsensusError> {
        if self.first_round {
            // take our initial view of close time from the seed ledger
            self.prev_round_time = self.adaptor.params().ledger_idle_interval();
            self.prev_close_time = prev_ledger.close_time();
            self.first_round = false;
        } else {
            self.prev_close_time = self.raw_close_times.ours;
        }

        for node_id in now_untrusted {
            self.recent_peer_positions.remove(node_id);
        }

        let mut start_mode = if proposing {
            ConsensusMode::Proposing
        } else {
            ConsensusMode::Observing
        };

        // We were handed the wrong ledger
        if prev_ledger.id() != prev_ledger_id {
            // try to acquire the correct one
            match self.adaptor.acquire_ledger(&prev_ledger_id) {
                Some(ledger) => prev_ledger = ledger,
                None => {
                    // Unable to acquire the correct ledger
                    start_mode = ConsensusMode::WrongLedger;
                    info!(
                        entering = ?prev_ledger.id(),
                        correct = ?prev_ledger_id,
                        "Entering consensus with the wrong ledger"
                    );
                }
            }
        }

        self.start_round_internal(now, prev_ledger_id, prev_ledger, start_mode)
    }

    fn start_round_internal(
        &mut self,
        now: SystemTime,
        prev_ledger_id: LedgerIdOf<A>,
        prev_ledger: A::LedgerType,
        mode: ConsensusMode,
    ) -> Result<(), ConsensusError> {
        self.phase = ConsensusPhase::Open;
        debug!(seq = prev_ledger.seq() + 1, "transitioned to ConsensusPhase::Open");
        self.mode.set(mode, &mut self.adaptor);
        self.now = now;
        self.prev_ledger_id = prev_ledger_id;
        self.previous_ledger = prev_ledger;
        self.result = None;
        self.converge_percent = 0;
        self.have_close_time_consensus = false;
        self.open_time.reset(now);
        self.curr_peer_positions.clear();
        self.acquired.clear();
        self.raw_close_times.clear();
        self.dead_nodes.clear();

        self.close_resolution = get_next_ledger_time_resolution(
            self.previous_ledger.close_time_resolution(),
            self.previous_ledger.close_agree(),
            self.previous_ledger.seq() + 1,
        );

        self.playback_proposals();
        if self.curr_peer_positions.len() > self.prev_proposers / 2 {
            // We may be falling behind, don't wait for the timer; consider
            // closing the ledger immediately
            self.timer_entry(self.now)?;
        }
        Ok(())
    }

    /// A peer has proposed a new position, adjust our tracking.
    ///
    /// Returns whether the peer position was applied to the current round.
    /// The proposal is remembered either way, to be replayed if we later
    /// switch to the ledger it builds on. Its seen time is set to `now`.
    pub fn peer_proposal(&mut self, now: SystemTime, mut proposal: ProposalOf<A>) -> bool {
        proposal.set_seen_time(now);
        let peer_id = proposal.node_id();

        // Always need to store recent positions
        let recent = self.recent_peer_positions.entry(peer_id).or_default();
        if recent.len() >= RECENT_POSITIONS_PER_PEER {
            recent.pop_front();
        }
        recent.push_back(proposal.clone());

        self.peer_proposal_internal(now, proposal)
    }

    fn peer_proposal_internal(&mut self, now: SystemTime, proposal: ProposalOf<A>) -> bool {
        // Nothing to do for now if we are currently working on a ledger
        if self.phase == ConsensusPhase::Accepted {
            return false;
        }

        self.now = now;
        let peer_id = proposal.node_id();

        if proposal.prev_ledger() != self.prev_ledger_id {
            debug!(
                peer = ?peer_id,
                proposal_ledger = ?proposal.prev_ledger(),
                our_ledger = ?self.prev_ledger_id,
                "Got proposal for another ledger"
            );
            return false;
        }

        if self.dead_nodes.contains(&peer_id) {
            info!(peer = ?peer_id, "Position from dead node");
            return false;
        }

        // update current position
        if let Some(current) = self.curr_peer_positions.get(&peer_id) {
            if proposal.propose_seq() <= current.propose_seq() {
                return false;
            }
        }

        if proposal.is_bow_out() {
            info!(peer = ?peer_id, "Peer bows out");
            if let Some(result) = self.result.as_mut() {
                for dispute in result.disputes.values_mut() {
                    dispute.un_vote(&peer_id);
                }
            }
            self.curr_peer_positions.remove(&peer_id);
            self.dead_nodes.insert(peer_id);
            return true;
        }

        if proposal.is_initial() {
            // Record the close time estimate
            trace!(peer = ?peer_id, close_time = secs_since_epoch(proposal.close_time()), "Peer reports close time");
            self.raw_close_times.record_peer(proposal.close_time());
        }

        trace!(
            peer = ?peer_id,
            seq = proposal.propose_seq(),
            position = ?proposal.position(),
            "Processing peer proposal"
        );
        let position = proposal.position();
        self.curr_peer_positions.insert(peer_id, proposal);

        match self.acquired.get(&position) {
            Some(tx_set) => {
                if self.result.is_some() {
                    let tx_set = tx_set.clone();
                    self.update_disputes(peer_id, &tx_set);
                }
            }
            // acquire_tx_set returns the set if it is available, or requests
            // it and hands it over through got_tx_set once it arrives
            None => match self.adaptor.acquire_tx_set(&position) {
                Some(tx_set) => self.got_tx_set(self.now, tx_set),
                None => debug!(peer = ?peer_id, position = ?position, "Don't have tx set for peer"),
            },
        }

        true
    }

    /// Call periodically to drive consensus forward.
    ///
    /// Fails only if the ledger could not be closed, in which case the round
    /// stays open and the next call tries again.
    pub fn timer_entry(&mut self, now: SystemTime) -> Result<(), ConsensusError> {
        // Nothing to do if we are currently working on a ledger
        if self.phase == ConsensusPhase::Accepted {
            return Ok(());
        }

        self.now = now;

        // Check we are on the proper ledger (this may change phase)
        self.check_ledger()?;

        match self.phase {
            ConsensusPhase::Open => self.phase_open(),
            ConsensusPhase::Establish => {
                self.phase_establish();
                Ok(())
            }
            ConsensusPhase::Accepted => Ok(()),
        }
    }

    /// Process a transaction set acquired from the network.
    pub fn got_tx_set(&mut self, now: SystemTime, tx_set: A::TxSetType) {
        // Nothing to do if we've finished work on a ledger
        if self.phase == ConsensusPhase::Accepted {
            return;
        }

        self.now = now;

        let id = tx_set.id();

        // If we've already processed this transaction set since requesting it
        // from the network, there is nothing to do now
        if self.acquired.contains_key(&id) {
            return;
        }
        self.acquired.insert(id, tx_set.clone());

        let Some(result) = self.result.as_ref() else {
            debug!(tx_set = ?id, "Not creating disputes: no position yet");
            return;
        };

        // Our position is added to acquired as soon as we create it, so this
        // set must differ
        debug_assert!(id != result.position.position());

        let proposers: Vec<A::NodeIdType> = self.curr_peer_positions
            .iter()
            .filter(|(_, position)| position.position() == id)
            .map(|(node_id, _)| *node_id)
            .collect();

        if proposers.is_empty() {
            warn!(tx_set = ?id, "By the time we got the transaction set no peers were proposing it");
        }

        for node_id in proposers {
            self.update_disputes(node_id, &tx_set);
        }
    }

    /// Simulate the consensus process without any network traffic.
    ///
    /// The end result is that consensus begins and completes, forcing the
    /// ledger closed and accepted without waiting on peers. Mainly useful for
    /// standalone operation and tests.
    ///
    /// * `consensus_delay` - duration to pretend the round took, default 100ms
    pub fn simulate(&mut self, now: SystemTime, consensus_delay: Option<Duration>) -> Result<(), ConsensusError> {
        if self.phase == ConsensusPhase::Accepted {
            debug!("Round already accepted, nothing to simulate");
            return Ok(());
        }

        info!("Simulating consensus");
        self.now = now;
        if self.result.is_none() {
            self.close_ledger()?;
        }

        let proposers = self.curr_peer_positions.len();
        let Some(result) = self.result.as_mut() else {
            return Ok(());
        };
        result.round_time.tick_duration(consensus_delay.unwrap_or(Duration::from_millis(100)));
        result.proposers = proposers;
        self.prev_proposers = proposers;
        self.prev_round_time = result.round_time.read();
        self.phase = ConsensusPhase::Accepted;

        let consensus_json = self.get_json(true);
        if let Some(result) = self.result.as_ref() {
            self.adaptor.on_force_accept(
                result,
                &self.previous_ledger,
                self.close_resolution,
                &self.raw_close_times,
                self.mode.get(),
                consensus_json,
            );
        }
        info!("Simulation complete");
        Ok(())
    }

    /// A snapshot of this round for status reporting. `full` adds peer
    /// positions, disputes, close times and timing details.
    pub fn get_json(&self, full: bool) -> serde_json::Value {
        let mode = self.mode.get();
        let mut ret = json!({
            "proposing": mode == ConsensusMode::Proposing,
            "validating": self.adaptor.validating(),
            "proposers": self.curr_peer_positions.len(),
            "mode": mode.to_string(),
            "phase": self.phase.to_string(),
        });

        if mode != ConsensusMode::WrongLedger {
            ret["synched"] = json!(true);
            ret["ledger_seq"] = json!(self.previous_ledger.seq() + 1);
            ret["close_granularity"] = json!(self.close_resolution.as_secs());
        } else {
            ret["synched"] = json!(false);
        }

        if let Some(result) = &self.result {
            if !full && !result.disputes.is_empty() {
                ret["disputes"] = json!(result.disputes.len());
            }
            ret["our_position"] = result.position.get_json();
        }

        if full {
            if let Some(result) = &self.result {
                ret["current_ms"] = json!(result.round_time.read().as_millis() as u64);
                ret["state"] = json!(result.state.to_string());
            }
            ret["converge_percent"] = json!(self.converge_percent);
            ret["close_resolution"] = json!(self.close_resolution.as_secs());
            ret["have_time_consensus"] = json!(self.have_close_time_consensus);
            ret["previous_proposers"] = json!(self.prev_proposers);
            ret["previous_mseconds"] = json!(self.prev_round_time.as_millis() as u64);

            if !self.curr_peer_positions.is_empty() {
                let positions: serde_json::Map<String, serde_json::Value> = self.curr_peer_positions
                    .iter()
                    .map(|(node_id, position)| (format!("{node_id:?}"), position.get_json()))
                    .collect();
                ret["peer_positions"] = serde_json::Value::Object(positions);
            }

            if !self.acquired.is_empty() {
                let mut acquired: Vec<String> = self.acquired.keys().map(|id| format!("{id:?}")).collect();
                acquired.sort();
                ret["acquired"] = json!(acquired);
            }

            if let Some(result) = self.result.as_ref().filter(|result| !result.disputes.is_empty()) {
                let disputes: serde_json::Map<String, serde_json::Value> = result.disputes
                    .iter()
                    .map(|(tx_id, dispute)| (format!("{tx_id:?}"), dispute.get_json()))
                    .collect();
                ret["disputes"] = serde_json::Value::Object(disputes);
            }

            if !self.raw_close_times.peers.is_empty() {
                let close_times: serde_json::Map<String, serde_json::Value> = self.raw_close_times.peers
                    .iter()
                    .map(|(time, count)| (secs_since_epoch(*time).to_string(), json!(count)))
                    .collect();
                ret["close_times"] = serde_json::Value::Object(close_times);
            }

            if !self.dead_nodes.is_empty() {
                let mut dead_nodes: Vec<String> = self.dead_nodes.iter().map(|id| format!("{id:?}")).collect();
                dead_nodes.sort();
                ret["dead_nodes"] = json!(dead_nodes);
            }
        }

        ret
    }

    /// Change our view of the previous ledger.
    fn handle_wrong_ledger(&mut self, ledger_id: LedgerIdOf<A>) -> Result<(), ConsensusError> {
        debug_assert!(ledger_id != self.prev_ledger_id || self.previous_ledger.id() != ledger_id);

        // Stop proposing because we are out of sync
        self.leave_consensus();

        // First time switching to this ledger
        if self.prev_ledger_id != ledger_id {
            self.prev_ledger_id = ledger_id;

            // Clear out state
            if let Some(result) = self.result.as_mut() {
                result.disputes.clear();
                result.compares.clear();
            }

            self.curr_peer_positions.clear();
            self.raw_close_times.peers.clear();
            self.dead_nodes.clear();

            // Get back in sync, this will also recreate disputes
            self.playback_proposals();
        }

        if self.previous_ledger.id() == self.prev_ledger_id {
            return Ok(());
        }

        // we need to switch the ledger we're working from
        match self.adaptor.acquire_ledger(&self.prev_ledger_id) {
            Some(ledger) => {
                info!(ledger = ?self.prev_ledger_id, "Have the consensus ledger");
                self.start_round_internal(self.now, ledger_id, ledger, ConsensusMode::SwitchedLedger)
            }
            None => {
                self.mode.set(ConsensusMode::WrongLedger, &mut self.adaptor);
                Ok(())
            }
        }
    }

    /// Check if our previous ledger matches the network's.
    ///
    /// If the previous ledger differs, we are no longer in sync with the
    /// network and need to bow out/switch modes.
    fn check_ledger(&mut self) -> Result<(), ConsensusError> {
        let net_ledger = self.adaptor.get_prev_ledger(self.prev_ledger_id, &self.previous_ledger, self.mode.get());

        if net_ledger != self.prev_ledger_id {
            warn!(
                phase = %self.phase,
                mode = %self.mode.get(),
                from = ?self.prev_ledger_id,
                to = ?net_ledger,
                "View of consensus changed"
            );
            debug!(state = %self.get_json(true), "State on consensus change");
            self.handle_wrong_ledger(net_ledger)
        } else if self.previous_ledger.id() != self.prev_ledger_id {
            self.handle_wrong_ledger(net_ledger)
        } else {
            Ok(())
        }
    }

    /// If we radically changed our consensus context for some reason, we need
    /// to replay recent proposals so that they're not lost.
    fn playback_proposals(&mut self) {
        let replay: Vec<ProposalOf<A>> = self.recent_peer_positions
            .values()
            .flatten()
            .filter(|position| position.prev_ledger() == self.prev_ledger_id)
            .cloned()
            .collect();

        for position in replay {
            if self.peer_proposal_internal(self.now, position.clone()) {
                self.adaptor.share_position(&position);
            }
        }
    }

    /// Handle pre-close phase.
    ///
    /// In the pre-close phase, the ledger is open as we wait for new
    /// transactions. After enough time has elapsed, we will close the ledger,
    /// switch to the establish phase and start the consensus process.
    fn phase_open(&mut self) -> Result<(), ConsensusError> {
        // it is shortly before ledger close time
        let any_transactions = self.adaptor.has_open_transactions();
        let proposers_closed = self.curr_peer_positions.len();
        let proposers_validated = self.adaptor.proposers_validated(&self.prev_ledger_id);

        self.open_time.tick(self.now);

        // This computes how long since last ledger's close time
        let since_close = {
            let previous_close_correct = self.mode.get() != ConsensusMode::WrongLedger
                && self.previous_ledger.close_agree()
                && self.previous_ledger.close_time()
                    != self.previous_ledger.parent_close_time() + Duration::from_secs(1);

            let last_close_time = if previous_close_correct {
                // use consensus timing
                self.previous_ledger.close_time()
            } else {
                // use the time we saw internally
                self.prev_close_time
            };

            // Zero if our clock is behind the last close
            self.now.duration_since(last_close_time).unwrap_or_default()
        };

        let idle_interval = max(
            self.adaptor.params().ledger_idle_interval(),
            2 * self.previous_ledger.close_time_resolution(),
        );

        // Decide if we should close the ledger
        if should_close_ledger(
            any_transactions,
            self.prev_proposers,
            proposers_closed,
            proposers_validated,
            self.prev_round_time,
            since_close,
            self.open_time.read(),
            idle_interval,
            self.adaptor.params(),
        ) {
            self.close_ledger()?;
        }
        Ok(())
    }

    /// Handle establish phase.
    ///
    /// In the establish phase, the ledger has closed and we work with peers
    /// to reach consensus. Update our position only on the timer, and in this
    /// phase.
    ///
    /// If we have consensus, move to the accepted phase.
    fn phase_establish(&mut self) {
        let params = self.adaptor.params().clone();
        let proposers = self.curr_peer_positions.len();

        // can only establish consensus if we already took a stance
        let Some(result) = self.result.as_mut() else {
            debug_assert!(false, "establish phase without a position");
            return;
        };

        result.round_time.tick(self.now);
        result.proposers = proposers;
        let round_time = result.round_time.read();

        let expected = max(self.prev_round_time, params.av_min_consensus_time()).as_millis().max(1);
        self.converge_percent = (round_time.as_millis() * 100 / expected) as usize;

        // Give everyone a chance to take an initial position
        if round_time < params.ledger_min_consensus() {
            return;
        }

        self.update_our_positions(&params);

        // Nothing to do if we don't have consensus.
        if !self.have_consensus(&params) {
            return;
        }

        if !self.have_close_time_consensus {
            info!("We have TX consensus but not CT consensus");
            return;
        }

        info!(participants = self.curr_peer_positions.len(), "Converge cutoff");

        self.prev_proposers = self.curr_peer_positions.len();
        self.prev_round_time = round_time;
        self.phase = ConsensusPhase::Accepted;
        debug!(seq = self.previous_ledger.seq() + 1, "transitioned to ConsensusPhase::Accepted");

        let consensus_json = self.get_json(true);
        if let Some(result) = self.result.as_ref() {
            self.adaptor.on_accept(
                result,
                &self.previous_ledger,
                self.close_resolution,
                &self.raw_close_times,
                self.mode.get(),
                consensus_json,
            );
        }
    }

    fn close_ledger(&mut self) -> Result<(), ConsensusError> {
        // We should not be closing if we already have a position
        debug_assert!(self.result.is_none());

        let txns = self.adaptor
            .on_close(&self.previous_ledger, self.now, self.mode.get())
            .map_err(|err| {
                error!(seq = self.previous_ledger.seq() + 1, %err, "Unable to build a candidate ledger");
                err
            })?;

        let position = ConsensusProposal::new(
            self.prev_ledger_id,
            SEQ_JOIN,
            txns.id(),
            self.now,
            self.now,
            self.adaptor.node_id(),
        );
        let mut result = ConsensusResult::new(txns, position)?;
        result.round_time.reset(self.now);

        self.phase = ConsensusPhase::Establish;
        debug!(seq = self.previous_ledger.seq() + 1, "transitioned to ConsensusPhase::Establish");
        self.raw_close_times.ours = self.now;

        let txns = result.txns.clone();
        let position = result.position.clone();
        self.result = Some(result);

        // Share the newly created transaction set if we haven't already
        // received it from a peer
        if !self.acquired.contains_key(&txns.id()) {
            self.acquired.insert(txns.id(), txns.clone());
            self.adaptor.share_tx_set(&txns);
        }

        if self.mode.get() == ConsensusMode::Proposing {
            self.adaptor.propose(&position);
        }

        // Create disputes with any peer positions we have transactions for
        let peer_sets: Vec<A::TxSetType> = self.curr_peer_positions
            .values()
            .filter_map(|peer| self.acquired.get(&peer.position()).cloned())
            .collect();
        for tx_set in peer_sets {
            self.create_disputes(&tx_set);
        }
        Ok(())
    }

    /// Adjust our positions to try to agree with other validators.
    fn update_our_positions(&mut self, params: &ConsensusParams) {
        let now = self.now;
        let resolution = self.close_resolution;
        let proposing = self.mode.get() == ConsensusMode::Proposing;

        // We must have a position if we are updating it
        let Some(result) = self.result.as_mut() else {
            return;
        };

        // Compute a cutoff time
        let peer_cutoff = now.checked_sub(params.propose_freshness()).unwrap_or(UNIX_EPOCH);
        let our_cutoff = now.checked_sub(params.propose_interval()).unwrap_or(UNIX_EPOCH);

        // Verify freshness of peer positions and compute close times
        let stale: Vec<A::NodeIdType> = self.curr_peer_positions
            .iter()
            .filter(|(_, position)| position.is_stale(peer_cutoff))
            .map(|(node_id, _)| *node_id)
            .collect();
        for node_id in stale {
            // peer's proposal is stale, so remove it
            warn!(peer = ?node_id, "Removing stale proposal");
            for dispute in result.disputes.values_mut() {
                dispute.un_vote(&node_id);
            }
            self.curr_peer_positions.remove(&node_id);
        }

        let mut close_time_votes: BTreeMap<SystemTime, usize> = BTreeMap::new();
        for position in self.curr_peer_positions.values() {
            *close_time_votes.entry(round_close_time(position.close_time(), resolution)).or_default() += 1;
        }

        // This will stay unseated unless there are any changes
        let mut mutable_set: Option<<A::TxSetType as TxSet>::MutableType> = None;

        // Update votes on disputed transactions
        for (tx_id, dispute) in result.disputes.iter_mut() {
            // Because the threshold for inclusion increases, time can change
            // our position on a dispute
            if dispute.update_vote(self.converge_percent, proposing, params) {
                if mutable_set.is_none() {
                    mutable_set = Some(result.txns.to_mutable());
                }
                if let Some(set) = mutable_set.as_mut() {
                    if dispute.our_vote() {
                        // now a yes
                        set.insert(dispute.tx().clone());
                    } else {
                        // now a no
                        set.erase(tx_id);
                    }
                }
            }
        }

        let mut our_new_set: Option<A::TxSetType> = mutable_set.map(|set| set.freeze());

        let our_close_time = round_close_time(result.position.close_time(), resolution);
        let mut consensus_close_time = UNIX_EPOCH;
        self.have_close_time_consensus = false;

        if self.curr_peer_positions.is_empty() {
            // no other times
            self.have_close_time_consensus = true;
            consensus_close_time = our_close_time;
        } else {
            let needed_weight = params.needed_weight(self.converge_percent);

            let mut participants = self.curr_peer_positions.len();
            if proposing {
                *close_time_votes.entry(our_close_time).or_default() += 1;
                participants += 1;
            }

            // Threshold for non-zero vote
            let mut thresh_vote = participants_needed(participants, needed_weight);

            // Threshold to declare consensus
            let thresh_consensus = participants_needed(participants, params.av_ct_consensus_pct());

            info!(
                proposers = self.curr_peer_positions.len(),
                needed_weight,
                thresh_vote,
                thresh_consensus,
                "Tallying close time votes"
            );

            for (close_time, votes) in &close_time_votes {
                debug!(
                    seq = self.previous_ledger.seq() + 1,
                    close_time = secs_since_epoch(*close_time),
                    votes,
                    required = thresh_vote,
                    "Close time vote"
                );

                if *votes >= thresh_vote {
                    // A close time has enough votes for us to try to agree
                    consensus_close_time = *close_time;
                    thresh_vote = *votes;

                    if thresh_vote >= thresh_consensus {
                        self.have_close_time_consensus = true;
                    }
                }
            }

            if !self.have_close_time_consensus {
                debug!(
                    proposers = self.curr_peer_positions.len(),
                    mode = %self.mode.get(),
                    thresh_consensus,
                    position = secs_since_epoch(consensus_close_time),
                    "No CT consensus"
                );
            }
        }

        if our_new_set.is_none()
            && (consensus_close_time != our_close_time || result.position.is_stale(our_cutoff))
        {
            // close time changed or our position is stale
            our_new_set = Some(result.txns.clone());
        }

        let Some(new_set) = our_new_set else {
            return;
        };

        let new_id = new_set.id();
        result.txns = new_set;

        info!(
            close_time = secs_since_epoch(consensus_close_time),
            tx_set = ?new_id,
            "Position change"
        );
        result.position.change_position(new_id, consensus_close_time, now);

        let bowed_out = result.position.is_bow_out();
        let position = result.position.clone();
        let txns = result.txns.clone();

        // Share our new transaction set and update disputes if we haven't
        // already received it
        if !self.acquired.contains_key(&new_id) {
            self.acquired.insert(new_id, txns.clone());
            if !bowed_out {
                self.adaptor.share_tx_set(&txns);
            }

            let proposers: Vec<A::NodeIdType> = self.curr_peer_positions
                .iter()
                .filter(|(_, peer)| peer.position() == new_id)
                .map(|(node_id, _)| *node_id)
                .collect();
            for node_id in proposers {
                self.update_disputes(node_id, &txns);
            }
        }

        // Share our new position if we are still participating this round
        if !bowed_out && proposing {
            self.adaptor.propose(&position);
        }
    }

    /// Evaluate whether pausing increases likelihood of validation.
    fn have_consensus(&mut self, params: &ConsensusParams) -> bool {
        // Must have a stance if we are checking for consensus
        let Some(result) = self.result.as_ref() else {
            return false;
        };

        let our_position = result.position.position();

        // Count number of agreements/disagreements with our position
        let mut agree = 0;
        let mut disagree = 0;
        for (node_id, peer) in &self.curr_peer_positions {
            if peer.position() == our_position {
                agree += 1;
            } else {
                debug!(peer = ?node_id, position = ?peer.position(), "Peer disagrees");
                disagree += 1;
            }
        }

        let current_finished = self.adaptor.proposers_finished(&self.previous_ledger, &self.prev_ledger_id);

        debug!(agree, disagree, "Checking for TX consensus");

        // Determine if we actually have consensus or not
        let state = check_consensus(
            self.prev_proposers,
            agree + disagree,
            agree,
            current_finished,
            self.prev_round_time,
            result.round_time.read(),
            params,
            self.mode.get() == ConsensusMode::Proposing,
        );

        if let Some(result) = self.result.as_mut() {
            result.state = state;
        }

        match state {
            ConsensusState::No => false,
            ConsensusState::MovedOn => {
                // There is consensus, but we need to track if the network
                // moved on without us.
                error!(state = %self.get_json(true), "Unable to reach consensus");
                true
            }
            ConsensusState::Yes => true,
        }
    }

    /// Revoke our outstanding proposal, if any, and cease proposing at least
    /// until this round ends.
    fn leave_consensus(&mut self) {
        if self.mode.get() != ConsensusMode::Proposing {
            return;
        }

        if let Some(result) = self.result.as_mut() {
            if !result.position.is_bow_out() {
                result.position.bow_out(self.now);
                self.adaptor.propose(&result.position);
            }
        }

        self.mode.set(ConsensusMode::Observing, &mut self.adaptor);
        info!("Bowing out of consensus");
    }

    /// Create disputes between our position and the provided one.
    fn create_disputes(&mut self, other: &A::TxSetType) {
        // Cannot create disputes without our stance
        let Some(result) = self.result.as_mut() else {
            return;
        };

        // Only create disputes if this is a new set
        if !result.compares.insert(other.id()) {
            return;
        }

        // Nothing to dispute if we agree
        if result.txns.id() == other.id() {
            return;
        }

        debug!(ours = ?result.txns.id(), theirs = ?other.id(), "createDisputes");

        let differences = result.txns.compare(other);
        let mut created = 0;
        for (tx_id, in_this_set) in differences {
            // create disputed transactions (from the ledger that has them)
            let tx = if in_this_set {
                result.txns.find(&tx_id)
            } else {
                other.find(&tx_id)
            };
            let Some(tx) = tx else {
                debug_assert!(false, "compare reported a transaction neither set has");
                continue;
            };

            if result.disputes.contains_key(&tx_id) {
                continue;
            }

            debug!(tx = ?tx_id, "Transaction is disputed");

            let mut dispute = DisputedTx::new(tx, result.txns.exists(&tx_id));

            // Update all of the available peer's votes on the disputed
            // transaction
            for (node_id, peer) in &self.curr_peer_positions {
                if let Some(peer_set) = self.acquired.get(&peer.position()) {
                    dispute.set_vote(*node_id, peer_set.exists(&tx_id));
                }
            }

            self.adaptor.share_tx(dispute.tx());
            result.disputes.insert(tx_id, dispute);
            created += 1;
        }

        debug!(created, "differences found");
    }

    /// Update our disputes given that this node has adopted a new position.
    fn update_disputes(&mut self, node_id: A::NodeIdType, other: &A::TxSetType) {
        // Cannot update disputes without our stance
        let Some(result) = self.result.as_ref() else {
            return;
        };

        // Ensure we have created disputes against this set if we haven't seen
        // it before
        if !result.compares.contains(&other.id()) {
            self.create_disputes(other);
        }

        if let Some(result) = self.result.as_mut() {
            for dispute in result.disputes.values_mut() {
                let tx_id = dispute.id();
                dispute.set_vote(node_id, other.exists(&tx_id));
            }
        }
    }
}

/// How many of `participants` make up `percent` of them, rounded to nearest,
/// and never fewer than one.
fn participants_needed(participants: usize, percent: usize) -> usize {
    let result = (participants * percent + percent / 2) / 100;
    if result == 0 {
        1
    } else {
        result
    }
}
