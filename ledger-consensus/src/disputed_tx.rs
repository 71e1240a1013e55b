use std::collections::BTreeMap;
use std::fmt::Debug;

use serde_json::json;
use tracing::debug;

use ledger_consensus_core::Tx;

use crate::consensus_params::ConsensusParams;

/// A transaction discovered to be in dispute during consensus.
///
/// During consensus, a `DisputedTx` is created when a transaction is
/// discovered to be disputed. The object persists only as long as the dispute.
///
/// Undisputed transactions have no corresponding `DisputedTx` object.
///
/// Refer to [`DisputedTx::update_vote`] for details on how disputes are
/// resolved.
#[derive(Debug, Clone)]
pub struct DisputedTx<T, N> {
    yays: usize,
    nays: usize,
    our_vote: bool,
    tx: T,
    votes: BTreeMap<N, bool>,
}

impl<T, N> DisputedTx<T, N>
where
    T: Tx,
    N: Ord + Copy + Debug,
{
    /// Create a dispute over `tx`, which we do (`our_vote`) or do not currently
    /// want included.
    pub fn new(tx: T, our_vote: bool) -> Self {
        DisputedTx {
            yays: 0,
            nays: 0,
            our_vote,
            tx,
            votes: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> T::IdType {
        self.tx.id()
    }

    pub fn our_vote(&self) -> bool {
        self.our_vote
    }

    pub fn tx(&self) -> &T {
        &self.tx
    }

    pub fn yays(&self) -> usize {
        self.yays
    }

    pub fn nays(&self) -> usize {
        self.nays
    }

    /// Change our vote.
    pub fn set_our_vote(&mut self, vote: bool) {
        self.our_vote = vote;
    }

    /// Change a peer's vote.
    pub fn set_vote(&mut self, peer: N, votes_yes: bool) {
        match self.votes.insert(peer, votes_yes) {
            // new vote
            None => {
                debug!(?peer, tx = ?self.tx.id(), yes = votes_yes, "Peer votes");
                if votes_yes {
                    self.yays += 1;
                } else {
                    self.nays += 1;
                }
            }
            // changes vote to yes
            Some(false) if votes_yes => {
                self.nays -= 1;
                self.yays += 1;
            }
            // changes vote to no
            Some(true) if !votes_yes => {
                self.yays -= 1;
                self.nays += 1;
            }
            Some(_) => {}
        }
    }

    /// Remove a peer's vote.
    pub fn un_vote(&mut self, peer: &N) {
        match self.votes.remove(peer) {
            Some(true) => self.yays -= 1,
            Some(false) => self.nays -= 1,
            None => {}
        }
    }

    /// Update our vote given progression of consensus.
    ///
    /// Updates our vote on this disputed transaction based on our peers'
    /// votes and how far along consensus has proceeded.
    ///
    /// * `percent_time` - percentage progress through consensus, e.g. 50%
    ///   through or 90%.
    /// * `proposing` - whether we are proposing to our peers in this round.
    ///
    /// Returns whether our vote changed.
    pub fn update_vote(&mut self, percent_time: usize, proposing: bool, params: &ConsensusParams) -> bool {
        if self.our_vote && self.nays == 0 {
            return false;
        }
        if !self.our_vote && self.yays == 0 {
            return false;
        }

        let (new_position, weight) = if proposing {
            // This is basically the percentage of nodes voting 'yes'
            // (including us)
            let weight = (self.yays * 100 + if self.our_vote { 100 } else { 0 }) / (self.nays + self.yays + 1);

            // To prevent avalanche stalls, we increase the needed weight
            // slightly over time.
            (weight > params.needed_weight(percent_time), Some(weight))
        } else {
            // don't let us outweigh a proposing node, just recognize consensus
            (self.yays > self.nays, None)
        };

        if new_position == self.our_vote {
            debug!(
                vote = self.our_vote,
                ?weight,
                percent_time,
                tx = ?self.tx.id(),
                "No change in dispute vote"
            );
            return false;
        }

        self.our_vote = new_position;
        debug!(vote = self.our_vote, tx = ?self.tx.id(), json = %self.get_json(), "We now vote");
        true
    }

    pub fn get_json(&self) -> serde_json::Value {
        let mut ret = json!({
            "yays": self.yays,
            "nays": self.nays,
            "our_vote": self.our_vote,
        });
        if !self.votes.is_empty() {
            let votes: serde_json::Map<String, serde_json::Value> = self.votes
                .iter()
                .map(|(node_id, vote)| (format!("{node_id:?}"), json!(vote)))
                .collect();
            ret["votes"] = serde_json::Value::Object(votes);
        }
        ret
    }
}
