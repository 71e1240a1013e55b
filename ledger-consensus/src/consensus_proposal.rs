use std::fmt::Debug;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

/// Sequence value when a peer initially joins consensus.
pub const SEQ_JOIN: u32 = 0;

/// Sequence number when a peer wants to bow out and leave consensus.
pub const SEQ_LEAVE: u32 = 0xffff_ffff;

/// Represents a proposed position taken during a round of consensus.
///
/// During consensus, peers seek agreement on a set of transactions to apply to
/// the prior ledger to generate the next ledger. Each peer takes a position on
/// whether to include or exclude potential transactions. The position on the
/// set of transactions is proposed to its peers as an instance of this type.
///
/// A proposal carries
///
/// * the previous ledger it builds on,
/// * a monotonically increasing sequence number, starting at [`SEQ_JOIN`] and
///   ending at [`SEQ_LEAVE`] once the node bows out,
/// * the position (transaction set id) and proposed close time,
/// * when we last saw it, and the id of the node taking the position.
///
/// `N` is the node id, `L` the ledger id and `P` the position (transaction
/// set id) type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusProposal<N, L, P> {
    prev_ledger: L,
    propose_seq: u32,
    position: P,
    close_time: SystemTime,
    seen_time: SystemTime,
    node_id: N,
}

impl<N, L, P> ConsensusProposal<N, L, P>
where
    N: Copy + Debug,
    L: Copy + Debug + Eq,
    P: Copy + Debug + Eq,
{
    pub fn new(
        prev_ledger: L,
        propose_seq: u32,
        position: P,
        close_time: SystemTime,
        now: SystemTime,
        node_id: N,
    ) -> Self {
        ConsensusProposal {
            prev_ledger,
            propose_seq,
            position,
            close_time,
            seen_time: now,
            node_id,
        }
    }

    pub fn node_id(&self) -> N {
        self.node_id
    }

    /// The proposed transaction set id.
    pub fn position(&self) -> P {
        self.position
    }

    /// The prior accepted ledger this position is based on.
    pub fn prev_ledger(&self) -> L {
        self.prev_ledger
    }

    /// Sequence number of this proposal. Starts at [`SEQ_JOIN`] and increases
    /// with every position change.
    pub fn propose_seq(&self) -> u32 {
        self.propose_seq
    }

    pub fn close_time(&self) -> SystemTime {
        self.close_time
    }

    /// When this position was last updated or seen.
    pub fn seen_time(&self) -> SystemTime {
        self.seen_time
    }

    /// Whether this is the first position taken during the current round.
    pub fn is_initial(&self) -> bool {
        self.propose_seq == SEQ_JOIN
    }

    /// Whether this node left the consensus process.
    pub fn is_bow_out(&self) -> bool {
        self.propose_seq == SEQ_LEAVE
    }

    /// Record that the position was seen again at `now`.
    pub fn set_seen_time(&mut self, now: SystemTime) {
        self.seen_time = now;
    }

    /// Whether this position was last updated at or before `cutoff`.
    pub fn is_stale(&self, cutoff: SystemTime) -> bool {
        self.seen_time <= cutoff
    }

    /// Update the position during the consensus process. This will increment
    /// the proposal's sequence number.
    ///
    /// Returns `false`, leaving the proposal untouched, once the node has
    /// bowed out.
    pub fn change_position(&mut self, new_position: P, new_close_time: SystemTime, now: SystemTime) -> bool {
        if self.is_bow_out() {
            return false;
        }
        self.position = new_position;
        self.close_time = new_close_time;
        self.seen_time = now;
        self.propose_seq += 1;
        true
    }

    /// Leave consensus. Updates the position to indicate the node left.
    pub fn bow_out(&mut self, now: SystemTime) {
        self.seen_time = now;
        self.propose_seq = SEQ_LEAVE;
    }

    /// Snapshot for logs and status reports. Close time is in seconds since
    /// the epoch.
    pub fn get_json(&self) -> serde_json::Value {
        let mut ret = json!({
            "previous_ledger": format!("{:?}", self.prev_ledger),
        });
        if !self.is_bow_out() {
            ret["transaction_hash"] = json!(format!("{:?}", self.position));
        }
        ret["propose_seq"] = json!(self.propose_seq);
        ret["close_time"] = json!(secs_since_epoch(self.close_time));
        ret["peer_id"] = json!(format!("{:?}", self.node_id));
        ret
    }
}

pub(crate) fn secs_since_epoch(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
