use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bimap::BiMap;
use derivative::Derivative;
use once_cell::sync::Lazy;

use crate::{Ledger, LedgerIndex};
use crate::test_utils::tx_set::{SimTx, SimTxSet};

#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Hash, Debug)]
pub struct LedgerId(pub u32);

#[derive(Derivative)]
#[derivative(Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Debug)]
pub struct LedgerInstance {
    seq: LedgerIndex,
    txs: Vec<SimTx>,
    close_time_resolution: Duration,
    close_time: SystemTime,
    close_time_agree: bool,
    parent_id: LedgerId,
    parent_close_time: SystemTime,
    /// IDs of this ledgers ancestors. Since each ledger already has unique
    /// ancestors based on the parent_id, this member is not needed for any
    /// operations such as Hash or ordering.
    #[derivative(Hash = "ignore")]
    #[derivative(PartialEq = "ignore")]
    #[derivative(Ord = "ignore")]
    #[derivative(PartialOrd = "ignore")]
    ancestors: Vec<LedgerId>,
}

static GENESIS: Lazy<LedgerInstance> = Lazy::new(|| {
    LedgerInstance {
        seq: 0,
        txs: vec![],
        close_time_resolution: Duration::from_secs(30),
        close_time: UNIX_EPOCH,
        close_time_agree: true,
        parent_id: LedgerId(0),
        parent_close_time: UNIX_EPOCH,
        ancestors: vec![],
    }
});

/// A ledger is a set of observed transactions and a sequence number
/// identifying the ledger.
///
/// Peers in the consensus process are trying to agree on a set of transactions
/// to include in a ledger. For simulation, each transaction is a single
/// integer and the ledger is the set of observed integers. This means future
/// ledgers have prior ledgers as subsets, e.g.
///
/// Ledger 0 :  {}
/// Ledger 1 :  {1,4,5}
/// Ledger 2 :  {1,2,4,5,10}
/// ....
///
/// Ledgers are immutable value types. All ledgers with the same sequence
/// number, transactions, close time, etc. will have the same ledger ID. The
/// `LedgerOracle` below manages ID assignments for a simulation and is the
/// only way to close and create a new ledger. Since the parent ledger ID is
/// part of the type, ledgers with distinct histories have distinct ids, even
/// if they have the same set of transactions, sequence number and close time.
#[derive(Eq, PartialEq, Ord, PartialOrd, Clone, Debug, Hash)]
pub struct SimulatedLedger {
    instance: Arc<LedgerInstance>,
    id: LedgerId,
}

impl SimulatedLedger {
    pub fn genesis() -> Self {
        SimulatedLedger {
            instance: Arc::new(GENESIS.clone()),
            id: LedgerId(0),
        }
    }

    fn new(id: LedgerId, instance: Arc<LedgerInstance>) -> Self {
        SimulatedLedger { id, instance }
    }

    pub fn txs(&self) -> &[SimTx] {
        &self.instance.txs
    }
}

impl Ledger for SimulatedLedger {
    type IdType = LedgerId;

    fn id(&self) -> Self::IdType {
        self.id
    }

    fn seq(&self) -> LedgerIndex {
        self.instance.seq
    }

    fn get_ancestor(&self, seq: LedgerIndex) -> Self::IdType {
        assert!(seq <= self.seq(), "ancestor {} requested of ledger {}", seq, self.seq());
        if seq == self.seq() {
            return self.id();
        }

        self.instance.ancestors[seq as usize]
    }

    fn make_genesis() -> Self {
        SimulatedLedger::genesis()
    }

    fn mismatch(&self, other: &Self) -> LedgerIndex {
        let mut start = 0;
        let end = std::cmp::min(self.seq() + 1, other.seq() + 1);

        // Binary search for the first differing ancestor
        let mut count = end - start;
        while count > 0 {
            let step = count / 2;
            let mut curr = start + step;
            if self.get_ancestor(curr) == other.get_ancestor(curr) {
                curr += 1;
                start = curr;
                count -= step + 1;
            } else {
                count = step;
            }
        }

        start
    }

    fn parent_id(&self) -> Self::IdType {
        self.instance.parent_id
    }

    fn close_time(&self) -> SystemTime {
        self.instance.close_time
    }

    fn parent_close_time(&self) -> SystemTime {
        self.instance.parent_close_time
    }

    fn close_time_resolution(&self) -> Duration {
        self.instance.close_time_resolution
    }

    fn close_agree(&self) -> bool {
        self.instance.close_time_agree
    }
}

/// Oracle maintaining unique ledgers for a simulation.
#[derive(Debug, Clone)]
pub struct LedgerOracle {
    instances: BiMap<Arc<LedgerInstance>, LedgerId>,
}

impl Default for LedgerOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerOracle {
    pub fn new() -> Self {
        let mut instances = BiMap::new();
        instances.insert(Arc::new(GENESIS.clone()), LedgerId(0));
        LedgerOracle { instances }
    }

    pub fn lookup(&self, id: &LedgerId) -> Option<SimulatedLedger> {
        self.instances.get_by_right(id)
            .map(|instance| SimulatedLedger::new(*id, instance.clone()))
    }

    /// Close a new ledger on top of `parent` containing `txs`. A `consensus_close_time`
    /// of `UNIX_EPOCH` means the network did not agree on a close time.
    pub fn accept_with_times(
        &mut self,
        parent: &SimulatedLedger,
        txs: &SimTxSet,
        close_time_resolution: Duration,
        consensus_close_time: SystemTime,
    ) -> SimulatedLedger {
        let mut next_txs = parent.txs().to_vec();
        next_txs.extend(txs.iter().copied());
        let close_time_agree = consensus_close_time != UNIX_EPOCH;
        let mut next_ancestors = parent.instance.ancestors.clone();
        next_ancestors.push(parent.id());
        let next = Arc::new(LedgerInstance {
            seq: parent.seq() + 1,
            txs: next_txs,
            close_time_resolution,
            close_time: if close_time_agree {
                effective_close_time(consensus_close_time, close_time_resolution, parent.close_time())
            } else {
                parent.close_time() + Duration::from_secs(1)
            },
            close_time_agree,
            parent_id: parent.id(),
            parent_close_time: parent.close_time(),
            ancestors: next_ancestors,
        });

        let id = match self.instances.get_by_left(&next) {
            Some(id) => *id,
            None => {
                let id = self.next_id();
                self.instances.insert(next.clone(), id);
                id
            }
        };
        SimulatedLedger::new(id, next)
    }

    pub fn accept(&mut self, curr: &SimulatedLedger, tx: SimTx) -> SimulatedLedger {
        self.accept_with_times(
            curr,
            &SimTxSet::from_iter([tx]),
            curr.close_time_resolution(),
            curr.close_time() + Duration::from_secs(1),
        )
    }

    /// The number of distinct branches among `ledgers`.
    pub fn branches(&self, ledgers: &HashSet<SimulatedLedger>) -> usize {
        // Tips always maintains the Ledgers with largest sequence number
        // along all known chains.
        let mut tips: Vec<SimulatedLedger> = Vec::with_capacity(ledgers.len());

        for ledger in ledgers {
            // Three options,
            //  1. ledger is on a new branch
            //  2. ledger is on a branch that we have seen tip for
            //  3. ledger is the new tip for a branch
            let mut found = false;
            for tip in tips.iter_mut() {
                let (earlier, later) = if tip.seq() < ledger.seq() {
                    (&*tip, ledger)
                } else {
                    (ledger, &*tip)
                };

                if later.is_ancestor(earlier) || later == earlier {
                    *tip = later.clone();
                    found = true;
                    break;
                }
            }

            if !found {
                tips.push(ledger.clone());
            }
        }

        tips.len()
    }

    fn next_id(&self) -> LedgerId {
        LedgerId(self.instances.len() as u32)
    }
}

fn effective_close_time(close_time: SystemTime, resolution: Duration, prior_close_time: SystemTime) -> SystemTime {
    if close_time == UNIX_EPOCH {
        return close_time;
    }

    let since_epoch = close_time.duration_since(UNIX_EPOCH).unwrap_or_default() + resolution / 2;
    let rounded = since_epoch.as_nanos() - since_epoch.as_nanos() % resolution.as_nanos().max(1);
    std::cmp::max(
        UNIX_EPOCH + Duration::from_nanos(rounded as u64),
        prior_close_time + Duration::from_secs(1),
    )
}

/// Builds ledger histories from strings, where each character is a ledger and
/// each prefix its ancestry, e.g. "abc" is a child of "ab".
#[derive(Debug)]
pub struct LedgerHistoryHelper {
    oracle: LedgerOracle,
    next_tx: u32,
    ledgers: HashMap<String, SimulatedLedger>,
    seen: HashSet<char>,
}

impl Default for LedgerHistoryHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerHistoryHelper {
    pub fn new() -> Self {
        let mut ledgers = HashMap::new();
        ledgers.insert(String::new(), SimulatedLedger::genesis());
        LedgerHistoryHelper {
            oracle: LedgerOracle::new(),
            next_tx: 0,
            ledgers,
            seen: HashSet::new(),
        }
    }

    pub fn get_or_create(&mut self, s: &str) -> SimulatedLedger {
        if let Some(ledger) = self.ledgers.get(s) {
            return ledger.clone();
        }

        // Every ledger name must be unique in its last character.
        assert!(self.seen.insert(s.chars().last().unwrap()));
        let parent = self.get_or_create(&s[0..s.len() - 1]);
        self.next_tx += 1;
        let new_ledger = self.oracle.accept(&parent, SimTx(self.next_tx));
        self.ledgers.insert(s.to_string(), new_ledger.clone());
        new_ledger
    }

    pub fn oracle(&self) -> &LedgerOracle {
        &self.oracle
    }

    pub fn oracle_mut(&mut self) -> &mut LedgerOracle {
        &mut self.oracle
    }

    pub fn into_oracle(self) -> LedgerOracle {
        self.oracle
    }
}
