use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::{MutableTxSet, Tx, TxSet};

/// A simulated transaction, which is just an integer id.
#[derive(Ord, PartialOrd, Eq, PartialEq, Clone, Copy, Hash, Debug)]
pub struct SimTx(pub u32);

impl Tx for SimTx {
    type IdType = u32;

    fn id(&self) -> u32 {
        self.0
    }
}

#[derive(Ord, PartialOrd, Eq, PartialEq, Clone, Copy, Hash, Debug)]
pub struct SimTxSetId(pub u64);

/// An immutable set of simulated transactions whose id is a hash of its content.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SimTxSet {
    id: SimTxSetId,
    txs: Arc<BTreeSet<SimTx>>,
}

impl SimTxSet {
    pub fn new(txs: BTreeSet<SimTx>) -> Self {
        let mut hasher = DefaultHasher::new();
        txs.hash(&mut hasher);
        SimTxSet {
            id: SimTxSetId(hasher.finish()),
            txs: Arc::new(txs),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &SimTx> {
        self.txs.iter()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

impl FromIterator<SimTx> for SimTxSet {
    fn from_iter<I: IntoIterator<Item = SimTx>>(iter: I) -> Self {
        SimTxSet::new(iter.into_iter().collect())
    }
}

impl TxSet for SimTxSet {
    type IdType = SimTxSetId;
    type TxType = SimTx;
    type MutableType = SimMutableTxSet;

    fn id(&self) -> SimTxSetId {
        self.id
    }

    fn exists(&self, tx_id: &u32) -> bool {
        self.txs.contains(&SimTx(*tx_id))
    }

    fn find(&self, tx_id: &u32) -> Option<SimTx> {
        self.txs.get(&SimTx(*tx_id)).copied()
    }

    fn compare(&self, other: &Self) -> BTreeMap<u32, bool> {
        self.txs.symmetric_difference(&other.txs)
            .map(|tx| (tx.0, self.txs.contains(tx)))
            .collect()
    }

    fn to_mutable(&self) -> SimMutableTxSet {
        SimMutableTxSet {
            txs: (*self.txs).clone(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SimMutableTxSet {
    txs: BTreeSet<SimTx>,
}

impl MutableTxSet for SimMutableTxSet {
    type TxSetType = SimTxSet;

    fn insert(&mut self, tx: SimTx) -> bool {
        self.txs.insert(tx)
    }

    fn erase(&mut self, tx_id: &u32) -> bool {
        self.txs.remove(&SimTx(*tx_id))
    }

    fn freeze(self) -> SimTxSet {
        SimTxSet::new(self.txs)
    }
}
