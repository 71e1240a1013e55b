/// A transaction id together with the first round it was proposed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TxIdSeq<I, S> {
    pub tx_id: I,
    pub seq: S,
}

impl<I, S> TxIdSeq<I, S> {
    pub fn new(tx_id: I, seq: S) -> Self {
        TxIdSeq { tx_id, seq }
    }
}

/// Tracks transactions we keep proposing that never make it into a ledger.
///
/// Every round we propose, the detector is told which transactions we put
/// forward. Entries remember the round in which a transaction was first
/// proposed, so once the round completes the caller can decide how long is
/// too long for a transaction to be left out.
#[derive(Debug, Clone)]
pub struct CensorshipDetector<I, S> {
    tracker: Vec<TxIdSeq<I, S>>,
}

impl<I, S> Default for CensorshipDetector<I, S> {
    fn default() -> Self {
        CensorshipDetector { tracker: Vec::new() }
    }
}

impl<I: Ord, S: Ord + Copy> CensorshipDetector<I, S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add transactions being proposed for the current consensus round.
    ///
    /// Transactions we were already tracking keep the sequence at which they
    /// were first proposed; anything we no longer propose is forgotten.
    pub fn propose(&mut self, mut proposed: Vec<TxIdSeq<I, S>>) {
        proposed.sort();

        let mut tracked = self.tracker.iter().peekable();
        for entry in proposed.iter_mut() {
            while tracked.next_if(|old| old.tx_id < entry.tx_id).is_some() {}
            if let Some(old) = tracked.next_if(|old| old.tx_id == entry.tx_id) {
                entry.seq = old.seq;
            }
        }

        self.tracker = proposed;
    }

    /// Determine which transactions made it and perform censorship detection.
    ///
    /// This function is called when the server is proposing and a consensus
    /// round it participated in completed.
    ///
    /// Entries for `accepted` transactions are dropped. `pred` is invoked for
    /// every transaction we proposed that has not made it yet, with the
    /// sequence it was first proposed at; returning `true` stops tracking it.
    pub fn check<P>(&mut self, mut accepted: Vec<I>, mut pred: P)
    where
        P: FnMut(&I, S) -> bool,
    {
        accepted.sort();

        let mut accepted = accepted.iter().peekable();
        self.tracker.retain(|entry| {
            while accepted.next_if(|id| **id < entry.tx_id).is_some() {}
            let made_it = accepted.peek().map_or(false, |id| **id == entry.tx_id);
            !made_it && !pred(&entry.tx_id, entry.seq)
        });
    }

    /// Removes all elements from the tracker.
    ///
    /// Typically called after we reconnect to the network following an
    /// outage, or after we start tracking the network.
    pub fn reset(&mut self) {
        self.tracker.clear();
    }

    /// Entries currently tracked, sorted by transaction id.
    pub fn tracked(&self) -> &[TxIdSeq<I, S>] {
        &self.tracker
    }
}
