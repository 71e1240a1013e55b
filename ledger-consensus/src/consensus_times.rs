use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Raw close time observations for a round: what each peer proposed and what
/// we saw ourselves when we closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusCloseTimes {
    /// Close time estimates, keep ordered for predictable traverse
    pub peers: BTreeMap<SystemTime, usize>,
    /// Our close time estimate. `UNIX_EPOCH` until we close.
    pub ours: SystemTime,
}

impl Default for ConsensusCloseTimes {
    fn default() -> Self {
        ConsensusCloseTimes {
            peers: BTreeMap::new(),
            ours: UNIX_EPOCH,
        }
    }
}

impl ConsensusCloseTimes {
    /// Count one more peer reporting `close_time`.
    pub fn record_peer(&mut self, close_time: SystemTime) {
        *self.peers.entry(close_time).or_default() += 1;
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.ours = UNIX_EPOCH;
    }
}

/// Measures how long a phase has been running, against the network time
/// handed to each consensus entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusTimer {
    start: SystemTime,
    duration: Duration,
}

impl Default for ConsensusTimer {
    fn default() -> Self {
        ConsensusTimer {
            start: UNIX_EPOCH,
            duration: Duration::ZERO,
        }
    }
}

impl ConsensusTimer {
    pub fn read(&self) -> Duration {
        self.duration
    }

    /// Advance by a fixed amount, regardless of the start time.
    pub fn tick_duration(&mut self, fixed: Duration) {
        self.duration += fixed;
    }

    pub fn reset(&mut self, time_point: SystemTime) {
        self.start = time_point;
        self.duration = Duration::ZERO;
    }

    /// Set the elapsed time to `time_point - start`, or zero if the clock
    /// went backwards.
    pub fn tick(&mut self, time_point: SystemTime) {
        self.duration = time_point.duration_since(self.start).unwrap_or_default();
    }
}
