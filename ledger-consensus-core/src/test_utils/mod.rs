//! Simulated ledgers, transaction sets, validations and clocks for tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::NetClock;

pub mod ledgers;
pub mod tx_set;
pub mod validation;

/// Where every `ManualClock` starts, in seconds after `UNIX_EPOCH`.
pub const CLOCK_START_SECS: u64 = 86_400;

/// A clock that only moves when told to. Shareable across threads.
#[derive(Debug)]
pub struct ManualClock {
    nanos_since_epoch: AtomicU64,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(UNIX_EPOCH + Duration::from_secs(CLOCK_START_SECS))
    }

    pub fn starting_at(start: SystemTime) -> Self {
        let nanos = start.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as u64;
        ManualClock {
            nanos_since_epoch: AtomicU64::new(nanos),
        }
    }

    pub fn advance(&self, dur: Duration) {
        self.nanos_since_epoch.fetch_add(dur.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl NetClock for ManualClock {
    fn now(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.nanos_since_epoch.load(Ordering::SeqCst))
    }
}
