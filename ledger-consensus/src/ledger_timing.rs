//! Pure timing decisions: when to close the open ledger, how finely close
//! times are rounded, and whether enough peers agree to end a round.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, trace, warn};

use ledger_consensus_core::LedgerIndex;

use crate::consensus_params::ConsensusParams;
use crate::consensus_result::ConsensusState;

/// Possible ledger close time resolutions, finest first.
///
/// Values should not be duplicated.
pub const LEDGER_POSSIBLE_TIME_RESOLUTIONS: [Duration; 6] = [
    Duration::from_secs(10),
    Duration::from_secs(20),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(90),
    Duration::from_secs(120),
];

/// Initial resolution of ledger close time.
pub const LEDGER_DEFAULT_TIME_RESOLUTION: Duration = LEDGER_POSSIBLE_TIME_RESOLUTIONS[2];

/// Close time resolution in the genesis ledger.
pub const LEDGER_GENESIS_TIME_RESOLUTION: Duration = LEDGER_POSSIBLE_TIME_RESOLUTIONS[0];

/// How often we try to make close times more precise after agreeing.
pub const INCREASE_LEDGER_TIME_RESOLUTION_EVERY: LedgerIndex = 8;

/// How often we loosen close times after failing to agree.
pub const DECREASE_LEDGER_TIME_RESOLUTION_EVERY: LedgerIndex = 1;

/// Calculates the close time resolution for the ledger with sequence
/// `ledger_seq`.
///
/// If the previous ledger's close time was agreed upon, we periodically try to
/// step to a finer resolution to see whether we can keep agreeing. If it was
/// not, we step to a coarser resolution so that agreement becomes easier.
/// A `previous_resolution` that is not on the ladder is returned unchanged.
pub fn get_next_ledger_time_resolution(
    previous_resolution: Duration,
    previous_agree: bool,
    ledger_seq: LedgerIndex,
) -> Duration {
    let Some(index) = LEDGER_POSSIBLE_TIME_RESOLUTIONS
        .iter()
        .position(|resolution| *resolution == previous_resolution)
    else {
        return previous_resolution;
    };

    if !previous_agree && ledger_seq % DECREASE_LEDGER_TIME_RESOLUTION_EVERY == 0 {
        if let Some(coarser) = LEDGER_POSSIBLE_TIME_RESOLUTIONS.get(index + 1) {
            return *coarser;
        }
    }

    if previous_agree && ledger_seq % INCREASE_LEDGER_TIME_RESOLUTION_EVERY == 0 && index > 0 {
        return LEDGER_POSSIBLE_TIME_RESOLUTIONS[index - 1];
    }

    previous_resolution
}

/// Calculates the close time for a ledger, given a close time resolution.
///
/// Rounds to the nearest multiple of `close_resolution`, with halves rounding
/// up. `UNIX_EPOCH` stands for "no close time" and is returned unchanged.
pub fn round_close_time(close_time: SystemTime, close_resolution: Duration) -> SystemTime {
    if close_time == UNIX_EPOCH || close_resolution.is_zero() {
        return close_time;
    }

    let since_epoch = close_time.duration_since(UNIX_EPOCH).unwrap_or_default() + close_resolution / 2;
    let nanos = since_epoch.as_nanos();
    let rounded = nanos - nanos % close_resolution.as_nanos();
    UNIX_EPOCH + duration_from_nanos(rounded)
}

/// Calculate the effective ledger close time.
///
/// After adjusting the ledger close time based on the current resolution, also
/// ensure it is sufficiently separated from the prior close time.
pub fn eff_close_time(
    close_time: SystemTime,
    resolution: Duration,
    prior_close_time: SystemTime,
) -> SystemTime {
    if close_time == UNIX_EPOCH {
        return close_time;
    }
    std::cmp::max(
        round_close_time(close_time, resolution),
        prior_close_time + Duration::from_secs(1),
    )
}

fn duration_from_nanos(nanos: u128) -> Duration {
    const NANOS_PER_SEC: u128 = 1_000_000_000;
    Duration::new((nanos / NANOS_PER_SEC) as u64, (nanos % NANOS_PER_SEC) as u32)
}

/// Determines whether the current ledger should close at this time.
///
/// This function should be called when a ledger is open and there is no close
/// in progress, or when a transaction is received and no close is in progress.
///
/// * `any_transactions` - whether any transactions have been received
/// * `prev_proposers` - proposers in the last closing
/// * `proposers_closed` - proposers who have currently closed this ledger
/// * `proposers_validated` - proposers who have validated the last closed ledger
/// * `prev_round_time` - time for the previous ledger to reach consensus
/// * `time_since_prev_close` - time since the previous ledger's (possibly
///   rounded) close time
/// * `open_time` - duration this ledger has been open
/// * `idle_interval` - the network's desired idle interval
pub fn should_close_ledger(
    any_transactions: bool,
    prev_proposers: usize,
    proposers_closed: usize,
    proposers_validated: usize,
    prev_round_time: Duration,
    time_since_prev_close: Duration,
    open_time: Duration,
    idle_interval: Duration,
    params: &ConsensusParams,
) -> bool {
    let ten_minutes = Duration::from_secs(10 * 60);
    if prev_round_time > ten_minutes || time_since_prev_close > ten_minutes {
        // These are unexpected cases, we just close the ledger
        warn!(
            any_transactions,
            prev_proposers,
            proposers_closed,
            since_close_ms = time_since_prev_close.as_millis() as u64,
            prev_round_ms = prev_round_time.as_millis() as u64,
            "Closing ledger after unexpected timing"
        );
        return true;
    }

    if proposers_closed + proposers_validated > prev_proposers / 2 {
        // If more than half of the network has closed, we close
        trace!("Others have closed");
        return true;
    }

    if !any_transactions {
        // Only close at the end of the idle interval
        return time_since_prev_close >= idle_interval;
    }

    // Preserve minimum ledger open time
    if open_time < params.ledger_min_close() {
        debug!("Must wait minimum time before closing");
        return false;
    }

    // Don't let this ledger close more than twice as fast as the previous
    // ledger reached consensus so that slower validators can slow down the
    // network
    if open_time < prev_round_time / 2 {
        debug!("Ledger has not been open long enough");
        return false;
    }

    true
}

/// Determine whether the network reached consensus and whether we joined.
///
/// * `agreeing` - number of peers that agree with our position
/// * `total` - number of peers with a position
/// * `count_self` - whether to count ourselves as a proposer
/// * `min_consensus_pct` - percentage of agreement required
pub fn check_consensus_reached(
    agreeing: usize,
    total: usize,
    count_self: bool,
    min_consensus_pct: usize,
) -> bool {
    // If we are alone, we have a consensus
    if total == 0 {
        return true;
    }

    let (agreeing, total) = if count_self {
        (agreeing + 1, total + 1)
    } else {
        (agreeing, total)
    };

    agreeing * 100 / total >= min_consensus_pct
}

/// Determine whether the network reached consensus and whether we joined.
///
/// * `prev_proposers` - proposers in the last closing (not including us)
/// * `current_proposers` - proposers in this closing so far (not including us)
/// * `current_agree` - proposers who agree with us
/// * `current_finished` - proposers who have validated a ledger after this one
/// * `previous_agree_time` - how long, in milliseconds, it took to agree on the
///   last ledger
/// * `current_agree_time` - how long we've been trying to agree
/// * `proposing` - whether we should count ourselves
pub fn check_consensus(
    prev_proposers: usize,
    current_proposers: usize,
    current_agree: usize,
    current_finished: usize,
    previous_agree_time: Duration,
    current_agree_time: Duration,
    params: &ConsensusParams,
    proposing: bool,
) -> ConsensusState {
    trace!(
        current_proposers,
        prev_proposers,
        current_agree,
        current_finished,
        current_ms = current_agree_time.as_millis() as u64,
        previous_ms = previous_agree_time.as_millis() as u64,
        "checkConsensus"
    );

    if current_agree_time <= params.ledger_min_consensus() {
        return ConsensusState::No;
    }

    if current_proposers < prev_proposers * params.proposer_drop_pct() / 100 {
        // Less than 3/4 of the last ledger's proposers are present; don't
        // rush: we may need more time.
        if current_agree_time < previous_agree_time + params.ledger_min_consensus() {
            trace!("too fast, not enough proposers");
            return ConsensusState::No;
        }
    }

    // Have we, together with the nodes on our UNL list, reached the threshold
    // to declare consensus?
    if check_consensus_reached(current_agree, current_proposers, proposing, params.min_consensus_pct()) {
        debug!("normal consensus");
        return ConsensusState::Yes;
    }

    // Have sufficient nodes on our UNL list moved on and reached the threshold
    // to declare consensus?
    if check_consensus_reached(current_finished, current_proposers, false, params.min_consensus_pct()) {
        warn!("We see no consensus, but 80% of nodes have moved on");
        return ConsensusState::MovedOn;
    }

    trace!("no consensus");
    ConsensusState::No
}
