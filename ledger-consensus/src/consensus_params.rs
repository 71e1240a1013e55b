use std::time::Duration;

use serde::Deserialize;

use ledger_consensus_core::duration_millis;

use crate::error::ConsensusError;

/// Consensus algorithm parameters.
///
/// Parameters which control the consensus algorithm. These are not meant to be
/// changed arbitrarily; every field defaults to the value the network runs
/// with, and an operator file only needs to name the fields it overrides.
/// Unknown fields are rejected. Validation freshness lives in
/// `ValidationParams`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsensusParams {
    /// How long we consider a peer proposal to be fresh.
    #[serde(with = "duration_millis")]
    propose_freshness: Duration,

    /// How often we force generating a new proposal to keep ours fresh.
    #[serde(with = "duration_millis")]
    propose_interval: Duration,

    /// The percentage threshold above which we can declare consensus.
    min_consensus_pct: usize,

    /// The duration a ledger may remain idle before closing.
    #[serde(with = "duration_millis")]
    ledger_idle_interval: Duration,

    /// The minimum time we wait to ensure participation.
    #[serde(with = "duration_millis")]
    ledger_min_consensus: Duration,

    /// Minimum time to wait to ensure others have computed the LCL.
    #[serde(with = "duration_millis")]
    ledger_min_close: Duration,

    /// The minimum amount of time to consider the previous round to have taken.
    ///
    /// This ensures that there is an opportunity for a round at each avalanche
    /// threshold even if the previous consensus was very fast. It should be at
    /// least twice the interval between proposals divided by the interval
    /// between mid and late consensus.
    #[serde(with = "duration_millis")]
    av_min_consensus_time: Duration,

    // Avalanche tuning. As a function of the percent this round's duration is
    // of the prior round, we increase the threshold for yes votes to add a
    // transaction to our position.

    /// Percentage of nodes on our UNL that must vote yes.
    av_init_consensus_pct: usize,

    /// Percentage of previous round duration before we advance.
    av_mid_consensus_time: usize,

    /// Percentage of nodes that must vote yes after advancing.
    av_mid_consensus_pct: usize,

    /// Percentage of previous round duration before we advance.
    av_late_consensus_time: usize,

    /// Percentage of nodes that must vote yes after advancing.
    av_late_consensus_pct: usize,

    /// Percentage of previous round duration before we are stuck.
    av_stuck_consensus_time: usize,

    /// Percentage of nodes that must vote yes after we are stuck.
    av_stuck_consensus_pct: usize,

    /// Percentage of nodes required to reach agreement on ledger close time.
    av_ct_consensus_pct: usize,

    /// If fewer than this percentage of the previous round's proposers are
    /// present, wait at least one extra `ledger_min_consensus` before
    /// declaring consensus.
    proposer_drop_pct: usize,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        ConsensusParams {
            propose_freshness: Duration::from_secs(20),
            propose_interval: Duration::from_secs(12),
            min_consensus_pct: 80,
            ledger_idle_interval: Duration::from_secs(15),
            ledger_min_consensus: Duration::from_millis(1950),
            ledger_min_close: Duration::from_secs(2),
            av_min_consensus_time: Duration::from_secs(5),
            av_init_consensus_pct: 50,
            av_mid_consensus_time: 50,
            av_mid_consensus_pct: 65,
            av_late_consensus_time: 85,
            av_late_consensus_pct: 70,
            av_stuck_consensus_time: 200,
            av_stuck_consensus_pct: 95,
            av_ct_consensus_pct: 75,
            proposer_drop_pct: 75,
        }
    }
}

impl ConsensusParams {
    /// Parse parameters from JSON, using defaults for any missing field, and
    /// validate the result.
    pub fn from_json(json: &str) -> Result<Self, ConsensusError> {
        let params: ConsensusParams = serde_json::from_str(json)?;
        params.validate()?;
        Ok(params)
    }

    /// Reject avalanche breakpoints that do not increase and percentages that
    /// cannot be reached.
    pub fn validate(&self) -> Result<(), ConsensusError> {
        if !(self.av_mid_consensus_time < self.av_late_consensus_time
            && self.av_late_consensus_time < self.av_stuck_consensus_time)
        {
            return Err(ConsensusError::InvalidParams(format!(
                "avalanche breakpoints must increase, got {}/{}/{}",
                self.av_mid_consensus_time, self.av_late_consensus_time, self.av_stuck_consensus_time
            )));
        }

        let percentages = [
            ("min_consensus_pct", self.min_consensus_pct),
            ("av_init_consensus_pct", self.av_init_consensus_pct),
            ("av_mid_consensus_pct", self.av_mid_consensus_pct),
            ("av_late_consensus_pct", self.av_late_consensus_pct),
            ("av_stuck_consensus_pct", self.av_stuck_consensus_pct),
            ("av_ct_consensus_pct", self.av_ct_consensus_pct),
            ("proposer_drop_pct", self.proposer_drop_pct),
        ];
        if let Some((name, value)) = percentages.iter().find(|(_, value)| *value > 100) {
            return Err(ConsensusError::InvalidParams(format!("{name} is {value}, above 100")));
        }
        Ok(())
    }

    /// The percentage of yes votes needed to include a transaction (or pick a
    /// close time) when the round has run `percent_time` percent of the
    /// previous round's duration. Never decreases as `percent_time` grows.
    pub fn needed_weight(&self, percent_time: usize) -> usize {
        if percent_time < self.av_mid_consensus_time {
            self.av_init_consensus_pct
        } else if percent_time < self.av_late_consensus_time {
            self.av_mid_consensus_pct
        } else if percent_time < self.av_stuck_consensus_time {
            self.av_late_consensus_pct
        } else {
            self.av_stuck_consensus_pct
        }
    }

    pub fn propose_freshness(&self) -> Duration {
        self.propose_freshness
    }
    pub fn propose_interval(&self) -> Duration {
        self.propose_interval
    }
    pub fn min_consensus_pct(&self) -> usize {
        self.min_consensus_pct
    }
    pub fn ledger_idle_interval(&self) -> Duration {
        self.ledger_idle_interval
    }
    pub fn ledger_min_consensus(&self) -> Duration {
        self.ledger_min_consensus
    }
    pub fn ledger_min_close(&self) -> Duration {
        self.ledger_min_close
    }
    pub fn av_min_consensus_time(&self) -> Duration {
        self.av_min_consensus_time
    }
    pub fn av_init_consensus_pct(&self) -> usize {
        self.av_init_consensus_pct
    }
    pub fn av_mid_consensus_time(&self) -> usize {
        self.av_mid_consensus_time
    }
    pub fn av_mid_consensus_pct(&self) -> usize {
        self.av_mid_consensus_pct
    }
    pub fn av_late_consensus_time(&self) -> usize {
        self.av_late_consensus_time
    }
    pub fn av_late_consensus_pct(&self) -> usize {
        self.av_late_consensus_pct
    }
    pub fn av_stuck_consensus_time(&self) -> usize {
        self.av_stuck_consensus_time
    }
    pub fn av_stuck_consensus_pct(&self) -> usize {
        self.av_stuck_consensus_pct
    }
    pub fn av_ct_consensus_pct(&self) -> usize {
        self.av_ct_consensus_pct
    }
    pub fn proposer_drop_pct(&self) -> usize {
        self.proposer_drop_pct
    }
}
