use std::time::Duration;

use serde::Deserialize;

use ledger_consensus_core::duration_millis;

/// Timing parameters to control validation staleness and expiration.
///
/// These are protocol level parameters that should not be changed without
/// careful consideration. They are *not* part of `ConsensusParams` because the
/// validations tracker is usable without running consensus.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ValidationParams {
    /// The duration a validation remains current after its ledger's close time.
    ///
    /// This is a safety to protect against very old validations and the time it
    /// takes to adjust the close time accuracy window.
    #[serde(with = "duration_millis")]
    validation_current_wall: Duration,

    /// Duration a validation remains current after first observed.
    ///
    /// The duration a validation remains current after the time we first saw it.
    /// This provides faster recovery in very rare cases where the number of
    /// validations produced by the network is lower than normal.
    #[serde(with = "duration_millis")]
    validation_current_local: Duration,

    /// Duration pre-close in which validations are acceptable.
    ///
    /// The number of seconds before a close time that we consider a validation
    /// acceptable. This protects against extreme clock errors.
    #[serde(with = "duration_millis")]
    validation_current_early: Duration,

    /// Duration a set of validations for a given ledger hash remain valid.
    ///
    /// The duration before we expire a set of validations for a given ledger
    /// hash or sequence.
    #[serde(with = "duration_millis")]
    validation_set_expires: Duration,

    /// How long we consider a validation fresh.
    ///
    /// The number of seconds since a validation has been seen for it to be
    /// considered to accurately represent a live proposer's most recent
    /// validation.
    #[serde(with = "duration_millis")]
    validation_freshness: Duration,
}

impl Default for ValidationParams {
    fn default() -> Self {
        ValidationParams {
            validation_current_wall: Duration::from_secs(5 * 60),
            validation_current_local: Duration::from_secs(3 * 60),
            validation_current_early: Duration::from_secs(3 * 60),
            validation_set_expires: Duration::from_secs(10 * 60),
            validation_freshness: Duration::from_secs(20),
        }
    }
}

impl ValidationParams {
    /// Parse parameters from JSON, using defaults for any missing field.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn validation_current_wall(&self) -> Duration {
        self.validation_current_wall
    }

    pub fn validation_current_local(&self) -> Duration {
        self.validation_current_local
    }

    pub fn validation_current_early(&self) -> Duration {
        self.validation_current_early
    }

    pub fn validation_set_expires(&self) -> Duration {
        self.validation_set_expires
    }

    pub fn validation_freshness(&self) -> Duration {
        self.validation_freshness
    }
}
