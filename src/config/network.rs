use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::errors::ConsensusError;

/// Default number of peer urls each miner is asked to sample in a peek response
pub const DEFAULT_SAMPLE_MINERS: usize = 16;

/// Delay between scans once the tracker believes it has caught up
pub const DEFAULT_CURRENT_DELAY_MS: u64 = 15_000;

/// Per-probe HTTP timeout
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 10_000;

/// Pause used once several scans in a row got no answers
pub const DEFAULT_IDLE_DELAY_MS: u64 = 250;

/// Consensus tracking configuration, shared by every network of a wallet
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// `sampleMiners` query value sent with each peek probe
    pub sample_miners: usize,

    /// Timeout for a single probe (milliseconds)
    pub probe_timeout_ms: u64,

    /// Scan delay once current (milliseconds)
    pub current_delay_ms: u64,

    /// Scan delay while seeking (milliseconds). Zero means free-running.
    pub seeking_delay_ms: u64,

    /// Pause between rounds once several in a row got no answer (milliseconds)
    pub idle_delay_ms: u64,

    /// Minimum miners at the checkpoint height before a round may decide
    pub threshold: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            sample_miners: DEFAULT_SAMPLE_MINERS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            current_delay_ms: DEFAULT_CURRENT_DELAY_MS,
            seeking_delay_ms: 0,
            idle_delay_ms: DEFAULT_IDLE_DELAY_MS,
            threshold: 1,
        }
    }
}

impl NetworkConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `VOLITION_*` environment overrides on top of `self`
    pub fn with_env_overrides(mut self) -> Self {
        // VOLITION_SAMPLE_MINERS
        if let Some(num) = env_parse::<usize>("VOLITION_SAMPLE_MINERS") {
            self.sample_miners = num;
        }

        // VOLITION_PROBE_TIMEOUT_MS
        if let Some(num) = env_parse::<u64>("VOLITION_PROBE_TIMEOUT_MS") {
            self.probe_timeout_ms = num;
        }

        // VOLITION_CURRENT_DELAY_MS
        if let Some(num) = env_parse::<u64>("VOLITION_CURRENT_DELAY_MS") {
            self.current_delay_ms = num;
        }

        // VOLITION_SEEKING_DELAY_MS
        if let Some(num) = env_parse::<u64>("VOLITION_SEEKING_DELAY_MS") {
            self.seeking_delay_ms = num;
        }

        // VOLITION_IDLE_DELAY_MS
        if let Some(num) = env_parse::<u64>("VOLITION_IDLE_DELAY_MS") {
            self.idle_delay_ms = num;
        }

        // VOLITION_THRESHOLD
        if let Some(num) = env_parse::<u32>("VOLITION_THRESHOLD") {
            self.threshold = num;
        }

        self
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn idle_delay(&self) -> Duration {
        Duration::from_millis(self.idle_delay_ms)
    }

    /// Scan delay that follows a round, given whether the tracker is current
    pub fn next_delay(&self, is_current: bool) -> Duration {
        if is_current {
            Duration::from_millis(self.current_delay_ms)
        } else {
            Duration::from_millis(self.seeking_delay_ms)
        }
    }

    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.sample_miners == 0 {
            return Err(ConsensusError::Config(
                "sample_miners must be at least 1".to_string(),
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(ConsensusError::Config(
                "probe_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.threshold == 0 {
            return Err(ConsensusError::Config(
                "threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}
