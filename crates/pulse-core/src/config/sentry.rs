//! Node liveness (sentry) configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Sentry heartbeat and peer monitoring configuration.
///
/// Worst-case detection latency for a dead peer is approximately
/// `expiry_offset_seconds + check_interval_seconds`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentryConfig {
    /// Seconds between republications of this node's heartbeat.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,
    /// Seconds between dead-peer sweeps.
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    /// Seconds of validity granted by each heartbeat; a peer whose last
    /// heartbeat is older than this is down.
    #[serde(default = "default_expiry_offset")]
    pub expiry_offset_seconds: u64,
}

impl SentryConfig {
    /// Refresh interval as a [`Duration`].
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }

    /// Check interval as a [`Duration`].
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    /// Expiry offset in milliseconds.
    pub fn expiry_offset_ms(&self) -> i64 {
        self.expiry_offset_seconds as i64 * 1000
    }
}

impl Default for SentryConfig {
    fn default() -> Self {
        Self {
            refresh_interval_seconds: default_refresh_interval(),
            check_interval_seconds: default_check_interval(),
            expiry_offset_seconds: default_expiry_offset(),
        }
    }
}

fn default_refresh_interval() -> u64 {
    10
}

fn default_check_interval() -> u64 {
    30
}

fn default_expiry_offset() -> u64 {
    60
}
