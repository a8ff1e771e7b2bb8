//! Presence engine configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Presence engine configuration.
///
/// The message expiry window must be comfortably larger than the
/// autopublish interval so one or two missed republications do not make
/// a genuinely connected client appear offline to peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Seconds an ungracefully disconnected client may reconnect before
    /// the user is finalized offline.
    #[serde(default = "default_grace_window")]
    pub grace_window_seconds: u64,
    /// Seconds after which a stored or received presence message is
    /// considered stale and treated as offline.
    #[serde(default = "default_message_expiry")]
    pub message_expiry_seconds: u64,
    /// Seconds between republications of locally connected clients.
    #[serde(default = "default_autopublish_interval")]
    pub autopublish_interval_seconds: u64,
    /// Seconds between grace queue sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
    /// TTL in seconds applied to each scope hash on every write, so
    /// abandoned scopes age out of the store.
    #[serde(default = "default_scope_ttl")]
    pub scope_ttl_seconds: u64,
}

impl PresenceConfig {
    /// Grace window in milliseconds.
    pub fn grace_window_ms(&self) -> i64 {
        self.grace_window_seconds as i64 * 1000
    }

    /// Message expiry window in milliseconds.
    pub fn message_expiry_ms(&self) -> i64 {
        self.message_expiry_seconds as i64 * 1000
    }

    /// Autopublish interval as a [`Duration`].
    pub fn autopublish_interval(&self) -> Duration {
        Duration::from_secs(self.autopublish_interval_seconds)
    }

    /// Sweep interval as a [`Duration`].
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    /// Scope TTL as a [`Duration`].
    pub fn scope_ttl(&self) -> Duration {
        Duration::from_secs(self.scope_ttl_seconds)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            grace_window_seconds: default_grace_window(),
            message_expiry_seconds: default_message_expiry(),
            autopublish_interval_seconds: default_autopublish_interval(),
            sweep_interval_seconds: default_sweep_interval(),
            scope_ttl_seconds: default_scope_ttl(),
        }
    }
}

fn default_grace_window() -> u64 {
    15
}

fn default_message_expiry() -> u64 {
    45
}

fn default_autopublish_interval() -> u64 {
    15
}

fn default_sweep_interval() -> u64 {
    1
}

fn default_scope_ttl() -> u64 {
    900
}
