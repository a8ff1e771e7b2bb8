//! Application configuration schemas.
//!
//! All configuration structs are deserialized from TOML files via the
//! `config` crate. Each sub-module represents a logical configuration
//! section. Every field has a serde default so a node starts with an
//! empty configuration file.

pub mod logging;
pub mod node;
pub mod presence;
pub mod sentry;
pub mod store;

use serde::{Deserialize, Serialize};

use self::logging::LoggingConfig;
use self::node::NodeConfig;
use self::presence::PresenceConfig;
use self::sentry::SentryConfig;
use self::store::StoreConfig;

use crate::error::AppError;

/// Root application configuration.
///
/// This struct is the top-level deserialization target for the merged
/// TOML configuration files (default.toml + environment overlay).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Node identity and bind address.
    #[serde(default)]
    pub node: NodeConfig,
    /// Shared store settings.
    #[serde(default)]
    pub store: StoreConfig,
    /// Presence engine settings.
    #[serde(default)]
    pub presence: PresenceConfig,
    /// Node liveness (sentry) settings.
    #[serde(default)]
    pub sentry: SentryConfig,
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from TOML files.
    ///
    /// Merges the default configuration with an environment-specific overlay
    /// and environment variables prefixed with `PULSE_` (nested keys
    /// separated by `__`, e.g. `PULSE_STORE__PROVIDER`).
    pub fn load(env: &str) -> Result<Self, AppError> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("PULSE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::configuration(format!("Failed to build config: {e}")))?;

        config
            .try_deserialize()
            .map_err(|e| AppError::configuration(format!("Failed to deserialize config: {e}")))
    }
}
