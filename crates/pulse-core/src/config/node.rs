//! Node identity configuration.

use serde::{Deserialize, Serialize};

/// Identity and bind address of this node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name on the liveness protocol. When empty, a random name is
    /// generated at startup.
    #[serde(default)]
    pub name: String,
    /// Host advertised to peers.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port advertised to peers.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7411
}
