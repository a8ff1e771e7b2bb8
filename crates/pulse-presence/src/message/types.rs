//! Client protocol and peer message type definitions.
//!
//! Client-facing shapes (`ClientMessage`, `ServerMessage`) are op-tagged
//! JSON objects; peer shapes (`PresenceUpdate`, `SentryMessage`) travel
//! over the store's pub/sub channels and hashes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use pulse_core::types::id::{ClientId, UserId};

/// Messages sent by a client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Declare a user online or offline in a scope.
    Set {
        /// Target scope.
        to: String,
        /// User id.
        key: UserId,
        /// Opaque user type.
        #[serde(rename = "type", default)]
        user_type: u32,
        /// Requested state.
        value: SetValue,
        /// Arbitrary client payload carried with the presence record.
        #[serde(rename = "userData", default, skip_serializing_if = "Option::is_none")]
        user_data: Option<Value>,
        /// Acknowledgement id echoed back on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
    },
    /// Read the merged online view.
    Get {
        /// Target scope.
        to: String,
        /// Read options.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<GetOptions>,
    },
    /// Read the merged view and subscribe to future transitions.
    Sync {
        /// Target scope.
        to: String,
        /// Read options.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        options: Option<GetOptions>,
    },
    /// Subscribe to transition broadcasts only.
    Subscribe {
        /// Target scope.
        to: String,
        /// Acknowledgement id echoed back on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
    },
    /// Stop receiving transition broadcasts.
    Unsubscribe {
        /// Target scope.
        to: String,
        /// Acknowledgement id echoed back on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
    },
}

/// Requested presence state in a `set` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetValue {
    /// Mark the client online.
    Online,
    /// Mark the client offline (explicit disconnect, no grace period).
    Offline,
}

/// Options for `get`/`sync`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GetOptions {
    /// Response format version; version 2 returns the per-client
    /// breakdown instead of the flat user map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u8>,
}

/// Messages sent by the relay to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A user came online.
    Online {
        /// Scope the transition happened in.
        to: String,
        /// Single-entry map of user id to user type.
        value: HashMap<UserId, u32>,
    },
    /// A user went offline.
    Offline {
        /// Scope the transition happened in.
        to: String,
        /// Single-entry map of user id to user type.
        value: HashMap<UserId, u32>,
    },
    /// One client of a user came online.
    ClientOnline {
        /// Scope the transition happened in.
        to: String,
        /// Client details.
        value: ClientValue,
    },
    /// One client of a user went offline.
    ClientOffline {
        /// Scope the transition happened in.
        to: String,
        /// Client details.
        value: ClientValue,
    },
    /// Reply to `get`/`sync`.
    Get {
        /// Scope that was read.
        to: String,
        /// Merged view; shape depends on the requested version.
        value: Value,
    },
    /// Acknowledgement of a client operation.
    Ack {
        /// The ack id from the originating message.
        value: u64,
    },
    /// Error reply.
    Err {
        /// Error token, e.g. `"auth"`.
        value: String,
        /// The message that caused the error.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin: Option<Value>,
    },
}

/// Client details carried in `client_online`/`client_offline` broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientValue {
    /// User the client belongs to.
    pub user_id: UserId,
    /// Opaque user type.
    pub user_type: u32,
    /// Client id.
    pub client_id: ClientId,
    /// Arbitrary client payload, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data: Option<Value>,
}

/// Per-user entry in the version-2 merged view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineClients {
    /// Opaque user type.
    #[serde(rename = "userType")]
    pub user_type: u32,
    /// Client id → client data for every online client of the user.
    pub clients: HashMap<ClientId, Value>,
}

/// The unit of presence exchanged between nodes over the store.
///
/// Persisted per client in the scope hash and published on the scope
/// channel; every node replays these through identical rules, so the
/// merged view is reconstructible from the store alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    /// User id.
    pub user_id: UserId,
    /// Opaque user type.
    #[serde(default)]
    pub user_type: u32,
    /// Client id.
    pub client_id: ClientId,
    /// Whether the client is online.
    pub online: bool,
    /// Publication timestamp, epoch milliseconds.
    pub at: i64,
    /// Arbitrary client payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_data: Option<Value>,
    /// True when caused by an intentional `set(offline)` rather than a
    /// timeout or grace expiry.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub explicit: bool,
    /// Name of the node that published this update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentry_id: Option<String>,
}

impl PresenceUpdate {
    /// Whether this update is stale beyond the given expiry window.
    pub fn is_expired(&self, now_ms: i64, expiry_ms: i64) -> bool {
        now_ms - self.at > expiry_ms
    }
}

/// A node heartbeat on the liveness channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentryMessage {
    /// Node name.
    pub name: String,
    /// Host the node advertises.
    pub host: String,
    /// Port the node advertises.
    pub port: u16,
    /// Epoch milliseconds until which this heartbeat is valid.
    pub expiration: i64,
}

impl SentryMessage {
    /// Whether the heartbeat has lapsed.
    pub fn is_down(&self, now_ms: i64) -> bool {
        self.expiration <= now_ms
    }
}
