//! Store provider trait for the shared presence substrate.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::result::AppResult;

/// A single message delivered on a subscribed channel.
#[derive(Debug, Clone)]
pub struct StoreMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw payload as published.
    pub payload: String,
}

/// Receiving half of a channel subscription.
///
/// Delivery is at-least-once and ordered per publisher. Dropping the
/// subscription ends it.
#[derive(Debug)]
pub struct StoreSubscription {
    receiver: mpsc::Receiver<StoreMessage>,
}

impl StoreSubscription {
    /// Wraps a receiver produced by a store backend.
    pub fn new(receiver: mpsc::Receiver<StoreMessage>) -> Self {
        Self { receiver }
    }

    /// Waits for the next message. Returns `None` once the backend closes
    /// the subscription.
    pub async fn next(&mut self) -> Option<StoreMessage> {
        self.receiver.recv().await
    }
}

/// Trait for the shared key-value / pub-sub store behind every node.
///
/// Presence state is persisted in hashes (one hash per scope, one field
/// per client) and propagated live via pub/sub channels. All nodes of a
/// cluster must point at the same store.
#[async_trait]
pub trait StoreProvider: Send + Sync + std::fmt::Debug + 'static {
    /// Set one field of a hash, creating the hash if needed.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> AppResult<()>;

    /// Read an entire hash. A missing key returns an empty map.
    async fn hash_get_all(&self, key: &str) -> AppResult<HashMap<String, String>>;

    /// Delete one field of a hash.
    async fn hash_delete(&self, key: &str, field: &str) -> AppResult<()>;

    /// Delete a key outright.
    async fn delete(&self, key: &str) -> AppResult<()>;

    /// Set the TTL on an existing key. Returns `false` if the key does
    /// not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool>;

    /// Publish a payload to a channel.
    async fn publish(&self, channel: &str, payload: &str) -> AppResult<()>;

    /// Subscribe to a channel.
    async fn subscribe(&self, channel: &str) -> AppResult<StoreSubscription>;

    /// Check that the store backend is reachable.
    async fn health_check(&self) -> AppResult<bool>;
}
