//! In-memory store implementation backed by dashmap and tokio broadcast.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use pulse_core::result::AppResult;
use pulse_core::traits::store::{StoreMessage, StoreProvider, StoreSubscription};

/// In-process store provider.
///
/// Clones share the underlying state, so several nodes inside one
/// process (typically tests) observe a single store. TTLs are accepted
/// but not enforced; entries live until deleted.
#[derive(Debug, Clone)]
pub struct MemoryStoreProvider {
    /// Hash key → field map.
    hashes: Arc<DashMap<String, HashMap<String, String>>>,
    /// Channel name → broadcast sender.
    channels: Arc<DashMap<String, broadcast::Sender<StoreMessage>>>,
    /// Buffer size for channels.
    buffer_size: usize,
}

impl MemoryStoreProvider {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            hashes: Arc::new(DashMap::new()),
            channels: Arc::new(DashMap::new()),
            buffer_size: 256,
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<StoreMessage> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer_size).0)
            .clone()
    }
}

impl Default for MemoryStoreProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreProvider for MemoryStoreProvider {
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> AppResult<()> {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> AppResult<HashMap<String, String>> {
        Ok(self
            .hashes
            .get(key)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> AppResult<()> {
        if let Some(mut hash) = self.hashes.get_mut(key) {
            hash.remove(field);
            if hash.is_empty() {
                drop(hash);
                self.hashes.remove(key);
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.hashes.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, _ttl: Duration) -> AppResult<bool> {
        // TTL is not enforced in-process; report whether the key exists
        // so callers observe the same contract as Redis.
        Ok(self.hashes.contains_key(key))
    }

    async fn publish(&self, channel: &str, payload: &str) -> AppResult<()> {
        let message = StoreMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        // A send error only means nobody is subscribed yet.
        let _ = self.sender(channel).send(message);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> AppResult<StoreSubscription> {
        let mut rx = self.sender(channel).subscribe();
        let (tx, out) = mpsc::channel(self.buffer_size);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "In-memory subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(StoreSubscription::new(out))
    }

    async fn health_check(&self) -> AppResult<bool> {
        Ok(true)
    }
}
