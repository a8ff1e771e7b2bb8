//! Sentry — per-node liveness broadcasting and dead-peer detection.
//!
//! Every node persists and publishes a heartbeat carrying an expiration
//! timestamp. Peers overwrite their in-memory record on every message
//! (most-recent write wins; a stale redelivery can only extend apparent
//! liveness until the next sweep corrects it) and periodically sweep the
//! stored hash for records that have lapsed or disappeared.
//!
//! Loss of store connectivity is not handled here: it surfaces as this
//! node's own heartbeat going stale to other nodes, which is the correct
//! self-fencing behavior. Worst-case down-detection latency is
//! `expiry_offset + check_interval`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pulse_core::config::sentry::SentryConfig;
use pulse_core::result::AppResult;
use pulse_core::traits::store::StoreProvider;
use pulse_core::types::id::SentryName;
use pulse_store::keys;

use crate::message::types::SentryMessage;

/// Liveness transition of a node (including this one).
#[derive(Debug, Clone)]
pub enum SentryEvent {
    /// A sentry was observed live for the first time.
    Up {
        /// Node name.
        name: SentryName,
        /// The heartbeat that announced it.
        message: SentryMessage,
    },
    /// A previously-live sentry was determined dead.
    Down {
        /// Node name.
        name: SentryName,
        /// Its last known heartbeat, if any.
        last: Option<SentryMessage>,
    },
}

/// Per-node liveness broadcaster and monitor.
pub struct Sentry {
    name: SentryName,
    host: String,
    port: u16,
    config: SentryConfig,
    store: Arc<dyn StoreProvider>,
    peers: Mutex<HashMap<SentryName, SentryMessage>>,
    events: broadcast::Sender<SentryEvent>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl std::fmt::Debug for Sentry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sentry").field("name", &self.name).finish()
    }
}

impl Sentry {
    /// Create a sentry for this node. Call [`start`](Self::start) to
    /// begin broadcasting and monitoring.
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        config: SentryConfig,
        store: Arc<dyn StoreProvider>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let (shutdown, _) = broadcast::channel(1);
        Self {
            name: name.into(),
            host: host.into(),
            port,
            config,
            store,
            peers: Mutex::new(HashMap::new()),
            events,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// This node's name on the liveness protocol.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribe to up/down notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SentryEvent> {
        self.events.subscribe()
    }

    /// Whether a sentry is currently considered down.
    pub async fn is_down(&self, name: &str) -> bool {
        let now = Utc::now().timestamp_millis();
        match self.peers.lock().await.get(name) {
            Some(record) => record.is_down(now),
            None => true,
        }
    }

    /// Names of all sentries currently considered live.
    pub async fn sentry_names(&self) -> Vec<SentryName> {
        self.peers.lock().await.keys().cloned().collect()
    }

    /// Begin broadcasting this node's liveness and monitoring peers.
    pub async fn start(self: &Arc<Self>) -> AppResult<()> {
        self.running.store(true, Ordering::SeqCst);
        self.publish_heartbeat().await?;
        self.check(Utc::now().timestamp_millis()).await?;

        let mut subscription = self.store.subscribe(&keys::sentry_channel()).await?;
        let sentry = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let listener = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    message = subscription.next() => {
                        let Some(message) = message else { break };
                        match serde_json::from_str::<SentryMessage>(&message.payload) {
                            Ok(heartbeat) => sentry.observe(heartbeat).await,
                            Err(e) => warn!(error = %e, "Dropping malformed sentry heartbeat"),
                        }
                    }
                }
            }
        });

        let sentry = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let ticker = tokio::spawn(async move {
            let mut refresh_tick = tokio::time::interval(sentry.config.refresh_interval());
            let mut check_tick = tokio::time::interval(sentry.config.check_interval());
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = refresh_tick.tick() => {
                        if let Err(e) = sentry.publish_heartbeat().await {
                            // Peers will see this node go stale, which is
                            // the intended failure mode.
                            warn!(name = %sentry.name, error = %e, "Heartbeat refresh failed");
                        }
                    }
                    _ = check_tick.tick() => {
                        if let Err(e) = sentry.check(Utc::now().timestamp_millis()).await {
                            warn!(name = %sentry.name, error = %e, "Sentry check sweep failed");
                        }
                    }
                }
            }
        });

        self.tasks.lock().await.extend([listener, ticker]);
        info!(name = %self.name, "Sentry started");
        Ok(())
    }

    /// Halt broadcasting and monitoring and delete this node's record.
    /// Safe to call while a refresh or check cycle is in flight.
    pub async fn stop(&self) -> AppResult<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.shutdown.send(());
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.store
            .hash_delete(&keys::sentry_hash(), &self.name)
            .await?;
        info!(name = %self.name, "Sentry stopped");
        Ok(())
    }

    /// Persist and publish a fresh heartbeat for this node.
    pub async fn publish_heartbeat(&self) -> AppResult<()> {
        let heartbeat = SentryMessage {
            name: self.name.clone(),
            host: self.host.clone(),
            port: self.port,
            expiration: Utc::now().timestamp_millis() + self.config.expiry_offset_ms(),
        };
        let payload = serde_json::to_string(&heartbeat)?;
        self.store
            .hash_set(&keys::sentry_hash(), &self.name, &payload)
            .await?;
        self.store
            .publish(&keys::sentry_channel(), &payload)
            .await?;
        // The pub/sub echo also lands here, but observing our own
        // heartbeat directly makes the self-up deterministic.
        self.observe(heartbeat).await;
        Ok(())
    }

    /// Fold in a heartbeat received on the liveness channel.
    pub async fn observe(&self, heartbeat: SentryMessage) {
        let mut peers = self.peers.lock().await;
        let name = heartbeat.name.clone();
        let fresh = peers.insert(name.clone(), heartbeat.clone()).is_none();
        drop(peers);
        if fresh {
            debug!(name = %name, "Sentry observed live");
            let _ = self.events.send(SentryEvent::Up {
                name,
                message: heartbeat,
            });
        }
    }

    /// Run one cleanup sweep at the given time.
    ///
    /// Purges stored records whose expiration has lapsed, records known
    /// locally but deleted from the store (the peer stopped cleanly),
    /// and picks up live records this node has not seen yet. Normally
    /// driven by the check ticker.
    pub async fn check(&self, now_ms: i64) -> AppResult<()> {
        let stored = self.store.hash_get_all(&keys::sentry_hash()).await?;

        let mut expired: Vec<SentryName> = Vec::new();
        let mut ups: Vec<SentryMessage> = Vec::new();
        let mut downs: Vec<(SentryName, Option<SentryMessage>)> = Vec::new();
        {
            let mut peers = self.peers.lock().await;
            for (name, raw) in &stored {
                let heartbeat: SentryMessage = match serde_json::from_str(raw) {
                    Ok(heartbeat) => heartbeat,
                    Err(e) => {
                        warn!(name = %name, error = %e, "Dropping malformed sentry record");
                        continue;
                    }
                };
                if heartbeat.is_down(now_ms) {
                    expired.push(name.clone());
                    let last = peers.remove(name).or(Some(heartbeat));
                    downs.push((name.clone(), last));
                } else {
                    match peers.get(name) {
                        Some(known) if known.expiration >= heartbeat.expiration => {}
                        Some(_) => {
                            peers.insert(name.clone(), heartbeat);
                        }
                        None => {
                            peers.insert(name.clone(), heartbeat.clone());
                            ups.push(heartbeat);
                        }
                    }
                }
            }

            // Known locally but gone from the store: the peer stopped
            // and deleted its own record.
            let vanished: Vec<SentryName> = peers
                .keys()
                .filter(|name| **name != self.name && !stored.contains_key(*name))
                .cloned()
                .collect();
            for name in vanished {
                let last = peers.remove(&name);
                downs.push((name, last));
            }
        }

        for name in &expired {
            self.store.hash_delete(&keys::sentry_hash(), name).await?;
        }
        for heartbeat in ups {
            debug!(name = %heartbeat.name, "Sentry observed live");
            let _ = self.events.send(SentryEvent::Up {
                name: heartbeat.name.clone(),
                message: heartbeat,
            });
        }
        for (name, last) in downs {
            info!(name = %name, "Sentry determined down");
            let _ = self.events.send(SentryEvent::Down { name, last });
        }
        Ok(())
    }
}
