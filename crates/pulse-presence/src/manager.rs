//! Presence manager — the per-scope reconciliation engine.
//!
//! Combines locally connected clients, remotely published knowledge and
//! the grace queue into one consistent online/offline view. This is the
//! sole authority for `user_online` / `user_offline` / `client_online` /
//! `client_offline` notifications: every transition is emitted exactly
//! once, no matter how many code paths observe it.
//!
//! All state for a scope lives behind one mutex; the store and the
//! timers are the only asynchronous boundaries. Remote messages are
//! folded in with apply-if-newer semantics keyed by their `at`
//! timestamp, so redelivery and cross-node races resolve without any
//! global ordering.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pulse_core::config::presence::PresenceConfig;
use pulse_core::result::AppResult;
use pulse_core::traits::store::StoreProvider;
use pulse_core::types::id::{ClientId, UserId};
use pulse_store::keys;

use crate::grace::GraceQueue;
use crate::message::types::{OnlineClients, PresenceUpdate};
use crate::store::{PresenceStore, StoreEvent};

/// A presence transition, emitted exactly once per state change.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// First client of the user came online anywhere.
    UserOnline {
        /// User id.
        user_id: UserId,
        /// Opaque user type.
        user_type: u32,
    },
    /// Last reference to the user is gone and any grace period elapsed.
    UserOffline {
        /// User id.
        user_id: UserId,
        /// Opaque user type.
        user_type: u32,
    },
    /// A client of the user came online.
    ClientOnline {
        /// User id.
        user_id: UserId,
        /// Opaque user type.
        user_type: u32,
        /// Client id.
        client_id: ClientId,
        /// Arbitrary client payload.
        client_data: Option<Value>,
    },
    /// A client of the user went offline.
    ClientOffline {
        /// User id.
        user_id: UserId,
        /// Opaque user type.
        user_type: u32,
        /// Client id.
        client_id: ClientId,
        /// True for an intentional `set(offline)`.
        explicit: bool,
    },
}

struct Inner {
    store: PresenceStore,
    grace: GraceQueue,
}

/// The per-scope reconciliation engine.
pub struct PresenceManager {
    scope: String,
    sentry_name: String,
    config: PresenceConfig,
    store: Arc<dyn StoreProvider>,
    inner: Mutex<Inner>,
    events: broadcast::Sender<PresenceEvent>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PresenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceManager")
            .field("scope", &self.scope)
            .finish()
    }
}

impl PresenceManager {
    /// Create a manager for one scope. Call [`start`](Self::start) to
    /// begin receiving peer messages and running the timers.
    pub fn new(
        scope: impl Into<String>,
        sentry_name: impl Into<String>,
        config: PresenceConfig,
        store: Arc<dyn StoreProvider>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = broadcast::channel(1);
        let grace = GraceQueue::new(config.grace_window_ms());
        Self {
            scope: scope.into(),
            sentry_name: sentry_name.into(),
            config,
            store,
            inner: Mutex::new(Inner {
                store: PresenceStore::new(),
                grace,
            }),
            events,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// The scope this manager reconciles.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Subscribe to transition notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    fn emit(&self, events: Vec<PresenceEvent>) {
        for event in events {
            debug!(scope = %self.scope, ?event, "Presence transition");
            let _ = self.events.send(event);
        }
    }

    async fn persist_online(&self, update: &PresenceUpdate) -> AppResult<()> {
        let payload = serde_json::to_string(update)?;
        let hash = keys::presence_hash(&self.scope);
        self.store
            .hash_set(&hash, &update.client_id, &payload)
            .await?;
        self.store.expire(&hash, self.config.scope_ttl()).await?;
        self.store
            .publish(&keys::presence_channel(&self.scope), &payload)
            .await
    }

    /// Declare a locally connected client online.
    ///
    /// Emits `user_online` if this is the user's first reference
    /// anywhere and `client_online` if the client was not already known;
    /// duplicate calls are absorbed silently. The update is persisted
    /// and published so peers converge.
    pub async fn set_online(
        &self,
        client_id: &str,
        user_id: &UserId,
        user_type: u32,
        client_data: Option<Value>,
    ) -> AppResult<()> {
        let update = PresenceUpdate {
            user_id: user_id.clone(),
            user_type,
            client_id: client_id.to_string(),
            online: true,
            at: Utc::now().timestamp_millis(),
            client_data,
            explicit: false,
            sentry_id: Some(self.sentry_name.clone()),
        };

        let events = {
            let mut inner = self.inner.lock().await;
            let user_was_pending = inner.grace.has_user(user_id);
            inner.grace.cancel(user_id, client_id);
            let diff = inner.store.apply_online(&update);
            translate(&inner.grace, diff, false, user_was_pending)
        };
        self.emit(events);
        self.persist_online(&update).await
    }

    /// Declare a locally connected client offline (explicit disconnect).
    ///
    /// No grace period: the user asked to go offline. Emits
    /// `client_offline` and, when this was the last reference,
    /// `user_offline`; deletes the stored entry and publishes an
    /// explicit offline update immediately.
    pub async fn set_offline(&self, client_id: &str, user_id: &UserId) -> AppResult<()> {
        let now = Utc::now().timestamp_millis();
        let (events, user_type) = {
            let mut inner = self.inner.lock().await;
            let pending_type = inner.grace.get(client_id).map(|entry| entry.user_type);
            let cancelled = inner.grace.cancel(user_id, client_id);
            let user_type = inner
                .store
                .get(client_id, user_id)
                .map(|record| record.user_type)
                .or(pending_type)
                .unwrap_or_default();
            let diff = inner.store.remove(client_id, user_id);
            let mut events = translate(&inner.grace, diff, true, false);
            // An explicit offline can land while the same client still
            // awaits its grace decision; the user must not stay online
            // forever with the pending entry gone.
            if events.is_empty()
                && cancelled
                && !inner.store.has_user(user_id)
                && !inner.grace.has_user(user_id)
            {
                events.push(PresenceEvent::UserOffline {
                    user_id: user_id.clone(),
                    user_type,
                });
            }
            (events, user_type)
        };
        self.emit(events);

        let update = PresenceUpdate {
            user_id: user_id.clone(),
            user_type,
            client_id: client_id.to_string(),
            online: false,
            at: now,
            client_data: None,
            explicit: true,
            sentry_id: Some(self.sentry_name.clone()),
        };
        self.store
            .hash_delete(&keys::presence_hash(&self.scope), client_id)
            .await?;
        self.store
            .publish(
                &keys::presence_channel(&self.scope),
                &serde_json::to_string(&update)?,
            )
            .await
    }

    /// Ungraceful disconnect: the transport closed without `set(offline)`.
    ///
    /// The client reference disappears immediately (`client_offline` is
    /// emitted now), but the user-offline decision is deferred to the
    /// grace queue. Nothing is published; either the client reconnects
    /// and nothing happened, or the grace sweep finalizes the offline.
    pub async fn disconnect(&self, client_id: &str) {
        let now = Utc::now().timestamp_millis();
        let events = {
            let mut inner = self.inner.lock().await;
            let Some(removed) = inner.store.remove_client(client_id) else {
                return;
            };
            inner
                .grace
                .push(client_id, &removed.user_id, removed.user_type, now);
            vec![PresenceEvent::ClientOffline {
                user_id: removed.user_id,
                user_type: removed.user_type,
                client_id: client_id.to_string(),
                explicit: false,
            }]
        };
        self.emit(events);
    }

    /// Fold in a presence update received over the store's channel.
    pub async fn process_update(&self, update: PresenceUpdate) {
        self.apply_update(update, Utc::now().timestamp_millis())
            .await;
    }

    /// Fold in a presence update at an explicit point in time.
    ///
    /// Messages stale beyond the expiry window are treated as offline
    /// regardless of their `online` flag; offline updates for clients
    /// never seen online are dropped without notification.
    pub async fn apply_update(&self, update: PresenceUpdate, now_ms: i64) {
        let expired = update.is_expired(now_ms, self.config.message_expiry_ms());
        if update.online && !expired {
            let events = {
                let mut inner = self.inner.lock().await;
                // A republication older than the client's pending
                // disconnect must not resurrect it.
                if let Some(entry) = inner.grace.get(&update.client_id) {
                    if update.at <= entry.queued_at {
                        debug!(
                            scope = %self.scope,
                            client_id = %update.client_id,
                            "Ignoring pre-disconnect republication"
                        );
                        return;
                    }
                }
                let user_was_pending = inner.grace.has_user(&update.user_id);
                let diff = inner.store.apply_online(&update);
                translate(&inner.grace, diff, false, user_was_pending)
            };
            self.emit(events);
        } else {
            let events = {
                let mut inner = self.inner.lock().await;
                let Some(record) = inner.store.get(&update.client_id, &update.user_id) else {
                    // Never seen online here; nothing to notify.
                    return;
                };
                if update.at < record.at {
                    debug!(
                        scope = %self.scope,
                        client_id = %update.client_id,
                        "Ignoring out-of-order offline update"
                    );
                    return;
                }
                let diff = inner.store.remove(&update.client_id, &update.user_id);
                translate(&inner.grace, diff, update.explicit, false)
            };
            self.emit(events);
        }
    }

    /// Run one grace sweep at the given time.
    ///
    /// Entries whose client is live again (locally or via a peer) are
    /// dropped silently. For the rest, the stored entry is deleted and
    /// an implicit offline update is published; `user_offline` is
    /// emitted once per user from the post-sweep aggregate state.
    /// Normally driven by the background ticker.
    pub async fn sweep_grace(&self, now_ms: i64) -> AppResult<()> {
        let (finalized, events) = {
            let mut inner = self.inner.lock().await;
            let due = inner.grace.drain_due(now_ms);
            if due.is_empty() {
                return Ok(());
            }

            let mut finalized = Vec::new();
            let mut affected: Vec<(UserId, u32)> = Vec::new();
            for entry in due {
                if inner.store.has_client(&entry.client_id) {
                    debug!(
                        scope = %self.scope,
                        client_id = %entry.client_id,
                        "Grace entry cancelled, client is live again"
                    );
                    continue;
                }
                if !affected.iter().any(|(user_id, _)| *user_id == entry.user_id) {
                    affected.push((entry.user_id.clone(), entry.user_type));
                }
                finalized.push(entry);
            }

            let mut events = Vec::new();
            for (user_id, user_type) in affected {
                if !inner.store.has_user(&user_id) && !inner.grace.has_user(&user_id) {
                    events.push(PresenceEvent::UserOffline { user_id, user_type });
                }
            }
            (finalized, events)
        };

        if !finalized.is_empty() {
            info!(
                scope = %self.scope,
                count = finalized.len(),
                "Grace window elapsed, finalizing disconnects"
            );
        }
        self.emit(events);

        for entry in &finalized {
            self.store
                .hash_delete(&keys::presence_hash(&self.scope), &entry.client_id)
                .await?;
            let update = PresenceUpdate {
                user_id: entry.user_id.clone(),
                user_type: entry.user_type,
                client_id: entry.client_id.clone(),
                online: false,
                at: now_ms,
                client_data: None,
                explicit: false,
                sentry_id: Some(self.sentry_name.clone()),
            };
            self.store
                .publish(
                    &keys::presence_channel(&self.scope),
                    &serde_json::to_string(&update)?,
                )
                .await?;
        }
        Ok(())
    }

    /// Drop remote clients whose latest update is stale beyond the
    /// expiry window, as if they had gone offline implicitly. Normally
    /// driven by the background ticker.
    pub async fn expire_remote(&self, now_ms: i64) {
        let events = {
            let mut inner = self.inner.lock().await;
            let stale =
                inner
                    .store
                    .stale_remote(&self.sentry_name, now_ms, self.config.message_expiry_ms());
            let mut events = Vec::new();
            for (client_id, user_id) in stale {
                debug!(scope = %self.scope, client_id = %client_id, "Remote client expired");
                let diff = inner.store.remove(&client_id, &user_id);
                events.extend(translate(&inner.grace, diff, false, false));
            }
            events
        };
        self.emit(events);
    }

    /// Republish every locally connected client with a fresh timestamp
    /// so peers' expiry windows never lapse while the client remains
    /// genuinely connected. Not a transition: emits nothing.
    pub async fn autopublish(&self) -> AppResult<()> {
        let updates = {
            let mut inner = self.inner.lock().await;
            inner
                .store
                .refresh_local(&self.sentry_name, Utc::now().timestamp_millis())
        };
        for update in &updates {
            self.persist_online(update).await?;
        }
        Ok(())
    }

    /// Force every client attributed to a dead sentry through the
    /// ungraceful-disconnect path.
    pub async fn handle_sentry_down(&self, sentry: &str) {
        let now = Utc::now().timestamp_millis();
        let events = {
            let mut inner = self.inner.lock().await;
            let sockets = inner.store.sockets_for_sentry(sentry);
            if sockets.is_empty() {
                return;
            }
            info!(
                scope = %self.scope,
                sentry = %sentry,
                count = sockets.len(),
                "Reconciling clients of dead sentry"
            );
            let mut events = Vec::new();
            for client_id in sockets {
                if let Some(removed) = inner.store.remove_client(&client_id) {
                    inner
                        .grace
                        .push(&client_id, &removed.user_id, removed.user_type, now);
                    events.push(PresenceEvent::ClientOffline {
                        user_id: removed.user_id,
                        user_type: removed.user_type,
                        client_id,
                        explicit: false,
                    });
                }
            }
            events
        };
        self.emit(events);
    }

    /// Recompute the merged view from the store's hash.
    ///
    /// Stored entries are replayed through the same rules as live
    /// messages, so a node that starts with no memory converges (and
    /// notifies) from durable state alone. Users sitting in the grace
    /// queue count as online until their window elapses.
    pub async fn full_read(&self) -> AppResult<HashMap<UserId, u32>> {
        let now = Utc::now().timestamp_millis();
        let stored = self
            .store
            .hash_get_all(&keys::presence_hash(&self.scope))
            .await?;

        let (events, view) = {
            let mut inner = self.inner.lock().await;
            let mut events = Vec::new();
            for (client_id, raw) in &stored {
                let update: PresenceUpdate = match serde_json::from_str(raw) {
                    Ok(update) => update,
                    Err(e) => {
                        warn!(
                            scope = %self.scope,
                            client_id = %client_id,
                            error = %e,
                            "Dropping malformed stored presence entry"
                        );
                        continue;
                    }
                };
                if !update.online || update.is_expired(now, self.config.message_expiry_ms()) {
                    continue;
                }
                // Entries for a client awaiting its grace decision are
                // exactly the pre-disconnect state; don't resurrect it.
                if let Some(entry) = inner.grace.get(&update.client_id) {
                    if update.at <= entry.queued_at {
                        continue;
                    }
                }
                let user_was_pending = inner.grace.has_user(&update.user_id);
                let diff = inner.store.apply_online(&update);
                events.extend(translate(&inner.grace, diff, false, user_was_pending));
            }

            let mut view = inner.store.users();
            for (user_id, user_type) in inner.grace.users_pending() {
                view.entry(user_id).or_insert(user_type);
            }
            (events, view)
        };
        self.emit(events);
        Ok(view)
    }

    /// The version-2 merged view: per-user client breakdown. Only
    /// clients that are genuinely connected are listed; their
    /// `client_offline` has already been broadcast otherwise.
    pub async fn clients_online(&self) -> HashMap<UserId, OnlineClients> {
        self.inner.lock().await.store.clients_by_user()
    }

    /// Whether the user is online (including grace-pending).
    pub async fn has_user(&self, user_id: &UserId) -> bool {
        let inner = self.inner.lock().await;
        inner.store.has_user(user_id) || inner.grace.has_user(user_id)
    }

    /// Whether the client is online.
    pub async fn has_client(&self, client_id: &str) -> bool {
        self.inner.lock().await.store.has_client(client_id)
    }

    /// Whether any disconnect is still awaiting its grace decision.
    pub async fn has_pending_grace(&self) -> bool {
        !self.inner.lock().await.grace.is_empty()
    }

    /// Start the peer-message listener and the timer loops.
    pub async fn start(self: &Arc<Self>) -> AppResult<()> {
        let mut subscription = self
            .store
            .subscribe(&keys::presence_channel(&self.scope))
            .await?;

        let manager = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let listener = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    message = subscription.next() => {
                        let Some(message) = message else { break };
                        match serde_json::from_str::<PresenceUpdate>(&message.payload) {
                            Ok(update) => manager.process_update(update).await,
                            Err(e) => warn!(
                                scope = %manager.scope,
                                error = %e,
                                "Dropping malformed presence message"
                            ),
                        }
                    }
                }
            }
        });

        let manager = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let ticker = tokio::spawn(async move {
            let mut publish_tick = tokio::time::interval(manager.config.autopublish_interval());
            let mut sweep_tick = tokio::time::interval(manager.config.sweep_interval());
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = publish_tick.tick() => {
                        manager.expire_remote(Utc::now().timestamp_millis()).await;
                        if let Err(e) = manager.autopublish().await {
                            warn!(
                                scope = %manager.scope,
                                error = %e,
                                "Autopublish failed, retrying on next tick"
                            );
                        }
                    }
                    _ = sweep_tick.tick() => {
                        if let Err(e) = manager.sweep_grace(Utc::now().timestamp_millis()).await {
                            warn!(scope = %manager.scope, error = %e, "Grace sweep failed");
                        }
                    }
                }
            }
        });

        self.tasks.lock().await.extend([listener, ticker]);
        debug!(scope = %self.scope, "Presence manager started");
        Ok(())
    }

    /// Stop the listener and timers. Safe to call while a cycle is in
    /// flight, and more than once.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        debug!(scope = %self.scope, "Presence manager stopped");
    }
}

/// Map a store diff to manager notifications.
///
/// `user_was_pending` suppresses `user_online` for a user that was
/// grace-pending at the time of the add: the user never appeared
/// offline, so no online transition happened. `UserRemoved` is likewise
/// suppressed while the user still has grace entries.
fn translate(
    grace: &GraceQueue,
    diff: Vec<StoreEvent>,
    explicit: bool,
    user_was_pending: bool,
) -> Vec<PresenceEvent> {
    let mut out = Vec::new();
    for event in diff {
        match event {
            StoreEvent::UserAdded { user_id, user_type } => {
                if !user_was_pending {
                    out.push(PresenceEvent::UserOnline { user_id, user_type });
                }
            }
            StoreEvent::ClientAdded {
                user_id,
                user_type,
                client_id,
                client_data,
            } => out.push(PresenceEvent::ClientOnline {
                user_id,
                user_type,
                client_id,
                client_data,
            }),
            StoreEvent::ClientUpdated { .. } => {
                // Payload refresh, not a transition.
            }
            StoreEvent::ClientRemoved {
                user_id,
                user_type,
                client_id,
            } => out.push(PresenceEvent::ClientOffline {
                user_id,
                user_type,
                client_id,
                explicit,
            }),
            StoreEvent::UserRemoved { user_id, user_type } => {
                if !grace.has_user(&user_id) {
                    out.push(PresenceEvent::UserOffline { user_id, user_type });
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_store::memory::MemoryStoreProvider;

    const GRACE_MS: i64 = 15_000;
    const EXPIRY_MS: i64 = 45_000;

    fn make_manager() -> (Arc<PresenceManager>, broadcast::Receiver<PresenceEvent>) {
        make_manager_on(MemoryStoreProvider::new(), "node-a")
    }

    fn make_manager_on(
        store: MemoryStoreProvider,
        sentry: &str,
    ) -> (Arc<PresenceManager>, broadcast::Receiver<PresenceEvent>) {
        let manager = Arc::new(PresenceManager::new(
            "presence:/test/room",
            sentry,
            PresenceConfig::default(),
            Arc::new(store),
        ));
        let events = manager.subscribe_events();
        (manager, events)
    }

    fn drain(rx: &mut broadcast::Receiver<PresenceEvent>) -> Vec<PresenceEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn remote_update(user: &str, client: &str, online: bool, at: i64) -> PresenceUpdate {
        PresenceUpdate {
            user_id: UserId::new(user),
            user_type: 2,
            client_id: client.to_string(),
            online,
            at,
            client_data: None,
            explicit: false,
            sentry_id: Some("node-b".to_string()),
        }
    }

    #[tokio::test]
    async fn online_then_explicit_offline_emits_each_once() {
        let (manager, mut rx) = make_manager();
        let user = UserId::new("1");

        manager.set_online("c1", &user, 2, None).await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], PresenceEvent::UserOnline { .. }));
        assert!(matches!(events[1], PresenceEvent::ClientOnline { .. }));

        manager.set_offline("c1", &user).await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(
            matches!(events[0], PresenceEvent::ClientOffline { explicit, .. } if explicit)
        );
        assert!(matches!(events[1], PresenceEvent::UserOffline { .. }));
    }

    #[tokio::test]
    async fn duplicate_set_online_is_idempotent() {
        let (manager, mut rx) = make_manager();
        let user = UserId::new("1");

        manager.set_online("c1", &user, 2, None).await.unwrap();
        drain(&mut rx);
        manager.set_online("c1", &user, 2, None).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn offline_for_unknown_user_is_silent() {
        let (manager, mut rx) = make_manager();

        manager
            .set_offline("c1", &UserId::new("ghost"))
            .await
            .unwrap();
        assert!(drain(&mut rx).is_empty());

        manager
            .apply_update(remote_update("ghost", "c9", false, 1_000), 2_000)
            .await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn two_clients_keep_user_online_until_both_gone() {
        let (manager, mut rx) = make_manager();
        let user = UserId::new("1");

        manager.set_online("c1", &user, 2, None).await.unwrap();
        manager.set_online("c2", &user, 2, None).await.unwrap();
        drain(&mut rx);

        manager.set_offline("c1", &user).await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PresenceEvent::ClientOffline { .. }));
        assert!(manager.has_user(&user).await);

        manager.set_offline("c2", &user).await.unwrap();
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, PresenceEvent::UserOffline { .. })));
        assert!(!manager.has_user(&user).await);
    }

    #[tokio::test]
    async fn ungraceful_disconnect_defers_user_offline() {
        let (manager, mut rx) = make_manager();
        let user = UserId::new("1");

        manager.set_online("c1", &user, 2, None).await.unwrap();
        drain(&mut rx);

        manager.disconnect("c1").await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(
            matches!(events[0], PresenceEvent::ClientOffline { explicit, .. } if !explicit)
        );
        assert!(manager.has_user(&user).await);

        let now = Utc::now().timestamp_millis();
        manager.sweep_grace(now + GRACE_MS - 1_000).await.unwrap();
        assert!(drain(&mut rx).is_empty());
        assert!(manager.has_user(&user).await);

        manager.sweep_grace(now + GRACE_MS + 1_000).await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PresenceEvent::UserOffline { .. }));
        assert!(!manager.has_user(&user).await);

        // The stored entry is gone too.
        let stored = manager
            .store
            .hash_get_all(&keys::presence_hash("presence:/test/room"))
            .await
            .unwrap();
        assert!(stored.is_empty());
    }

    #[tokio::test]
    async fn reconnect_within_grace_cancels_offline() {
        let (manager, mut rx) = make_manager();
        let user = UserId::new("1");

        manager.set_online("c1", &user, 2, None).await.unwrap();
        drain(&mut rx);

        manager.disconnect("c1").await;
        drain(&mut rx);

        manager.set_online("c1", &user, 2, None).await.unwrap();
        let events = drain(&mut rx);
        // The client flapped, the user did not.
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PresenceEvent::ClientOnline { .. }));

        let now = Utc::now().timestamp_millis();
        manager.sweep_grace(now + GRACE_MS * 2).await.unwrap();
        assert!(drain(&mut rx).is_empty());
        assert!(manager.has_user(&user).await);
    }

    #[tokio::test]
    async fn explicit_offline_finalizes_a_graced_client() {
        let (manager, mut rx) = make_manager();
        let user = UserId::new("1");

        manager.set_online("c1", &user, 2, None).await.unwrap();
        manager.disconnect("c1").await;
        drain(&mut rx);

        manager.set_offline("c1", &user).await.unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], PresenceEvent::UserOffline { .. }));
        assert!(!manager.has_pending_grace().await);

        // Nothing left for the sweep to do.
        let now = Utc::now().timestamp_millis();
        manager.sweep_grace(now + GRACE_MS * 2).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn multiple_graced_clients_emit_one_user_offline() {
        let (manager, mut rx) = make_manager();
        let user = UserId::new("1");

        manager.set_online("c1", &user, 2, None).await.unwrap();
        manager.set_online("c2", &user, 2, None).await.unwrap();
        drain(&mut rx);

        manager.disconnect("c1").await;
        manager.disconnect("c2").await;
        drain(&mut rx);

        let now = Utc::now().timestamp_millis();
        manager.sweep_grace(now + GRACE_MS + 1_000).await.unwrap();
        let offline: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, PresenceEvent::UserOffline { .. }))
            .collect();
        assert_eq!(offline.len(), 1);
    }

    #[tokio::test]
    async fn remote_online_message_adds_user() {
        let (manager, mut rx) = make_manager();
        let now = Utc::now().timestamp_millis();

        manager
            .apply_update(remote_update("7", "rc1", true, now), now)
            .await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert!(manager.has_user(&UserId::new("7")).await);
        assert!(manager.has_client("rc1").await);
    }

    #[tokio::test]
    async fn expired_remote_online_is_treated_as_offline() {
        let (manager, mut rx) = make_manager();

        // Never seen before: dropped without notification.
        manager
            .apply_update(remote_update("7", "rc1", true, 0), EXPIRY_MS + 1)
            .await;
        assert!(drain(&mut rx).is_empty());
        assert!(!manager.has_user(&UserId::new("7")).await);

        // Known client: a stale "online" takes it down.
        manager
            .apply_update(remote_update("7", "rc1", true, 1_000), 1_000)
            .await;
        drain(&mut rx);
        manager
            .apply_update(remote_update("7", "rc1", true, 2_000), EXPIRY_MS + 2_001)
            .await;
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, PresenceEvent::UserOffline { .. })));
    }

    #[tokio::test]
    async fn stale_remote_offline_is_rejected() {
        let (manager, mut rx) = make_manager();

        manager
            .apply_update(remote_update("7", "rc1", true, 1_000), 1_000)
            .await;
        drain(&mut rx);

        let mut stale = remote_update("7", "rc1", false, 500);
        stale.explicit = true;
        manager.apply_update(stale, 2_000).await;
        assert!(drain(&mut rx).is_empty());
        assert!(manager.has_user(&UserId::new("7")).await);
    }

    #[tokio::test]
    async fn expire_remote_sweep_drops_silent_peers() {
        let (manager, mut rx) = make_manager();

        manager
            .apply_update(remote_update("7", "rc1", true, 0), 0)
            .await;
        drain(&mut rx);

        manager.expire_remote(EXPIRY_MS + 1).await;
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, PresenceEvent::ClientOffline { .. })));
        assert!(events.iter().any(|e| matches!(e, PresenceEvent::UserOffline { .. })));
    }

    #[tokio::test]
    async fn autopublish_refreshes_without_events() {
        let (manager, mut rx) = make_manager();
        let user = UserId::new("1");

        manager.set_online("c1", &user, 2, None).await.unwrap();
        drain(&mut rx);

        manager.autopublish().await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn sentry_down_forces_grace_path() {
        let (manager, mut rx) = make_manager();
        let now = Utc::now().timestamp_millis();

        manager
            .apply_update(remote_update("7", "rc1", true, now), now)
            .await;
        drain(&mut rx);

        manager.handle_sentry_down("node-b").await;
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(
            matches!(events[0], PresenceEvent::ClientOffline { explicit, .. } if !explicit)
        );
        assert!(manager.has_user(&UserId::new("7")).await);
        assert!(manager.has_pending_grace().await);

        manager.sweep_grace(now + GRACE_MS + 1_000).await.unwrap();
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, PresenceEvent::UserOffline { .. })));
        assert!(!manager.has_user(&UserId::new("7")).await);
    }

    #[tokio::test]
    async fn full_read_counts_grace_pending_users() {
        let (manager, mut rx) = make_manager();
        let user = UserId::new("1");

        manager.set_online("c1", &user, 2, None).await.unwrap();
        manager.disconnect("c1").await;
        drain(&mut rx);

        let view = manager.full_read().await.unwrap();
        assert_eq!(view.get(&user), Some(&2));
        // The stored pre-disconnect entry must not resurrect the client.
        assert!(!manager.has_client("c1").await);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn full_read_converges_a_cold_node() {
        let shared = MemoryStoreProvider::new();
        let (manager_a, _rx_a) = make_manager_on(shared.clone(), "node-a");
        let (manager_b, mut rx_b) = make_manager_on(shared, "node-b");
        let user = UserId::new("1");

        manager_a.set_online("c1", &user, 2, None).await.unwrap();

        let view = manager_b.full_read().await.unwrap();
        assert_eq!(view.get(&user), Some(&2));
        let events = drain(&mut rx_b);
        assert!(events.iter().any(|e| matches!(e, PresenceEvent::UserOnline { .. })));

        let clients = manager_b.clients_online().await;
        assert!(clients.get(&user).unwrap().clients.contains_key("c1"));
    }
}
