//! Presence engine — per-node coordinator of scopes and the sentry.
//!
//! Managers are created lazily per scope on first use and released when
//! the last local subscriber is gone and no disconnect is still awaiting
//! its grace decision. Sentry `down` events fan out to every live
//! manager so a crashed peer's clients are reconciled everywhere.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pulse_core::config::presence::PresenceConfig;
use pulse_core::result::AppResult;
use pulse_core::traits::store::StoreProvider;

use crate::manager::PresenceManager;
use crate::sentry::{Sentry, SentryEvent};

/// Per-node coordinator owning the scope managers and the sentry.
pub struct PresenceEngine {
    config: PresenceConfig,
    store: Arc<dyn StoreProvider>,
    sentry: Arc<Sentry>,
    managers: DashMap<String, Arc<PresenceManager>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PresenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceEngine")
            .field("node", &self.sentry.name())
            .finish()
    }
}

impl PresenceEngine {
    /// Create an engine for this node.
    pub fn new(
        store: Arc<dyn StoreProvider>,
        sentry: Arc<Sentry>,
        config: PresenceConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            sentry,
            managers: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Start the sentry and begin reconciling dead peers into every
    /// live scope.
    pub async fn start(self: &Arc<Self>) -> AppResult<()> {
        self.sentry.start().await?;

        let engine = Arc::clone(self);
        let mut events = self.sentry.subscribe_events();
        let reconciler = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SentryEvent::Down { name, .. }) => {
                        let managers: Vec<Arc<PresenceManager>> = engine
                            .managers
                            .iter()
                            .map(|entry| Arc::clone(entry.value()))
                            .collect();
                        for manager in managers {
                            manager.handle_sentry_down(&name).await;
                        }
                    }
                    Ok(SentryEvent::Up { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Sentry event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.tasks.lock().await.push(reconciler);

        info!(node = %self.sentry.name(), "Presence engine started");
        Ok(())
    }

    /// The manager for a scope, created and started on first use.
    pub async fn manager(&self, scope: &str) -> AppResult<Arc<PresenceManager>> {
        let (manager, created) = match self.managers.entry(scope.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let manager = Arc::new(PresenceManager::new(
                    scope,
                    self.sentry.name(),
                    self.config.clone(),
                    Arc::clone(&self.store),
                ));
                entry.insert(Arc::clone(&manager));
                (manager, true)
            }
        };

        if created {
            if let Err(e) = manager.start().await {
                self.managers.remove(scope);
                return Err(e);
            }
            debug!(scope, "Presence scope created");
        }
        Ok(manager)
    }

    /// Release a scope once its last local subscriber is gone.
    ///
    /// A scope with disconnects still in the grace window stays alive so
    /// the pending offline decisions are carried out; callers should
    /// retry after the window.
    pub async fn release(&self, scope: &str) -> bool {
        let manager = match self.managers.get(scope) {
            Some(entry) => Arc::clone(entry.value()),
            None => return true,
        };
        if manager.has_pending_grace().await {
            debug!(scope, "Scope kept alive for pending grace entries");
            return false;
        }
        if let Some((_, manager)) = self.managers.remove(scope) {
            manager.stop().await;
            debug!(scope, "Presence scope released");
        }
        true
    }

    /// This node's sentry.
    pub fn sentry(&self) -> &Arc<Sentry> {
        &self.sentry
    }

    /// Number of live scopes.
    pub fn scope_count(&self) -> usize {
        self.managers.len()
    }

    /// Stop every scope manager and the sentry.
    pub async fn shutdown(&self) {
        let managers: Vec<Arc<PresenceManager>> = self
            .managers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for manager in managers {
            manager.stop().await;
        }
        self.managers.clear();

        if let Err(e) = self.sentry.stop().await {
            warn!(error = %e, "Sentry stop failed during shutdown");
        }
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!(node = %self.sentry.name(), "Presence engine shut down");
    }
}
