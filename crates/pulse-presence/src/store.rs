//! Per-scope presence store — the index of clients currently online.
//!
//! Holds every client the node believes online in one scope, locally
//! connected and remote alike; each record is tagged with the sentry
//! (node) it is attributed to and the timestamp of its latest update.
//! Mutations return a structural diff so the manager emits exactly one
//! notification per transition.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use serde_json::Value;

use pulse_core::types::id::{ClientId, SentryName, UserId};

use crate::message::types::{OnlineClients, PresenceUpdate};

/// Last-known metadata for one online client.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    /// Opaque user type.
    pub user_type: u32,
    /// Arbitrary client payload.
    pub client_data: Option<Value>,
    /// Timestamp of the latest accepted update, epoch milliseconds.
    pub at: i64,
    /// Node the client is attributed to.
    pub sentry: SentryName,
}

/// Structural change produced by a store mutation.
///
/// A single call never produces both an add and an update for the same
/// client, and an unchanged duplicate add produces nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// First client of a user appeared.
    UserAdded {
        /// User id.
        user_id: UserId,
        /// Opaque user type.
        user_type: u32,
    },
    /// A client appeared under an already-known or new user.
    ClientAdded {
        /// User id.
        user_id: UserId,
        /// Opaque user type.
        user_type: u32,
        /// Client id.
        client_id: ClientId,
        /// Arbitrary client payload.
        client_data: Option<Value>,
    },
    /// A known client's payload changed.
    ClientUpdated {
        /// User id.
        user_id: UserId,
        /// Opaque user type.
        user_type: u32,
        /// Client id.
        client_id: ClientId,
        /// New client payload.
        client_data: Option<Value>,
    },
    /// A client disappeared.
    ClientRemoved {
        /// User id.
        user_id: UserId,
        /// Opaque user type.
        user_type: u32,
        /// Client id.
        client_id: ClientId,
    },
    /// The last client of a user disappeared.
    UserRemoved {
        /// User id.
        user_id: UserId,
        /// Opaque user type.
        user_type: u32,
    },
}

/// Result of removing a client through the ungraceful path.
#[derive(Debug, Clone)]
pub struct RemovedClient {
    /// User the client belonged to.
    pub user_id: UserId,
    /// Opaque user type.
    pub user_type: u32,
}

/// The per-scope client index.
#[derive(Debug, Default)]
pub struct PresenceStore {
    /// User id → online clients of that user.
    users: HashMap<UserId, HashMap<ClientId, ClientRecord>>,
    /// User id → opaque user type.
    user_types: HashMap<UserId, u32>,
    /// Client id → owning user (reverse index).
    owners: HashMap<ClientId, UserId>,
}

impl PresenceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or refresh a client from an online update.
    ///
    /// Updates older than the stored record are ignored. At most one
    /// `(client, user)` pair is active at a time: if the client was
    /// attributed to a different user, the old mapping is removed first
    /// and the diff includes those removals.
    pub fn apply_online(&mut self, update: &PresenceUpdate) -> Vec<StoreEvent> {
        if let Some((_, record)) = self.get_client(&update.client_id) {
            if update.at < record.at {
                return Vec::new();
            }
        }

        let mut events = Vec::new();

        if let Some(owner) = self.owners.get(&update.client_id).cloned() {
            if owner != update.user_id {
                events.extend(self.remove(&update.client_id, &owner));
            }
        }

        let sentry = update.sentry_id.clone().unwrap_or_default();
        let user_known = self.users.contains_key(&update.user_id);
        let clients = self.users.entry(update.user_id.clone()).or_default();

        match clients.entry(update.client_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get_mut();
                existing.at = update.at;
                existing.sentry = sentry;
                if existing.user_type != update.user_type {
                    existing.user_type = update.user_type;
                    self.user_types.insert(update.user_id.clone(), update.user_type);
                }
                if existing.client_data != update.client_data {
                    existing.client_data = update.client_data.clone();
                    events.push(StoreEvent::ClientUpdated {
                        user_id: update.user_id.clone(),
                        user_type: update.user_type,
                        client_id: update.client_id.clone(),
                        client_data: update.client_data.clone(),
                    });
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(ClientRecord {
                    user_type: update.user_type,
                    client_data: update.client_data.clone(),
                    at: update.at,
                    sentry,
                });
                self.owners
                    .insert(update.client_id.clone(), update.user_id.clone());
                self.user_types
                    .insert(update.user_id.clone(), update.user_type);
                if !user_known {
                    events.push(StoreEvent::UserAdded {
                        user_id: update.user_id.clone(),
                        user_type: update.user_type,
                    });
                }
                events.push(StoreEvent::ClientAdded {
                    user_id: update.user_id.clone(),
                    user_type: update.user_type,
                    client_id: update.client_id.clone(),
                    client_data: update.client_data.clone(),
                });
            }
        }

        events
    }

    /// Remove one client mapping.
    ///
    /// Produces `ClientRemoved`, plus `UserRemoved` when the user has no
    /// remaining clients. Unknown pairs produce nothing.
    pub fn remove(&mut self, client_id: &str, user_id: &UserId) -> Vec<StoreEvent> {
        let Some(clients) = self.users.get_mut(user_id) else {
            return Vec::new();
        };
        let Some(record) = clients.remove(client_id) else {
            return Vec::new();
        };
        self.owners.remove(client_id);

        let mut events = vec![StoreEvent::ClientRemoved {
            user_id: user_id.clone(),
            user_type: record.user_type,
            client_id: client_id.to_string(),
        }];

        if clients.is_empty() {
            self.users.remove(user_id);
            let user_type = self.user_types.remove(user_id).unwrap_or(record.user_type);
            events.push(StoreEvent::UserRemoved {
                user_id: user_id.clone(),
                user_type,
            });
        }

        events
    }

    /// Ungraceful-disconnect path: remove a client via the reverse index.
    ///
    /// The user-level decision is not taken here — the caller defers it
    /// to the grace queue — so no events are produced beyond the
    /// returned record.
    pub fn remove_client(&mut self, client_id: &str) -> Option<RemovedClient> {
        let user_id = self.owners.remove(client_id)?;
        let clients = self.users.get_mut(&user_id)?;
        let record = clients.remove(client_id)?;
        let user_type = self
            .user_types
            .get(&user_id)
            .copied()
            .unwrap_or(record.user_type);
        if clients.is_empty() {
            self.users.remove(&user_id);
            self.user_types.remove(&user_id);
        }
        Some(RemovedClient { user_id, user_type })
    }

    /// All online users with their user types.
    pub fn users(&self) -> HashMap<UserId, u32> {
        self.users
            .keys()
            .map(|user_id| {
                let user_type = self.user_types.get(user_id).copied().unwrap_or_default();
                (user_id.clone(), user_type)
            })
            .collect()
    }

    /// Client ids currently online for a user.
    pub fn sockets(&self, user_id: &UserId) -> Vec<ClientId> {
        self.users
            .get(user_id)
            .map(|clients| clients.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The user type of an online user.
    pub fn user_type_of(&self, user_id: &UserId) -> Option<u32> {
        self.user_types.get(user_id).copied()
    }

    /// Look up a specific client of a specific user.
    pub fn get(&self, client_id: &str, user_id: &UserId) -> Option<&ClientRecord> {
        self.users.get(user_id)?.get(client_id)
    }

    /// Look up a client and its owning user via the reverse index.
    pub fn get_client(&self, client_id: &str) -> Option<(&UserId, &ClientRecord)> {
        let user_id = self.owners.get(client_id)?;
        let record = self.users.get(user_id)?.get(client_id)?;
        Some((user_id, record))
    }

    /// All client ids attributed to the given sentry. O(scope size).
    pub fn sockets_for_sentry(&self, sentry: &str) -> Vec<ClientId> {
        self.users
            .values()
            .flat_map(|clients| {
                clients
                    .iter()
                    .filter(|(_, record)| record.sentry == sentry)
                    .map(|(client_id, _)| client_id.clone())
            })
            .collect()
    }

    /// All clients NOT attributed to `own_sentry` whose latest update is
    /// older than the expiry window.
    pub fn stale_remote(
        &self,
        own_sentry: &str,
        now_ms: i64,
        expiry_ms: i64,
    ) -> Vec<(ClientId, UserId)> {
        self.users
            .iter()
            .flat_map(|(user_id, clients)| {
                clients
                    .iter()
                    .filter(|(_, record)| {
                        record.sentry != own_sentry && now_ms - record.at > expiry_ms
                    })
                    .map(|(client_id, _)| (client_id.clone(), user_id.clone()))
            })
            .collect()
    }

    /// Refresh the timestamp of every client attributed to `own_sentry`
    /// and return the updates to republish. No events: a liveness
    /// refresh is not a transition.
    pub fn refresh_local(&mut self, own_sentry: &str, now_ms: i64) -> Vec<PresenceUpdate> {
        let mut updates = Vec::new();
        for (user_id, clients) in self.users.iter_mut() {
            for (client_id, record) in clients.iter_mut() {
                if record.sentry != own_sentry {
                    continue;
                }
                record.at = now_ms;
                updates.push(PresenceUpdate {
                    user_id: user_id.clone(),
                    user_type: record.user_type,
                    client_id: client_id.clone(),
                    online: true,
                    at: now_ms,
                    client_data: record.client_data.clone(),
                    explicit: false,
                    sentry_id: Some(own_sentry.to_string()),
                });
            }
        }
        updates
    }

    /// The version-2 merged view: per-user client breakdown.
    pub fn clients_by_user(&self) -> HashMap<UserId, OnlineClients> {
        self.users
            .iter()
            .map(|(user_id, clients)| {
                let user_type = self.user_types.get(user_id).copied().unwrap_or_default();
                let clients = clients
                    .iter()
                    .map(|(client_id, record)| {
                        (
                            client_id.clone(),
                            record.client_data.clone().unwrap_or(Value::Null),
                        )
                    })
                    .collect();
                (user_id.clone(), OnlineClients { user_type, clients })
            })
            .collect()
    }

    /// Whether the user has any online client.
    pub fn has_user(&self, user_id: &UserId) -> bool {
        self.users.contains_key(user_id)
    }

    /// Whether the client is online under any user.
    pub fn has_client(&self, client_id: &str) -> bool {
        self.owners.contains_key(client_id)
    }

    /// Whether the store holds no clients at all.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn online(user: &str, client: &str, at: i64) -> PresenceUpdate {
        PresenceUpdate {
            user_id: UserId::new(user),
            user_type: 2,
            client_id: client.to_string(),
            online: true,
            at,
            client_data: None,
            explicit: false,
            sentry_id: Some("node-a".to_string()),
        }
    }

    #[test]
    fn first_client_adds_user_then_client() {
        let mut store = PresenceStore::new();
        let events = store.apply_online(&online("u1", "c1", 100));

        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], StoreEvent::UserAdded { .. }));
        assert!(matches!(events[1], StoreEvent::ClientAdded { .. }));
    }

    #[test]
    fn duplicate_add_is_silent() {
        let mut store = PresenceStore::new();
        store.apply_online(&online("u1", "c1", 100));
        let events = store.apply_online(&online("u1", "c1", 200));
        assert!(events.is_empty());
    }

    #[test]
    fn stale_update_is_ignored() {
        let mut store = PresenceStore::new();
        let mut first = online("u1", "c1", 100);
        first.client_data = Some(serde_json::json!({"v": 1}));
        store.apply_online(&first);

        let mut stale = online("u1", "c1", 50);
        stale.client_data = Some(serde_json::json!({"v": 0}));
        let events = store.apply_online(&stale);

        assert!(events.is_empty());
        let record = store.get("c1", &UserId::new("u1")).unwrap();
        assert_eq!(record.at, 100);
        assert_eq!(record.client_data, Some(serde_json::json!({"v": 1})));
    }

    #[test]
    fn changed_data_yields_update_not_add() {
        let mut store = PresenceStore::new();
        store.apply_online(&online("u1", "c1", 100));

        let mut changed = online("u1", "c1", 200);
        changed.client_data = Some(serde_json::json!({"device": "mobile"}));
        let events = store.apply_online(&changed);

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StoreEvent::ClientUpdated { .. }));
    }

    #[test]
    fn second_client_adds_client_only() {
        let mut store = PresenceStore::new();
        store.apply_online(&online("u1", "c1", 100));
        let events = store.apply_online(&online("u1", "c2", 100));

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StoreEvent::ClientAdded { .. }));
    }

    #[test]
    fn remove_last_client_removes_user() {
        let mut store = PresenceStore::new();
        store.apply_online(&online("u1", "c1", 100));
        store.apply_online(&online("u1", "c2", 100));

        let events = store.remove("c1", &UserId::new("u1"));
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StoreEvent::ClientRemoved { .. }));

        let events = store.remove("c2", &UserId::new("u1"));
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], StoreEvent::UserRemoved { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn remove_unknown_is_silent() {
        let mut store = PresenceStore::new();
        assert!(store.remove("ghost", &UserId::new("u1")).is_empty());
    }

    #[test]
    fn remove_client_reports_owner_without_events() {
        let mut store = PresenceStore::new();
        store.apply_online(&online("u1", "c1", 100));

        let removed = store.remove_client("c1").unwrap();
        assert_eq!(removed.user_id, UserId::new("u1"));
        assert_eq!(removed.user_type, 2);
        assert!(!store.has_user(&UserId::new("u1")));
        assert!(!store.has_client("c1"));
    }

    #[test]
    fn socket_switching_users_removes_old_mapping() {
        let mut store = PresenceStore::new();
        store.apply_online(&online("u1", "c1", 100));

        let mut switched = online("u2", "c1", 200);
        switched.user_id = UserId::new("u2");
        let events = store.apply_online(&switched);

        assert!(events.iter().any(|e| matches!(
            e,
            StoreEvent::UserRemoved { user_id, .. } if *user_id == UserId::new("u1")
        )));
        assert!(store.has_user(&UserId::new("u2")));
        assert!(!store.has_user(&UserId::new("u1")));
    }

    #[test]
    fn sockets_for_sentry_finds_only_that_node() {
        let mut store = PresenceStore::new();
        store.apply_online(&online("u1", "c1", 100));
        let mut remote = online("u2", "c2", 100);
        remote.sentry_id = Some("node-b".to_string());
        store.apply_online(&remote);

        let sockets = store.sockets_for_sentry("node-b");
        assert_eq!(sockets, vec!["c2".to_string()]);
    }

    #[test]
    fn stale_remote_skips_own_clients() {
        let mut store = PresenceStore::new();
        store.apply_online(&online("u1", "c1", 0));
        let mut remote = online("u2", "c2", 0);
        remote.sentry_id = Some("node-b".to_string());
        store.apply_online(&remote);

        let stale = store.stale_remote("node-a", 50_000, 45_000);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, "c2");
    }

    #[test]
    fn refresh_local_bumps_timestamps_only_for_own_clients() {
        let mut store = PresenceStore::new();
        store.apply_online(&online("u1", "c1", 0));
        let mut remote = online("u2", "c2", 0);
        remote.sentry_id = Some("node-b".to_string());
        store.apply_online(&remote);

        let updates = store.refresh_local("node-a", 9_000);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].client_id, "c1");
        assert_eq!(updates[0].at, 9_000);
        assert_eq!(store.get("c2", &UserId::new("u2")).unwrap().at, 0);
    }
}
