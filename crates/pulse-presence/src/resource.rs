//! Presence resource — adapts client protocol operations to the manager.
//!
//! The transport layer owns client sessions; the resource only needs an
//! id and a way to push serialized messages. An optional authorization
//! hook is consulted before any mutation; on failure the client gets an
//! `err` reply and no state changes.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use pulse_core::types::id::UserId;

use crate::manager::{PresenceEvent, PresenceManager};
use crate::message::types::{ClientMessage, ClientValue, GetOptions, ServerMessage, SetValue};

/// The slice of a connected client the resource needs.
///
/// Implemented by the transport layer; the resource never owns the
/// session lifecycle. `send` must queue without blocking.
pub trait ClientSession: Send + Sync + std::fmt::Debug {
    /// Transport-assigned session id; doubles as the presence client id.
    fn client_id(&self) -> &str;

    /// Queue a serialized message for delivery to the client.
    fn send(&self, payload: String);
}

/// Authorization hook consulted before any presence mutation.
pub type AuthorizeFn = dyn Fn(&ClientMessage, &dyn ClientSession) -> bool + Send + Sync;

/// Adapts `set`/`get`/`sync`/`subscribe`/`unsubscribe` to manager calls
/// and fans manager transitions out to subscribed sessions.
pub struct PresenceResource {
    scope: String,
    manager: Arc<PresenceManager>,
    subscribers: Arc<DashMap<String, Arc<dyn ClientSession>>>,
    authorize: Option<Arc<AuthorizeFn>>,
    forwarder: JoinHandle<()>,
}

impl std::fmt::Debug for PresenceResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceResource")
            .field("scope", &self.scope)
            .finish()
    }
}

impl PresenceResource {
    /// Create a resource for one scope, forwarding the manager's
    /// transitions to subscribed sessions.
    pub fn new(
        scope: impl Into<String>,
        manager: Arc<PresenceManager>,
        authorize: Option<Arc<AuthorizeFn>>,
    ) -> Arc<Self> {
        let scope = scope.into();
        let subscribers: Arc<DashMap<String, Arc<dyn ClientSession>>> = Arc::new(DashMap::new());

        let mut events = manager.subscribe_events();
        let forward_scope = scope.clone();
        let forward_subs = Arc::clone(&subscribers);
        let forwarder = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => broadcast_event(&forward_scope, &forward_subs, event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            scope = %forward_scope,
                            skipped,
                            "Presence broadcast lagged, transitions dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Arc::new(Self {
            scope,
            manager,
            subscribers,
            authorize,
            forwarder,
        })
    }

    /// Dispatch one client protocol message.
    pub async fn handle_message(&self, session: &Arc<dyn ClientSession>, message: ClientMessage) {
        if let Some(authorize) = &self.authorize {
            if !authorize(&message, session.as_ref()) {
                debug!(
                    scope = %self.scope,
                    client_id = %session.client_id(),
                    "Presence operation denied"
                );
                let origin = serde_json::to_value(&message).ok();
                self.reply(
                    session,
                    &ServerMessage::Err {
                        value: "auth".to_string(),
                        origin,
                    },
                );
                return;
            }
        }

        match message {
            ClientMessage::Set {
                key,
                user_type,
                value,
                user_data,
                ack,
                ..
            } => {
                let result = match value {
                    SetValue::Online => {
                        self.manager
                            .set_online(session.client_id(), &key, user_type, user_data)
                            .await
                    }
                    SetValue::Offline => {
                        self.manager.set_offline(session.client_id(), &key).await
                    }
                };
                match result {
                    Ok(()) => self.maybe_ack(session, ack),
                    Err(e) => {
                        warn!(
                            scope = %self.scope,
                            client_id = %session.client_id(),
                            error = %e,
                            "Presence set failed"
                        );
                        self.reply(
                            session,
                            &ServerMessage::Err {
                                value: "store".to_string(),
                                origin: None,
                            },
                        );
                    }
                }
            }
            ClientMessage::Get { options, .. } => {
                self.reply_get(session, options).await;
            }
            ClientMessage::Sync { options, .. } => {
                self.subscribers
                    .insert(session.client_id().to_string(), Arc::clone(session));
                self.reply_get(session, options).await;
            }
            ClientMessage::Subscribe { ack, .. } => {
                self.subscribers
                    .insert(session.client_id().to_string(), Arc::clone(session));
                self.maybe_ack(session, ack);
            }
            ClientMessage::Unsubscribe { ack, .. } => {
                self.subscribers.remove(session.client_id());
                self.maybe_ack(session, ack);
            }
        }
    }

    /// Transport close without `set(offline)`: route to the ungraceful
    /// path and drop the broadcast subscription.
    pub async fn on_close(&self, client_id: &str) {
        self.subscribers.remove(client_id);
        self.manager.disconnect(client_id).await;
    }

    /// Number of sessions subscribed to transition broadcasts.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Whether no session is subscribed.
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Stop forwarding transitions.
    pub fn destroy(&self) {
        self.forwarder.abort();
    }

    async fn reply_get(&self, session: &Arc<dyn ClientSession>, options: Option<GetOptions>) {
        let view = match self.manager.full_read().await {
            Ok(view) => view,
            Err(e) => {
                warn!(scope = %self.scope, error = %e, "Presence read failed");
                self.reply(
                    session,
                    &ServerMessage::Err {
                        value: "store".to_string(),
                        origin: None,
                    },
                );
                return;
            }
        };

        let version = options.and_then(|o| o.version).unwrap_or(1);
        let value = if version >= 2 {
            serde_json::to_value(self.manager.clients_online().await)
        } else {
            serde_json::to_value(view)
        };
        match value {
            Ok(value) => self.reply(
                session,
                &ServerMessage::Get {
                    to: self.scope.clone(),
                    value,
                },
            ),
            Err(e) => error!(scope = %self.scope, error = %e, "Failed to serialize view"),
        }
    }

    fn maybe_ack(&self, session: &Arc<dyn ClientSession>, ack: Option<u64>) {
        if let Some(value) = ack {
            self.reply(session, &ServerMessage::Ack { value });
        }
    }

    fn reply(&self, session: &Arc<dyn ClientSession>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(payload) => session.send(payload),
            Err(e) => error!(scope = %self.scope, error = %e, "Failed to serialize reply"),
        }
    }
}

/// Serialize one transition and push it to every subscribed session.
fn broadcast_event(
    scope: &str,
    subscribers: &DashMap<String, Arc<dyn ClientSession>>,
    event: PresenceEvent,
) {
    let message = match event {
        PresenceEvent::UserOnline { user_id, user_type } => ServerMessage::Online {
            to: scope.to_string(),
            value: single_user(user_id, user_type),
        },
        PresenceEvent::UserOffline { user_id, user_type } => ServerMessage::Offline {
            to: scope.to_string(),
            value: single_user(user_id, user_type),
        },
        PresenceEvent::ClientOnline {
            user_id,
            user_type,
            client_id,
            client_data,
        } => ServerMessage::ClientOnline {
            to: scope.to_string(),
            value: ClientValue {
                user_id,
                user_type,
                client_id,
                user_data: client_data,
            },
        },
        PresenceEvent::ClientOffline {
            user_id,
            user_type,
            client_id,
            ..
        } => ServerMessage::ClientOffline {
            to: scope.to_string(),
            value: ClientValue {
                user_id,
                user_type,
                client_id,
                user_data: None,
            },
        },
    };

    let payload = match serde_json::to_string(&message) {
        Ok(payload) => payload,
        Err(e) => {
            error!(scope = %scope, error = %e, "Failed to serialize broadcast");
            return;
        }
    };
    for entry in subscribers.iter() {
        entry.value().send(payload.clone());
    }
}

fn single_user(user_id: UserId, user_type: u32) -> HashMap<UserId, u32> {
    let mut value = HashMap::with_capacity(1);
    value.insert(user_id, user_type);
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::Value;

    use pulse_core::config::presence::PresenceConfig;
    use pulse_store::memory::MemoryStoreProvider;

    #[derive(Debug)]
    struct TestSession {
        id: String,
        sent: Mutex<Vec<String>>,
    }

    impl TestSession {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn received(&self) -> Vec<Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|raw| serde_json::from_str(raw).unwrap())
                .collect()
        }
    }

    impl ClientSession for TestSession {
        fn client_id(&self) -> &str {
            &self.id
        }

        fn send(&self, payload: String) {
            self.sent.lock().unwrap().push(payload);
        }
    }

    fn make_resource(authorize: Option<Arc<AuthorizeFn>>) -> Arc<PresenceResource> {
        let manager = Arc::new(PresenceManager::new(
            "presence:/test/room",
            "node-a",
            PresenceConfig::default(),
            Arc::new(MemoryStoreProvider::new()),
        ));
        PresenceResource::new("presence:/test/room", manager, authorize)
    }

    fn set_online_msg(user: &str, ack: Option<u64>) -> ClientMessage {
        ClientMessage::Set {
            to: "presence:/test/room".to_string(),
            key: UserId::new(user),
            user_type: 2,
            value: SetValue::Online,
            user_data: None,
            ack,
        }
    }

    #[tokio::test]
    async fn set_online_acks_and_updates_manager() {
        let resource = make_resource(None);
        let session = TestSession::new("c1");
        let as_session: Arc<dyn ClientSession> = session.clone();

        resource
            .handle_message(&as_session, set_online_msg("1", Some(9)))
            .await;

        assert!(resource.manager.has_user(&UserId::new("1")).await);
        let replies = session.received();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["op"], "ack");
        assert_eq!(replies[0]["value"], 9);
    }

    #[tokio::test]
    async fn denied_mutation_replies_err_and_changes_nothing() {
        let authorize: Arc<AuthorizeFn> = Arc::new(|_, _| false);
        let resource = make_resource(Some(authorize));
        let session = TestSession::new("c1");
        let as_session: Arc<dyn ClientSession> = session.clone();

        resource
            .handle_message(&as_session, set_online_msg("1", None))
            .await;

        assert!(!resource.manager.has_user(&UserId::new("1")).await);
        let replies = session.received();
        assert_eq!(replies[0]["op"], "err");
        assert_eq!(replies[0]["value"], "auth");
        assert_eq!(replies[0]["origin"]["op"], "set");
    }

    #[tokio::test]
    async fn get_returns_merged_view() {
        let resource = make_resource(None);
        let setter = TestSession::new("c1");
        let as_setter: Arc<dyn ClientSession> = setter.clone();
        resource
            .handle_message(&as_setter, set_online_msg("1", None))
            .await;

        let reader = TestSession::new("c2");
        let as_reader: Arc<dyn ClientSession> = reader.clone();
        resource
            .handle_message(
                &as_reader,
                ClientMessage::Get {
                    to: "presence:/test/room".to_string(),
                    options: None,
                },
            )
            .await;

        let replies = reader.received();
        assert_eq!(replies[0]["op"], "get");
        assert_eq!(replies[0]["value"]["1"], 2);
    }

    #[tokio::test]
    async fn get_version_two_returns_client_breakdown() {
        let resource = make_resource(None);
        let setter = TestSession::new("c1");
        let as_setter: Arc<dyn ClientSession> = setter.clone();
        resource
            .handle_message(&as_setter, set_online_msg("1", None))
            .await;

        let reader = TestSession::new("c2");
        let as_reader: Arc<dyn ClientSession> = reader.clone();
        resource
            .handle_message(
                &as_reader,
                ClientMessage::Get {
                    to: "presence:/test/room".to_string(),
                    options: Some(GetOptions { version: Some(2) }),
                },
            )
            .await;

        let replies = reader.received();
        assert_eq!(replies[0]["op"], "get");
        assert_eq!(replies[0]["value"]["1"]["userType"], 2);
        assert!(replies[0]["value"]["1"]["clients"].get("c1").is_some());
    }

    #[tokio::test]
    async fn sync_subscribes_to_broadcasts() {
        let resource = make_resource(None);
        let watcher = TestSession::new("w1");
        let as_watcher: Arc<dyn ClientSession> = watcher.clone();
        resource
            .handle_message(
                &as_watcher,
                ClientMessage::Sync {
                    to: "presence:/test/room".to_string(),
                    options: None,
                },
            )
            .await;
        assert_eq!(resource.subscriber_count(), 1);

        let setter = TestSession::new("c1");
        let as_setter: Arc<dyn ClientSession> = setter.clone();
        resource
            .handle_message(&as_setter, set_online_msg("1", None))
            .await;

        // The forwarder runs on its own task.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ops: Vec<String> = watcher
            .received()
            .iter()
            .map(|m| m["op"].as_str().unwrap_or_default().to_string())
            .collect();
        assert!(ops.contains(&"online".to_string()));
        assert!(ops.contains(&"client_online".to_string()));
    }

    #[tokio::test]
    async fn close_routes_to_ungraceful_path() {
        let resource = make_resource(None);
        let session = TestSession::new("c1");
        let as_session: Arc<dyn ClientSession> = session.clone();
        resource
            .handle_message(&as_session, set_online_msg("1", None))
            .await;

        resource.on_close("c1").await;

        // Client gone, user still inside the grace window.
        assert!(!resource.manager.has_client("c1").await);
        assert!(resource.manager.has_user(&UserId::new("1")).await);
        assert!(resource.manager.has_pending_grace().await);
    }
}
