use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use uuid::Uuid;

use guildhall_types::events::GatewayEvent;

const BROADCAST_CAPACITY: usize = 1024;

/// Fans bot messages out to connected clients. Channel targets go to every
/// connection through the broadcast channel (each connection filters by its
/// subscriptions); `user:` targets go to that user's own session.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    broadcast_tx: broadcast::Sender<GatewayEvent>,
    /// One session per user. A reconnect replaces the older one.
    sessions: RwLock<HashMap<Uuid, Session>>,
}

struct Session {
    conn_id: Uuid,
    username: String,
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

/// What a connection keeps after `connect`.
pub struct Attached {
    pub conn_id: Uuid,
    pub direct: mpsc::UnboundedReceiver<GatewayEvent>,
    pub broadcast: broadcast::Receiver<GatewayEvent>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Returns the number of connections that will see the event.
    pub fn broadcast(&self, event: GatewayEvent) -> usize {
        self.inner.broadcast_tx.send(event).unwrap_or(0)
    }

    /// Mark the user online and open their direct channel.
    pub async fn connect(&self, user_id: Uuid, username: String) -> Attached {
        let conn_id = Uuid::new_v4();
        let (tx, direct) = mpsc::unbounded_channel();
        let previous = self.inner.sessions.write().await.insert(
            user_id,
            Session {
                conn_id,
                username,
                tx,
            },
        );
        if let Some(previous) = previous {
            tracing::debug!(
                %user_id,
                old = %previous.conn_id,
                "Session replaced by a new connection"
            );
        }
        Attached {
            conn_id,
            direct,
            broadcast: self.inner.broadcast_tx.subscribe(),
        }
    }

    /// Drop the session, unless a newer connection already replaced it.
    /// Returns whether anything was removed.
    pub async fn disconnect(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut sessions = self.inner.sessions.write().await;
        if sessions.get(&user_id).is_some_and(|s| s.conn_id == conn_id) {
            sessions.remove(&user_id);
            true
        } else {
            false
        }
    }

    /// Returns false if the user has no live connection.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) -> bool {
        self.inner
            .sessions
            .read()
            .await
            .get(&user_id)
            .is_some_and(|s| s.tx.send(event).is_ok())
    }

    pub async fn online_users(&self) -> Vec<(Uuid, String)> {
        self.inner
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| (*id, s.username.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn removal(target: &str) -> GatewayEvent {
        GatewayEvent::MessageDelete {
            id: "m1".into(),
            target: target.into(),
        }
    }

    #[tokio::test]
    async fn stale_connection_does_not_evict_newer_one() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();

        let old = dispatcher.connect(user, "ann".into()).await;
        let mut new = dispatcher.connect(user, "ann".into()).await;

        assert!(!dispatcher.disconnect(user, old.conn_id).await);
        assert_eq!(dispatcher.online_users().await.len(), 1);
        assert!(dispatcher.send_to_user(user, removal("user:x")).await);
        assert!(new.direct.recv().await.is_some());
    }

    #[tokio::test]
    async fn offline_users_are_reported_undeliverable() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        assert!(!dispatcher.send_to_user(user, removal("user:x")).await);

        let attached = dispatcher.connect(user, "ben".into()).await;
        assert!(dispatcher.disconnect(user, attached.conn_id).await);
        assert!(!dispatcher.send_to_user(user, removal("user:x")).await);
        assert!(dispatcher.online_users().await.is_empty());
    }

    #[tokio::test]
    async fn broadcast_counts_listeners() {
        let dispatcher = Dispatcher::new();
        assert_eq!(dispatcher.broadcast(removal("general")), 0);
        let mut attached = dispatcher.connect(Uuid::new_v4(), "cy".into()).await;
        assert_eq!(dispatcher.broadcast(removal("general")), 1);
        assert!(attached.broadcast.recv().await.is_ok());
    }
}
