use crate::common::protocol::ServerEvent;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Maps each identity to the outbound senders of its currently-open
/// connections (0, 1, or many). This is the single piece of cross-task
/// shared state in the core besides the database pool; all access goes
/// through the mutex.
#[derive(Clone, Default)]
pub struct ConnectionDirectory {
    inner: Arc<Mutex<HashMap<String, HashMap<Uuid, UnboundedSender<Message>>>>>,
}

impl ConnectionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, username: &str, conn_id: Uuid, sender: UnboundedSender<Message>) {
        let mut map = self.inner.lock().await;
        let conns = map.entry(username.to_string()).or_default();
        conns.insert(conn_id, sender);
        debug!(
            "Registered connection {} for @{} (total={})",
            conn_id,
            username,
            conns.len()
        );
    }

    /// Removes one connection. Returns true when it was the identity's last
    /// one, i.e. the user has gone fully offline.
    pub async fn deregister(&self, username: &str, conn_id: Uuid) -> bool {
        let mut map = self.inner.lock().await;
        let Some(conns) = map.get_mut(username) else {
            return false;
        };
        conns.remove(&conn_id);
        debug!(
            "Deregistered connection {} for @{} (remaining={})",
            conn_id,
            username,
            conns.len()
        );
        if conns.is_empty() {
            map.remove(username);
            true
        } else {
            false
        }
    }

    /// Delivers an event to every open connection of the identity. A missing
    /// or empty set is a no-op: offline users simply miss live events.
    pub async fn send(&self, username: &str, event: &ServerEvent) {
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Could not encode event for @{}: {}", username, e);
                return;
            }
        };
        let mut map = self.inner.lock().await;
        if let Some(conns) = map.get_mut(username) {
            // A failed send means the connection task is gone; drop it.
            conns.retain(|_, tx| tx.send(Message::Text(frame.clone())).is_ok());
            if conns.is_empty() {
                map.remove(username);
            }
        }
    }

    pub async fn is_registered(&self, username: &str) -> bool {
        self.inner.lock().await.contains_key(username)
    }

    pub async fn connection_count(&self, username: &str) -> usize {
        self.inner
            .lock()
            .await
            .get(username)
            .map(|c| c.len())
            .unwrap_or(0)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{attach, next_event};
    use super::*;

    #[tokio::test]
    async fn delivers_to_every_connection_of_the_identity() {
        let directory = ConnectionDirectory::new();
        let (_, mut rx1) = attach(&directory, "alice").await;
        let (_, mut rx2) = attach(&directory, "alice").await;

        directory
            .send("alice", &ServerEvent::UserOnline("bob".into()))
            .await;

        for rx in [&mut rx1, &mut rx2] {
            match next_event(rx) {
                Some(ServerEvent::UserOnline(who)) => assert_eq!(who, "bob"),
                other => panic!("unexpected delivery: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn sending_to_an_offline_identity_is_a_noop() {
        let directory = ConnectionDirectory::new();
        directory
            .send("ghost", &ServerEvent::Seen("alice".into()))
            .await;
        assert!(!directory.is_registered("ghost").await);
    }

    #[tokio::test]
    async fn deregister_reports_fully_offline_only_on_last_connection() {
        let directory = ConnectionDirectory::new();
        let (id1, _rx1) = attach(&directory, "alice").await;
        let (id2, _rx2) = attach(&directory, "alice").await;

        assert!(!directory.deregister("alice", id1).await);
        assert_eq!(directory.connection_count("alice").await, 1);
        assert!(directory.deregister("alice", id2).await);
        assert!(!directory.is_registered("alice").await);
    }

    #[tokio::test]
    async fn dead_connections_are_pruned_on_send() {
        let directory = ConnectionDirectory::new();
        let (_, rx) = attach(&directory, "alice").await;
        drop(rx);

        directory
            .send("alice", &ServerEvent::UserOffline("bob".into()))
            .await;
        assert!(!directory.is_registered("alice").await);
    }
}
