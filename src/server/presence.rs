use crate::common::protocol::ServerEvent;
use crate::server::database::Database;
use crate::server::directory::ConnectionDirectory;
use log::info;
use sqlx::Row;
use std::sync::Arc;

/// Tracks the persisted online flag and fans presence transitions out to the
/// user's currently-online contacts.
#[derive(Clone)]
pub struct PresenceRegistry {
    db: Arc<Database>,
    directory: ConnectionDirectory,
}

impl PresenceRegistry {
    pub fn new(db: Arc<Database>, directory: ConnectionDirectory) -> Self {
        Self { db, directory }
    }

    /// Persists the transition, then notifies contacts. A storage failure
    /// aborts before any contact hears about it.
    pub async fn set_online(&self, user_id: &str, username: &str) -> Result<(), sqlx::Error> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE users SET is_online = 1, last_connected = ? WHERE id = ?")
            .bind(now)
            .bind(user_id)
            .execute(&self.db.pool)
            .await?;
        info!("@{} is online", username);
        self.notify_contacts(user_id, ServerEvent::UserOnline(username.to_string()))
            .await;
        Ok(())
    }

    pub async fn set_offline(&self, user_id: &str, username: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE users SET is_online = 0 WHERE id = ?")
            .bind(user_id)
            .execute(&self.db.pool)
            .await?;
        info!("@{} is offline", username);
        self.notify_contacts(user_id, ServerEvent::UserOffline(username.to_string()))
            .await;
        Ok(())
    }

    async fn notify_contacts(&self, user_id: &str, event: ServerEvent) {
        let rows = sqlx::query(
            "SELECT u.username FROM contacts c \
             JOIN users u ON u.id = c.peer_id \
             WHERE c.user_id = ? AND u.is_online = 1",
        )
        .bind(user_id)
        .fetch_all(&self.db.pool)
        .await;

        match rows {
            Ok(rows) => {
                for row in rows {
                    let contact: String = row.get("username");
                    self.directory.send(&contact, &event).await;
                }
            }
            Err(e) => {
                log::error!("Could not load contacts for presence fan-out: {}", e);
            }
        }
    }
}
