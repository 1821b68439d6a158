use crate::common::protocol::{OutgoingMessage, SelectAck, SendAck, ServerEvent, StoredMessage};
use crate::server::database::Database;
use crate::server::directory::ConnectionDirectory;
use crate::server::session::Session;
use log::{error, info};
use sqlx::Row;
use std::sync::Arc;

/// Relays a message to the session's selected peer, persisting it first.
///
/// Authorization rule: the sender may only address the peer they currently
/// have selected. Anything else is rejected without touching storage. On a
/// storage failure nothing is delivered either, so the recipient never sees
/// a message that was not persisted. There is no idempotency key: a client
/// retry after a lost ack will create a duplicate row.
pub async fn send(
    db: Arc<Database>,
    directory: &ConnectionDirectory,
    session: &Session,
    candidate: OutgoingMessage,
) -> SendAck {
    if session.selected_peer.as_deref() != Some(candidate.to.as_str()) {
        return SendAck {
            success: false,
            reason: Some("Unauthorized".to_string()),
            message: serde_json::to_value(&candidate).ok(),
        };
    }

    let sent_at = chrono::Utc::now().timestamp();
    let reply_to_json = candidate
        .reply_to
        .as_ref()
        .and_then(|r| serde_json::to_string(r).ok());

    let res = sqlx::query(
        "INSERT INTO messages (kind, content, from_user, to_user, caption, reply_to, sent_at, read) \
         VALUES (?, ?, ?, ?, ?, ?, ?, 0)",
    )
    .bind(candidate.kind.as_str())
    .bind(candidate.content.to_string())
    .bind(&session.username)
    .bind(&candidate.to)
    .bind(&candidate.caption)
    .bind(&reply_to_json)
    .bind(sent_at)
    .execute(&db.pool)
    .await;

    let id = match res {
        Ok(res) => res.last_insert_rowid(),
        Err(e) => {
            error!("Could not persist message from @{}: {}", session.username, e);
            return SendAck {
                success: false,
                reason: Some("Server could not send message".to_string()),
                message: serde_json::to_value(&candidate).ok(),
            };
        }
    };

    let stored = StoredMessage {
        id,
        kind: candidate.kind,
        content: candidate.content,
        from: session.username.clone(),
        to: candidate.to,
        caption: candidate.caption,
        reply_to: candidate.reply_to,
        sent_at,
        read: false,
    };

    // The "last message" pointer on both contact entries is part of the same
    // logical operation as the persist, not a hidden trigger. The recipient
    // may not list the sender yet (pending invite); that side updates zero
    // rows.
    update_last_message(&db, &stored.from, &stored.to, id).await;

    directory
        .send(&stored.to, &ServerEvent::Message(stored.clone()))
        .await;
    // A fresh message makes any lingering typing indicator stale.
    directory
        .send(&stored.to, &ServerEvent::cleared_activity())
        .await;

    info!("@{} -> @{} message {} relayed", stored.from, stored.to, id);
    SendAck {
        success: true,
        reason: None,
        message: serde_json::to_value(&stored).ok(),
    }
}

async fn update_last_message(db: &Database, from: &str, to: &str, message_id: i64) {
    let ids = sqlx::query("SELECT id, username FROM users WHERE username IN (?, ?)")
        .bind(from)
        .bind(to)
        .fetch_all(&db.pool)
        .await;
    let rows = match ids {
        Ok(rows) => rows,
        Err(e) => {
            error!("Could not resolve ids for last-message update: {}", e);
            return;
        }
    };
    let mut from_id = None;
    let mut to_id = None;
    for row in rows {
        let username: String = row.get("username");
        if username == from {
            from_id = Some(row.get::<String, _>("id"));
        } else if username == to {
            to_id = Some(row.get::<String, _>("id"));
        }
    }
    let (Some(from_id), Some(to_id)) = (from_id, to_id) else {
        return;
    };

    for (owner, peer) in [(&from_id, &to_id), (&to_id, &from_id)] {
        if let Err(e) =
            sqlx::query("UPDATE contacts SET last_message_id = ? WHERE user_id = ? AND peer_id = ?")
                .bind(message_id)
                .bind(owner)
                .bind(peer)
                .execute(&db.pool)
                .await
        {
            error!("Could not update last-message pointer: {}", e);
        }
    }
}

/// Selects the active conversation peer for this session.
///
/// The peer must be on the caller's contact list (an accepted-invitation
/// relationship, or the inviter's provisional entry). On success the peer's
/// unread messages toward the caller are marked read, the peer is notified
/// with a `seen` event, and the ack carries the peer's persisted online flag.
pub async fn select_conversation(
    db: Arc<Database>,
    directory: &ConnectionDirectory,
    session: &mut Session,
    peer_username: &str,
) -> SelectAck {
    info!("@{} wants to talk with @{}", session.username, peer_username);

    let is_contact = sqlx::query(
        "SELECT 1 FROM contacts c \
         JOIN users u ON u.id = c.peer_id \
         WHERE c.user_id = ? AND u.username = ?",
    )
    .bind(&session.user_id)
    .bind(peer_username)
    .fetch_optional(&db.pool)
    .await;

    match is_contact {
        Ok(Some(_)) => {}
        Ok(None) => {
            return SelectAck {
                success: false,
                online_status: None,
                message: Some("Unauthorized".to_string()),
            };
        }
        Err(e) => {
            error!("Contact lookup failed for @{}: {}", session.username, e);
            return SelectAck {
                success: false,
                online_status: None,
                message: Some("Could not select conversation".to_string()),
            };
        }
    }

    session.selected_peer = Some(peer_username.to_string());
    mark_conversation_read(&db, &session.username, peer_username).await;
    directory
        .send(peer_username, &ServerEvent::Seen(session.username.clone()))
        .await;

    let online = sqlx::query("SELECT is_online FROM users WHERE username = ?")
        .bind(peer_username)
        .fetch_optional(&db.pool)
        .await
        .ok()
        .flatten()
        .map(|row| row.get::<i64, _>("is_online") != 0)
        .unwrap_or(false);

    SelectAck {
        success: true,
        online_status: Some(online),
        message: None,
    }
}

/// Re-applies the mark-as-read step for the currently selected peer, used
/// when the user re-focuses an already-open conversation. No-op without a
/// selection.
pub async fn mark_seen(db: Arc<Database>, directory: &ConnectionDirectory, session: &Session) {
    let Some(peer) = session.selected_peer.clone() else {
        return;
    };
    mark_conversation_read(&db, &session.username, &peer).await;
    directory
        .send(&peer, &ServerEvent::Seen(session.username.clone()))
        .await;
}

async fn mark_conversation_read(db: &Database, reader: &str, peer: &str) {
    if let Err(e) =
        sqlx::query("UPDATE messages SET read = 1 WHERE to_user = ? AND from_user = ? AND read = 0")
            .bind(reader)
            .bind(peer)
            .execute(&db.pool)
            .await
    {
        error!("Could not mark conversation @{} <- @{} read: {}", reader, peer, e);
    }
}
