use crate::common::protocol::{Contact, ContactProfile, InviteAck, InviteDecision, RespondAck};
use crate::server::database::Database;
use crate::server::session::Session;
use log::{error, info};
use sqlx::Row;
use std::sync::Arc;

fn profile_from_row(row: &sqlx::sqlite::SqliteRow) -> ContactProfile {
    let public_info: Option<String> = row.get("public_info");
    ContactProfile {
        user_name: row.get("username"),
        first_name: row.get("first_name"),
        last_name: row.get("last_name"),
        public_info: public_info
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or(serde_json::Value::Null),
    }
}

async fn load_profile(db: &Database, user_id: &str) -> Option<ContactProfile> {
    let row = sqlx::query(
        "SELECT username, first_name, last_name, public_info FROM users WHERE id = ?",
    )
    .bind(user_id)
    .fetch_optional(&db.pool)
    .await
    .ok()??;
    Some(profile_from_row(&row))
}

/// Creates a pending invite toward `who` and adds them to the *inviter's*
/// contact list right away. The invitee's list is only touched on accept,
/// so the relationship is deliberately one-sided until then (preserved
/// source behavior, see DESIGN.md).
pub async fn invite(db: Arc<Database>, session: &Session, who: &str) -> InviteAck {
    let target = sqlx::query(
        "SELECT id, username, first_name, last_name, public_info FROM users WHERE username = ?",
    )
    .bind(who)
    .fetch_optional(&db.pool)
    .await;

    let target = match target {
        Ok(Some(row)) => row,
        Ok(None) => {
            return InviteAck {
                success: false,
                message: format!("No user with username @{}", who),
                contact: None,
            };
        }
        Err(e) => {
            error!("Could not look up invite target @{}: {}", who, e);
            return InviteAck {
                success: false,
                message: "Could not create invite".to_string(),
                contact: None,
            };
        }
    };
    let target_id: String = target.get("id");

    let already_contact = sqlx::query("SELECT 1 FROM contacts WHERE user_id = ? AND peer_id = ?")
        .bind(&session.user_id)
        .bind(&target_id)
        .fetch_optional(&db.pool)
        .await
        .ok()
        .flatten()
        .is_some();
    if already_contact {
        return InviteAck {
            success: false,
            message: "Already a contact".to_string(),
            contact: None,
        };
    }

    // A reverse invite, whatever its state, blocks a new one in this
    // direction; it is reported as already-pending, never auto-accepted.
    let reverse_exists = sqlx::query("SELECT 1 FROM invites WHERE from_id = ? AND to_id = ?")
        .bind(&target_id)
        .bind(&session.user_id)
        .fetch_optional(&db.pool)
        .await
        .ok()
        .flatten()
        .is_some();
    if reverse_exists {
        return InviteAck {
            success: false,
            message: format!("@{} has already invited you", who),
            contact: None,
        };
    }

    let now = chrono::Utc::now().timestamp();
    let res = sqlx::query(
        "INSERT INTO invites (from_id, to_id, accepted, refused, seen, sent_at) \
         VALUES (?, ?, 0, 0, 0, ?)",
    )
    .bind(&session.user_id)
    .bind(&target_id)
    .bind(now)
    .execute(&db.pool)
    .await;

    if let Err(e) = res {
        // At most one invite per ordered (from, to) pair.
        if e.to_string().to_lowercase().contains("unique") {
            return InviteAck {
                success: false,
                message: "Invite already sent".to_string(),
                contact: None,
            };
        }
        error!("Could not create invite @{} -> @{}: {}", session.username, who, e);
        return InviteAck {
            success: false,
            message: "Could not create invite".to_string(),
            contact: None,
        };
    }

    if let Err(e) = sqlx::query("INSERT OR IGNORE INTO contacts (user_id, peer_id) VALUES (?, ?)")
        .bind(&session.user_id)
        .bind(&target_id)
        .execute(&db.pool)
        .await
    {
        error!("Could not add @{} to @{}'s contacts: {}", who, session.username, e);
        return InviteAck {
            success: false,
            message: "Could not create invite".to_string(),
            contact: None,
        };
    }

    info!("@{} invited @{}", session.username, who);
    InviteAck {
        success: true,
        message: "Invite sent successfully".to_string(),
        contact: Some(Contact {
            who: profile_from_row(&target),
        }),
    }
}

/// Resolves a pending invite. Only the invited identity may respond, a
/// terminal invite is never reopened, and accepting is idempotent on the
/// contact row.
pub async fn respond(db: Arc<Database>, session: &Session, decision: &InviteDecision) -> RespondAck {
    let row = sqlx::query("SELECT from_id, to_id, accepted, refused FROM invites WHERE id = ?")
        .bind(decision.id)
        .fetch_optional(&db.pool)
        .await;

    let row = match row {
        Ok(Some(row)) => row,
        Ok(None) => {
            return RespondAck {
                success: false,
                message: Some("Invite not found".to_string()),
                contact: None,
            };
        }
        Err(e) => {
            error!("Could not load invite {}: {}", decision.id, e);
            return RespondAck {
                success: false,
                message: Some("Could not process invite response".to_string()),
                contact: None,
            };
        }
    };

    let from_id: String = row.get("from_id");
    let to_id: String = row.get("to_id");
    if to_id != session.user_id {
        return RespondAck {
            success: false,
            message: Some("Unauthorized".to_string()),
            contact: None,
        };
    }
    if row.get::<i64, _>("accepted") != 0 || row.get::<i64, _>("refused") != 0 {
        return RespondAck {
            success: false,
            message: Some("Invite already handled".to_string()),
            contact: None,
        };
    }

    match decision.response.as_str() {
        "accept" => {
            let update = sqlx::query("UPDATE invites SET accepted = 1, refused = 0 WHERE id = ?")
                .bind(decision.id)
                .execute(&db.pool)
                .await;
            if let Err(e) = update {
                error!("Could not accept invite {}: {}", decision.id, e);
                return RespondAck {
                    success: false,
                    message: Some("Could not process invite response".to_string()),
                    contact: None,
                };
            }
            if let Err(e) =
                sqlx::query("INSERT OR IGNORE INTO contacts (user_id, peer_id) VALUES (?, ?)")
                    .bind(&session.user_id)
                    .bind(&from_id)
                    .execute(&db.pool)
                    .await
            {
                error!("Could not add accepted contact for @{}: {}", session.username, e);
            }
            info!("@{} accepted invite {}", session.username, decision.id);
            RespondAck {
                success: true,
                message: None,
                contact: load_profile(&db, &from_id).await.map(|who| Contact { who }),
            }
        }
        "refuse" => {
            let update = sqlx::query("UPDATE invites SET accepted = 0, refused = 1 WHERE id = ?")
                .bind(decision.id)
                .execute(&db.pool)
                .await;
            if let Err(e) = update {
                error!("Could not refuse invite {}: {}", decision.id, e);
                return RespondAck {
                    success: false,
                    message: Some("Could not process invite response".to_string()),
                    contact: None,
                };
            }
            info!("@{} refused invite {}", session.username, decision.id);
            RespondAck {
                success: true,
                message: None,
                contact: None,
            }
        }
        _ => RespondAck {
            success: false,
            message: Some("Invalid response".to_string()),
            contact: None,
        },
    }
}
