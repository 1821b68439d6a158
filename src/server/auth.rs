use crate::server::database::Database;
use log::debug;
use sqlx::Row;

/// Identity derived from a verified handshake token.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub id: String,
    pub username: String,
}

/// Verifies the bearer token presented at handshake time. Token issuance is
/// the login service's job; here we only check the session row exists and
/// has not expired.
pub async fn authenticate(db: &Database, token: &str) -> Option<AuthedUser> {
    let now = chrono::Utc::now().timestamp();
    let row = sqlx::query(
        "SELECT u.id, u.username FROM sessions s \
         JOIN users u ON u.id = s.user_id \
         WHERE s.session_token = ? AND s.expires_at > ?",
    )
    .bind(token)
    .bind(now)
    .fetch_optional(&db.pool)
    .await
    .ok()?;

    match row {
        Some(row) => {
            let user = AuthedUser {
                id: row.get("id"),
                username: row.get("username"),
            };
            debug!("Token verified for @{}", user.username);
            Some(user)
        }
        None => {
            debug!("Handshake token invalid or expired");
            None
        }
    }
}
