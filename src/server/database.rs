use log::{debug, info};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        info!("Connecting to database: {}", database_url);

        // Strip the sqlite scheme and query string to get the on-disk path,
        // creating the parent directory when it does not exist yet.
        let file_path = if let Some(rest) = database_url.strip_prefix("sqlite://") {
            rest.split('?').next().unwrap_or(rest)
        } else if let Some(rest) = database_url.strip_prefix("sqlite:") {
            rest.split('?').next().unwrap_or(rest)
        } else {
            database_url
        };

        if file_path != ":memory:" {
            if let Some(parent) = std::path::Path::new(file_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    debug!("Creating database directory {:?}", parent);
                    std::fs::create_dir_all(parent)
                        .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
                }
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        info!("Database connection established");
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Users. Credentials live with the login service; this core reads the
        // profile, presence flag and last connection time.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                first_name TEXT,
                last_name TEXT,
                public_info TEXT,
                is_online INTEGER NOT NULL DEFAULT 0,
                last_connected INTEGER
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Contact lists. A row (user, peer) means peer is on user's list;
        // the relation is one-sided between invite and accept.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS contacts (
                user_id TEXT NOT NULL,
                peer_id TEXT NOT NULL,
                last_message_id INTEGER,
                PRIMARY KEY (user_id, peer_id)
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Messages are append-only; only the read flag ever changes.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                content TEXT NOT NULL,
                from_user TEXT NOT NULL,
                to_user TEXT NOT NULL,
                caption TEXT,
                reply_to TEXT,
                sent_at INTEGER NOT NULL,
                read INTEGER NOT NULL DEFAULT 0
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Invites: pending until exactly one of accepted/refused is set.
        // The seen flag is written by the HTTP invite-listing endpoint.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS invites (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_id TEXT NOT NULL,
                to_id TEXT NOT NULL,
                accepted INTEGER NOT NULL DEFAULT 0,
                refused INTEGER NOT NULL DEFAULT 0,
                seen INTEGER NOT NULL DEFAULT 0,
                sent_at INTEGER NOT NULL,
                UNIQUE (from_id, to_id)
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Sessions are issued by the login service and only verified here.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                user_id TEXT NOT NULL,
                session_token TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
