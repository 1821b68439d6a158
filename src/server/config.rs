use std::env;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub log_level: String,
    /// Quiet period after the last typing signal before the indicator is
    /// cleared on the peer's side.
    pub activity_quiet_secs: u64,
    /// How long a fresh connection may take to present its auth token.
    pub auth_timeout_secs: u64,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("SERVER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5000),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:data/staffetta.db".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            activity_quiet_secs: env::var("ACTIVITY_QUIET_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            auth_timeout_secs: env::var("AUTH_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}
