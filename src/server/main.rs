// Entry point for the staffetta live-session server
use log::{error, info};
use staffetta::server::{
    config::ServerConfig, connection, database::Database, directory::ConnectionDirectory,
    presence::PresenceRegistry,
};
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    std::env::set_var("RUST_LOG", &config.log_level);
    env_logger::init();

    let database = Arc::new(Database::connect(&config.database_url).await?);

    info!("Running database migrations...");
    database.migrate().await.map_err(|e| {
        error!("Database migration failed: {}", e);
        e
    })?;
    info!("Database migrations completed");

    let directory = ConnectionDirectory::new();
    let presence = PresenceRegistry::new(database.clone(), directory.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        info!("New connection from {}", peer);
        let db = database.clone();
        let directory = directory.clone();
        let presence = presence.clone();
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = connection::handle_connection(stream, db, directory, presence, config).await
            {
                error!("Client error ({}): {}", peer, e);
            }
        });
    }
}
