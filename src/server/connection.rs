use crate::common::protocol::{AuthAck, AuthFrame, ClientEvent, ClientFrame};
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::directory::ConnectionDirectory;
use crate::server::presence::PresenceRegistry;
use crate::server::session::Session;
use crate::server::{activity, auth, invites, messages};
use anyhow::anyhow;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use uuid::Uuid;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Runs one client connection end to end: WebSocket upgrade, token
/// handshake, registration, serial event loop, teardown. Handlers for a
/// connection run one at a time in arrival order, so the session state
/// needs no locking.
pub async fn handle_connection(
    stream: TcpStream,
    db: Arc<Database>,
    directory: ConnectionDirectory,
    presence: PresenceRegistry,
    config: ServerConfig,
) -> anyhow::Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // The first frame must carry the bearer token; nothing else is handled
    // before the identity is verified.
    let handshake = tokio::time::timeout(
        Duration::from_secs(config.auth_timeout_secs),
        ws_receiver.next(),
    )
    .await;

    let token = match handshake {
        Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<AuthFrame>(&text) {
            Ok(frame) if frame.event == "auth" => frame.data.token,
            _ => {
                reject(&mut ws_sender, "Expected an auth frame").await;
                return Err(anyhow!("handshake did not present credentials"));
            }
        },
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Ok(()),
        Ok(Some(Ok(_))) => {
            reject(&mut ws_sender, "Expected an auth frame").await;
            return Err(anyhow!("handshake did not present credentials"));
        }
        Ok(Some(Err(e))) => return Err(e.into()),
        Err(_) => {
            reject(&mut ws_sender, "Authentication timeout").await;
            return Err(anyhow!("authentication timeout"));
        }
    };

    let Some(user) = auth::authenticate(&db, &token).await else {
        reject(&mut ws_sender, "Invalid or expired token").await;
        return Err(anyhow!("authentication failed"));
    };
    info!("@{} is connected", user.username);

    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = unbounded_channel::<Message>();

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
    });

    directory.register(&user.username, conn_id, tx.clone()).await;
    if let Err(e) = presence.set_online(&user.id, &user.username).await {
        error!("Could not set @{} online: {}", user.username, e);
    }

    let hello = AuthAck {
        success: true,
        username: Some(user.username.clone()),
        error: None,
    };
    let _ = tx.send(Message::Text(
        json!({ "event": "auth", "data": hello }).to_string(),
    ));

    let mut session = Session::new(user.id.clone(), user.username.clone());
    let quiet = Duration::from_secs(config.activity_quiet_secs);

    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_frame(&text, &db, &directory, &mut session, &tx, quiet).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("@{} connection error: {}", user.username, e);
                break;
            }
        }
    }

    // Teardown runs every step even when one fails: cancel the pending
    // activity clear, drop the connection from the directory, and flip the
    // persisted flag only once no connection remains for the identity.
    session.bump_activity_epoch();
    let fully_offline = directory.deregister(&user.username, conn_id).await;
    if fully_offline {
        if let Err(e) = presence.set_offline(&user.id, &user.username).await {
            error!("Could not set @{} offline: {}", user.username, e);
        }
    }
    send_task.abort();
    info!("@{} disconnected", user.username);
    Ok(())
}

async fn reject(ws_sender: &mut WsSink, error: &str) {
    let ack = AuthAck {
        success: false,
        username: None,
        error: Some(error.to_string()),
    };
    let _ = ws_sender
        .send(Message::Text(
            json!({ "event": "auth", "data": ack }).to_string(),
        ))
        .await;
    let _ = ws_sender.close().await;
}

async fn handle_frame(
    text: &str,
    db: &Arc<Database>,
    directory: &ConnectionDirectory,
    session: &mut Session,
    tx: &UnboundedSender<Message>,
    quiet: Duration,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Ignoring unparseable frame from @{}: {}", session.username, e);
            return;
        }
    };

    match frame.event {
        ClientEvent::Message(candidate) => {
            let ack = messages::send(db.clone(), directory, session, candidate).await;
            reply(tx, frame.ack, &ack);
        }
        ClientEvent::ConversationSelect(username) => {
            let ack = messages::select_conversation(db.clone(), directory, session, &username).await;
            reply(tx, frame.ack, &ack);
        }
        ClientEvent::Seen => {
            messages::mark_seen(db.clone(), directory, session).await;
        }
        ClientEvent::Activity(payload) => {
            activity::signal_activity(directory, session, payload, quiet).await;
        }
        ClientEvent::Invite(username) => {
            let ack = invites::invite(db.clone(), session, &username).await;
            reply(tx, frame.ack, &ack);
        }
        ClientEvent::InviteResponse(decision) => {
            let ack = invites::respond(db.clone(), session, &decision).await;
            reply(tx, frame.ack, &ack);
        }
    }
}

fn reply<T: Serialize>(tx: &UnboundedSender<Message>, ack: Option<u64>, payload: &T) {
    let Some(id) = ack else {
        return;
    };
    match serde_json::to_value(payload) {
        Ok(data) => {
            let _ = tx.send(Message::Text(json!({ "ack": id, "data": data }).to_string()));
        }
        Err(e) => error!("Could not encode acknowledgment: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::database::testing::{add_contact, insert_session, insert_user, memory_db};
    use futures_util::stream::SplitStream;
    use serde_json::Value;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{connect_async, MaybeTlsStream};

    type ClientRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;
    type ClientWrite =
        SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

    fn test_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: String::new(),
            log_level: "info".into(),
            activity_quiet_secs: 3,
            auth_timeout_secs: 5,
        }
    }

    async fn spawn_server() -> (std::net::SocketAddr, Arc<Database>) {
        let db = memory_db().await;
        let directory = ConnectionDirectory::new();
        let presence = PresenceRegistry::new(db.clone(), directory.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept_db = db.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let db = accept_db.clone();
                let directory = directory.clone();
                let presence = presence.clone();
                tokio::spawn(async move {
                    let _ =
                        handle_connection(stream, db, directory, presence, test_config()).await;
                });
            }
        });

        (addr, db)
    }

    async fn connect(addr: std::net::SocketAddr) -> (ClientWrite, ClientRead) {
        let (stream, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
        stream.split()
    }

    async fn next_json(read: &mut ClientRead) -> Value {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), read.next())
                .await
                .expect("frame within timeout")
                .expect("stream open")
                .expect("frame ok");
            if let Message::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn login(
        addr: std::net::SocketAddr,
        token: &str,
    ) -> (ClientWrite, ClientRead) {
        let (mut write, mut read) = connect(addr).await;
        write
            .send(Message::Text(
                json!({ "event": "auth", "data": { "token": token } }).to_string(),
            ))
            .await
            .unwrap();
        let hello = next_json(&mut read).await;
        assert_eq!(hello["event"], "auth");
        assert_eq!(hello["data"]["success"], true);
        (write, read)
    }

    #[tokio::test]
    async fn handshake_refuses_bad_credentials_before_any_event_handling() {
        let (addr, _db) = spawn_server().await;
        let (mut write, mut read) = connect(addr).await;

        write
            .send(Message::Text(
                json!({ "event": "auth", "data": { "token": "bogus" } }).to_string(),
            ))
            .await
            .unwrap();

        let response = next_json(&mut read).await;
        assert_eq!(response["event"], "auth");
        assert_eq!(response["data"]["success"], false);

        // Server closes; nothing but a close frame may follow.
        let next = tokio::time::timeout(Duration::from_secs(5), read.next())
            .await
            .expect("closed within timeout");
        assert!(matches!(next, None | Some(Ok(Message::Close(_)))));
    }

    #[tokio::test]
    async fn select_send_and_seen_flow_across_two_live_connections() {
        let (addr, db) = spawn_server().await;
        let expires = chrono::Utc::now().timestamp() + 3600;
        insert_user(&db, "u1", "alice").await;
        insert_user(&db, "u2", "bob").await;
        add_contact(&db, "u1", "u2").await;
        add_contact(&db, "u2", "u1").await;
        insert_session(&db, "u1", "tok-alice", expires).await;
        insert_session(&db, "u2", "tok-bob", expires).await;

        let (_bob_write, mut bob_read) = login(addr, "tok-bob").await;
        let (mut alice_write, mut alice_read) = login(addr, "tok-alice").await;

        // bob, online and a contact, hears about alice's arrival
        let event = next_json(&mut bob_read).await;
        assert_eq!(event["event"], "user online");
        assert_eq!(event["data"], "alice");

        alice_write
            .send(Message::Text(
                json!({ "event": "conversation select", "data": "bob", "ack": 1 }).to_string(),
            ))
            .await
            .unwrap();
        let ack = next_json(&mut alice_read).await;
        assert_eq!(ack["ack"], 1);
        assert_eq!(ack["data"]["success"], true);
        assert_eq!(ack["data"]["onlineStatus"], true);

        let seen = next_json(&mut bob_read).await;
        assert_eq!(seen["event"], "seen");
        assert_eq!(seen["data"], "alice");

        alice_write
            .send(Message::Text(
                json!({
                    "event": "message",
                    "data": { "type": "text", "content": "hi", "to": "bob" },
                    "ack": 2
                })
                .to_string(),
            ))
            .await
            .unwrap();
        let ack = next_json(&mut alice_read).await;
        assert_eq!(ack["ack"], 2);
        assert_eq!(ack["data"]["success"], true);
        assert!(ack["data"]["message"]["sentAt"].as_i64().unwrap() > 0);

        let delivered = next_json(&mut bob_read).await;
        assert_eq!(delivered["event"], "message");
        assert_eq!(delivered["data"]["from"], "alice");
        assert_eq!(delivered["data"]["content"], "hi");
        let cleared = next_json(&mut bob_read).await;
        assert_eq!(cleared["event"], "activity");
        assert_eq!(cleared["data"]["activity"], "none");
    }

    #[tokio::test]
    async fn sending_without_selecting_is_acked_unauthorized_over_the_wire() {
        let (addr, db) = spawn_server().await;
        let expires = chrono::Utc::now().timestamp() + 3600;
        insert_user(&db, "u1", "alice").await;
        insert_user(&db, "u2", "bob").await;
        insert_session(&db, "u1", "tok-alice", expires).await;

        let (mut write, mut read) = login(addr, "tok-alice").await;
        write
            .send(Message::Text(
                json!({
                    "event": "message",
                    "data": { "type": "text", "content": "hi", "to": "bob" },
                    "ack": 1
                })
                .to_string(),
            ))
            .await
            .unwrap();

        let ack = next_json(&mut read).await;
        assert_eq!(ack["ack"], 1);
        assert_eq!(ack["data"]["success"], false);
        assert_eq!(ack["data"]["reason"], "Unauthorized");
    }

    #[tokio::test]
    async fn invite_and_accept_over_the_wire() {
        let (addr, db) = spawn_server().await;
        let expires = chrono::Utc::now().timestamp() + 3600;
        insert_user(&db, "u1", "alice").await;
        insert_user(&db, "u2", "bob").await;
        insert_session(&db, "u1", "tok-alice", expires).await;
        insert_session(&db, "u2", "tok-bob", expires).await;

        let (mut alice_write, mut alice_read) = login(addr, "tok-alice").await;
        let (mut bob_write, mut bob_read) = login(addr, "tok-bob").await;

        alice_write
            .send(Message::Text(
                json!({ "event": "invite", "data": "bob", "ack": 1 }).to_string(),
            ))
            .await
            .unwrap();
        let ack = next_json(&mut alice_read).await;
        assert_eq!(ack["data"]["success"], true);
        assert_eq!(ack["data"]["contact"]["who"]["userName"], "bob");

        let invite_id: i64 = {
            use sqlx::Row;
            sqlx::query("SELECT id FROM invites WHERE from_id = 'u1' AND to_id = 'u2'")
                .fetch_one(&db.pool)
                .await
                .unwrap()
                .get("id")
        };

        bob_write
            .send(Message::Text(
                json!({
                    "event": "invite response",
                    "data": { "id": invite_id, "response": "accept" },
                    "ack": 1
                })
                .to_string(),
            ))
            .await
            .unwrap();
        let ack = next_json(&mut bob_read).await;
        assert_eq!(ack["data"]["success"], true);
        assert_eq!(ack["data"]["contact"]["who"]["userName"], "alice");
    }

    #[tokio::test]
    async fn disconnect_flips_presence_for_contacts() {
        let (addr, db) = spawn_server().await;
        let expires = chrono::Utc::now().timestamp() + 3600;
        insert_user(&db, "u1", "alice").await;
        insert_user(&db, "u2", "bob").await;
        add_contact(&db, "u1", "u2").await;
        add_contact(&db, "u2", "u1").await;
        insert_session(&db, "u1", "tok-alice", expires).await;
        insert_session(&db, "u2", "tok-bob", expires).await;

        let (_bob_write, mut bob_read) = login(addr, "tok-bob").await;
        let (mut alice_write, _alice_read) = login(addr, "tok-alice").await;

        let event = next_json(&mut bob_read).await;
        assert_eq!(event["event"], "user online");

        alice_write.send(Message::Close(None)).await.unwrap();
        let event = next_json(&mut bob_read).await;
        assert_eq!(event["event"], "user offline");
        assert_eq!(event["data"], "alice");

        // Persisted flag follows the last connection.
        use sqlx::Row;
        let row = sqlx::query("SELECT is_online FROM users WHERE id = 'u1'")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>("is_online"), 0);
    }
}
