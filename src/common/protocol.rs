use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload kind of a chat message. The `content` field is an opaque JSON
/// value whose shape is keyed by this kind; the server never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Document,
    File,
    Link,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Video => "video",
            MessageKind::Document => "document",
            MessageKind::File => "file",
            MessageKind::Link => "link",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "video" => Some(MessageKind::Video),
            "document" => Some(MessageKind::Document),
            "file" => Some(MessageKind::File),
            "link" => Some(MessageKind::Link),
            _ => None,
        }
    }
}

/// Embedded snapshot of the message being replied to. Stored alongside the
/// new message so the client can render the quote without a lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplySnapshot {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    pub from: String,
}

/// A message as submitted by the client. `from` is never trusted from the
/// wire; the relay stamps it from the authenticated session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: Value,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplySnapshot>,
}

/// A persisted message, as delivered to recipients and echoed in send acks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: Value,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplySnapshot>,
    pub sent_at: i64,
    pub read: bool,
}

/// Public profile summary returned with invitation acks so the client can
/// render the new contact without a second round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactProfile {
    #[serde(rename = "userName")]
    pub user_name: String,
    #[serde(rename = "firstName")]
    pub first_name: Option<String>,
    #[serde(rename = "lastName")]
    pub last_name: Option<String>,
    #[serde(rename = "publicInfo")]
    pub public_info: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub who: ContactProfile,
}

// ---------------------------------------------------------------------------
// Client -> server frames
// ---------------------------------------------------------------------------

/// One inbound frame: `{"event": ..., "data": ..., "ack": <id>?}`.
/// The optional `ack` id is echoed back on the acknowledgment frame.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub ack: Option<u64>,
    #[serde(flatten)]
    pub event: ClientEvent,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "message")]
    Message(OutgoingMessage),
    #[serde(rename = "conversation select")]
    ConversationSelect(String),
    #[serde(rename = "seen")]
    Seen,
    #[serde(rename = "activity")]
    Activity(Value),
    #[serde(rename = "invite")]
    Invite(String),
    #[serde(rename = "invite response")]
    InviteResponse(InviteDecision),
}

#[derive(Debug, Clone, Deserialize)]
pub struct InviteDecision {
    pub id: i64,
    pub response: String,
}

/// Handshake frame; must be the first frame on a new connection.
#[derive(Debug, Deserialize)]
pub struct AuthFrame {
    pub event: String,
    pub data: AuthRequest,
}

#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub token: String,
}

// ---------------------------------------------------------------------------
// Server -> client frames
// ---------------------------------------------------------------------------

/// Pushed events, serialized as `{"event": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "message")]
    Message(StoredMessage),
    #[serde(rename = "activity")]
    Activity(Value),
    #[serde(rename = "seen")]
    Seen(String),
    #[serde(rename = "user online")]
    UserOnline(String),
    #[serde(rename = "user offline")]
    UserOffline(String),
}

impl ServerEvent {
    /// The self-expiring typing indicator reset.
    pub fn cleared_activity() -> Self {
        ServerEvent::Activity(serde_json::json!({ "activity": "none" }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// The persisted message on success, the rejected candidate otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectAck {
    pub success: bool,
    #[serde(
        rename = "onlineStatus",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub online_status: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteAck {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<Contact>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespondAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<Contact>,
}
