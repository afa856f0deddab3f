//! Wire protocol for the relay.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<kind>", "data": <payload>}`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Identity;
use crate::store::Message;

/// Opaque, never-reused id of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Inbound (Client -> Server)
// ============================================================================

/// Room reference: either a bare id or an object carrying one.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RoomRef {
    Bare(String),
    Object {
        #[serde(rename = "roomId", alias = "channelId")]
        room_id: String,
    },
}

impl RoomRef {
    pub fn room_id(&self) -> &str {
        match self {
            RoomRef::Bare(id) => id,
            RoomRef::Object { room_id } => room_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    #[serde(alias = "channelId")]
    pub room_id: String,
    pub content: String,
    /// Raw type; validated by the dispatcher.
    #[serde(default, rename = "type")]
    pub message_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMessage {
    #[serde(alias = "channelId")]
    pub room_id: String,
    pub message_id: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteMessage {
    #[serde(alias = "channelId")]
    pub room_id: String,
    pub message_id: String,
}

/// Events a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum InboundEvent {
    JoinChannel(RoomRef),
    LeaveChannel(RoomRef),
    SendMessage(SendMessage),
    EditMessage(EditMessage),
    DeleteMessage(DeleteMessage),
    TypingStart(RoomRef),
    TypingStop(RoomRef),
}

impl InboundEvent {
    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::JoinChannel(_) => "join-channel",
            InboundEvent::LeaveChannel(_) => "leave-channel",
            InboundEvent::SendMessage(_) => "send-message",
            InboundEvent::EditMessage(_) => "edit-message",
            InboundEvent::DeleteMessage(_) => "delete-message",
            InboundEvent::TypingStart(_) => "typing-start",
            InboundEvent::TypingStop(_) => "typing-stop",
        }
    }
}

// ============================================================================
// Outbound (Server -> Client)
// ============================================================================

/// A peer action scoped to a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPeer {
    pub user_id: String,
    pub username: String,
    pub room_id: String,
}

impl RoomPeer {
    pub fn new(identity: &Identity, room_id: &str) -> Self {
        Self {
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
            room_id: room_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedMessage {
    pub message_id: String,
}

/// Entry of the global online list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// Events sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundEvent {
    NewMessage(Message),
    MessageEdited(Message),
    MessageDeleted(DeletedMessage),
    UserJoined(RoomPeer),
    UserLeft(RoomPeer),
    UserTyping(RoomPeer),
    UserStoppedTyping(RoomPeer),
    OnlineUsers(Vec<OnlineUser>),
    Error(ErrorPayload),
}

impl OutboundEvent {
    pub fn error(message: impl Into<String>) -> Self {
        OutboundEvent::Error(ErrorPayload {
            message: message.into(),
        })
    }
}
