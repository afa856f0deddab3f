//! Persisted records.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::auth::Identity;

/// Kind of message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Text => write!(f, "text"),
            MessageType::Image => write!(f, "image"),
            MessageType::File => write!(f, "file"),
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "image" => Ok(MessageType::Image),
            "file" => Ok(MessageType::File),
            _ => Err(format!("Invalid message type: {}", s)),
        }
    }
}

impl TryFrom<String> for MessageType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// User row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    pub is_online: bool,
    pub last_seen: Option<String>,
    pub created_at: String,
}

impl From<User> for Identity {
    fn from(user: User) -> Self {
        Identity::new(user.id, user.username)
    }
}

/// Message author as embedded in message records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: String,
    pub username: String,
}

/// Canonical stored message, as broadcast to rooms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    /// Store-assigned ordering key.
    pub seq: i64,
    pub room_id: String,
    pub content: String,
    pub sender: Sender,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Flat row for messages joined with their sender.
#[derive(Debug, FromRow)]
pub(super) struct MessageRow {
    pub seq: i64,
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub content: String,
    #[sqlx(try_from = "String")]
    pub message_type: MessageType,
    pub is_edited: bool,
    pub is_deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl From<MessageRow> for Message {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            seq: row.seq,
            room_id: row.room_id,
            content: row.content,
            sender: Sender {
                id: row.sender_id,
                username: row.sender_username,
            },
            message_type: row.message_type,
            is_edited: row.is_edited,
            is_deleted: row.is_deleted,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_parse() {
        assert_eq!("image".parse::<MessageType>().unwrap(), MessageType::Image);
        assert!("video".parse::<MessageType>().is_err());
        assert_eq!(MessageType::File.to_string(), "file");
    }

    #[test]
    fn test_message_serializes_camel_case() {
        let message = Message {
            id: "msg_1".to_string(),
            seq: 7,
            room_id: "general".to_string(),
            content: "hi".to_string(),
            sender: Sender {
                id: "u1".to_string(),
                username: "alice".to_string(),
            },
            message_type: MessageType::Text,
            is_edited: false,
            is_deleted: false,
            created_at: "2024-01-01T00:00:00Z".to_string(),
            updated_at: "2024-01-01T00:00:00Z".to_string(),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["roomId"], "general");
        assert_eq!(json["type"], "text");
        assert_eq!(json["isEdited"], false);
        assert_eq!(json["sender"]["username"], "alice");
    }
}
