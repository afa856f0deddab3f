//! Inbound event handling.

use std::sync::Arc;

use log::{debug, warn};

use super::error::RelayError;
use super::rooms::RoomRouter;
use super::types::{
    ConnectionId, DeleteMessage, DeletedMessage, EditMessage, InboundEvent, OutboundEvent,
    RoomPeer, SendMessage,
};
use crate::auth::Identity;
use crate::store::{MessageStore, MessageType};

/// Who sent an inbound event.
#[derive(Debug, Clone)]
pub struct Origin {
    pub connection_id: ConnectionId,
    pub identity: Identity,
}

/// Decodes inbound events and turns them into membership changes, store
/// mutations and room broadcasts.
pub struct EventDispatcher {
    rooms: Arc<RoomRouter>,
    messages: Arc<dyn MessageStore>,
    max_message_len: usize,
}

impl EventDispatcher {
    pub fn new(
        rooms: Arc<RoomRouter>,
        messages: Arc<dyn MessageStore>,
        max_message_len: usize,
    ) -> Self {
        Self {
            rooms,
            messages,
            max_message_len,
        }
    }

    /// Decode a text frame.
    pub fn decode(text: &str) -> Result<InboundEvent, RelayError> {
        serde_json::from_str(text).map_err(|e| {
            debug!("Rejected inbound frame: {}", e);
            RelayError::protocol("Invalid event payload")
        })
    }

    /// Decode and handle one text frame.
    pub async fn handle_text(&self, origin: &Origin, text: &str) -> Result<(), RelayError> {
        let event = Self::decode(text)?;
        self.dispatch(origin, event).await
    }

    /// Handle one decoded event.
    pub async fn dispatch(&self, origin: &Origin, event: InboundEvent) -> Result<(), RelayError> {
        debug!(
            "{} from {} on {}",
            event.kind(),
            origin.identity,
            origin.connection_id
        );

        match event {
            InboundEvent::JoinChannel(room) => {
                let room_id = validate_room_id(room.room_id())?;
                if self.rooms.join(origin.connection_id, room_id) {
                    self.notify_peers(origin, room_id, OutboundEvent::UserJoined);
                }
                Ok(())
            }
            InboundEvent::LeaveChannel(room) => {
                let room_id = validate_room_id(room.room_id())?;
                if self.rooms.leave(origin.connection_id, room_id) {
                    self.notify_peers(origin, room_id, OutboundEvent::UserLeft);
                }
                Ok(())
            }
            InboundEvent::TypingStart(room) => {
                let room_id = validate_room_id(room.room_id())?;
                self.notify_peers(origin, room_id, OutboundEvent::UserTyping);
                Ok(())
            }
            InboundEvent::TypingStop(room) => {
                let room_id = validate_room_id(room.room_id())?;
                self.notify_peers(origin, room_id, OutboundEvent::UserStoppedTyping);
                Ok(())
            }
            InboundEvent::SendMessage(msg) => self.send_message(origin, msg).await,
            InboundEvent::EditMessage(msg) => self.edit_message(origin, msg).await,
            InboundEvent::DeleteMessage(msg) => self.delete_message(origin, msg).await,
        }
    }

    fn notify_peers(&self, origin: &Origin, room_id: &str, wrap: fn(RoomPeer) -> OutboundEvent) {
        let event = wrap(RoomPeer::new(&origin.identity, room_id));
        self.rooms
            .broadcast(room_id, &event, Some(origin.connection_id));
    }

    async fn send_message(&self, origin: &Origin, msg: SendMessage) -> Result<(), RelayError> {
        let room_id = validate_room_id(&msg.room_id)?;
        let content = self.validate_content(&msg.content)?;
        let message_type = parse_message_type(msg.message_type.as_deref())?;

        let message = self
            .messages
            .create(&origin.identity, room_id, content, message_type)
            .await
            .map_err(|e| {
                warn!("Failed to store message from {}: {}", origin.identity, e);
                RelayError::from_store(&e, "send")
            })?;

        self.rooms
            .broadcast(room_id, &OutboundEvent::NewMessage(message), None);
        Ok(())
    }

    async fn edit_message(&self, origin: &Origin, msg: EditMessage) -> Result<(), RelayError> {
        let room_id = validate_room_id(&msg.room_id)?;
        let message_id = validate_message_id(&msg.message_id)?;
        let content = self.validate_content(&msg.content)?;

        let message = self
            .messages
            .update(&origin.identity, room_id, message_id, content)
            .await
            .map_err(|e| {
                debug!("Edit of {} by {} failed: {}", message_id, origin.identity, e);
                RelayError::from_store(&e, "edit")
            })?;

        self.rooms
            .broadcast(room_id, &OutboundEvent::MessageEdited(message), None);
        Ok(())
    }

    async fn delete_message(&self, origin: &Origin, msg: DeleteMessage) -> Result<(), RelayError> {
        let room_id = validate_room_id(&msg.room_id)?;
        let message_id = validate_message_id(&msg.message_id)?;

        let message = self
            .messages
            .soft_delete(&origin.identity, room_id, message_id)
            .await
            .map_err(|e| {
                debug!(
                    "Delete of {} by {} failed: {}",
                    message_id, origin.identity, e
                );
                RelayError::from_store(&e, "delete")
            })?;

        let event = OutboundEvent::MessageDeleted(DeletedMessage {
            message_id: message.id,
        });
        self.rooms.broadcast(room_id, &event, None);
        Ok(())
    }

    fn validate_content<'a>(&self, content: &'a str) -> Result<&'a str, RelayError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(RelayError::protocol("Message content cannot be empty"));
        }
        if content.chars().count() > self.max_message_len {
            return Err(RelayError::protocol(format!(
                "Message content cannot exceed {} characters",
                self.max_message_len
            )));
        }
        Ok(content)
    }
}

fn validate_room_id(room_id: &str) -> Result<&str, RelayError> {
    let room_id = room_id.trim();
    if room_id.is_empty() {
        return Err(RelayError::protocol("Room id is required"));
    }
    Ok(room_id)
}

fn validate_message_id(message_id: &str) -> Result<&str, RelayError> {
    let message_id = message_id.trim();
    if message_id.is_empty() {
        return Err(RelayError::protocol("Message id is required"));
    }
    Ok(message_id)
}

fn parse_message_type(raw: Option<&str>) -> Result<MessageType, RelayError> {
    match raw {
        None => Ok(MessageType::default()),
        Some(raw) => raw
            .parse()
            .map_err(|_| RelayError::protocol("Message type must be text, image or file")),
    }
}
