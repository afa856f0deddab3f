//! Persistence collaborators consumed by the relay.
//!
//! The relay only talks to the [`MessageStore`] and [`PresenceStore`] traits
//! (plus [`IdentityDirectory`](crate::auth::IdentityDirectory) during the
//! handshake). The SQLite repositories here are the default implementations.

mod error;
mod messages;
mod models;
mod users;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::auth::Identity;

pub use error::StoreError;
pub use messages::{DELETED_PLACEHOLDER, MessageRepository};
pub use models::{Message, MessageType, Sender, User};
pub use users::{NewUser, UserRepository};

/// Content mutations on chat messages.
///
/// Ownership is enforced here: edits and deletes by anyone other than the
/// sender fail with [`StoreError::NotAuthorized`].
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create(
        &self,
        author: &Identity,
        room_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<Message, StoreError>;

    async fn update(
        &self,
        author: &Identity,
        room_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Message, StoreError>;

    async fn soft_delete(
        &self,
        author: &Identity,
        room_id: &str,
        message_id: &str,
    ) -> Result<Message, StoreError>;
}

/// Persisted online flag. Written best-effort by the presence writer.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set_online(
        &self,
        identity: &Identity,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Users currently flagged online.
    async fn online_users(&self) -> Result<Vec<Identity>, StoreError>;
}
