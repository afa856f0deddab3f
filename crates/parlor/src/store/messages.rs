//! Message repository.

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::models::MessageRow;
use super::{Message, MessageStore, MessageType, StoreError};
use crate::auth::Identity;

/// Content left behind by a soft delete.
pub const DELETED_PLACEHOLDER: &str = "This message has been deleted";

const SELECT_MESSAGE: &str = r#"
    SELECT m.seq, m.id, m.room_id, m.sender_id, u.username AS sender_username,
           m.content, m.message_type, m.is_edited, m.is_deleted, m.created_at, m.updated_at
    FROM messages m
    JOIN users u ON u.id = m.sender_id
"#;

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Repository for chat messages.
#[derive(Debug, Clone)]
pub struct MessageRepository {
    pool: SqlitePool,
}

impl MessageRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Generate a message id.
    pub fn generate_message_id() -> String {
        format!("msg_{}", nanoid::nanoid!(16))
    }

    /// Get a message by ID.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query_as::<_, MessageRow>(&format!("{SELECT_MESSAGE} WHERE m.id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Message::from))
    }

    /// Explain why a guarded mutation touched no rows.
    async fn mutation_failure(
        &self,
        author: &Identity,
        room_id: &str,
        message_id: &str,
    ) -> Result<StoreError, StoreError> {
        Ok(match self.get(message_id).await? {
            Some(message) if message.room_id == room_id && !message.is_deleted => {
                if message.sender.id != author.user_id {
                    StoreError::NotAuthorized
                } else {
                    StoreError::NotFound
                }
            }
            _ => StoreError::NotFound,
        })
    }
}

#[async_trait]
impl MessageStore for MessageRepository {
    #[instrument(skip(self, author, content), fields(user_id = %author.user_id))]
    async fn create(
        &self,
        author: &Identity,
        room_id: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<Message, StoreError> {
        let id = Self::generate_message_id();
        let now = now_rfc3339();

        debug!("Creating message {} in {}", id, room_id);

        sqlx::query(
            r#"
            INSERT INTO messages (id, room_id, sender_id, content, message_type, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(room_id)
        .bind(&author.user_id)
        .bind(content)
        .bind(message_type.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(&id).await?.ok_or(StoreError::NotFound)
    }

    #[instrument(skip(self, author, content), fields(user_id = %author.user_id))]
    async fn update(
        &self,
        author: &Identity,
        room_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<Message, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET content = ?, is_edited = 1, updated_at = ?
            WHERE id = ? AND room_id = ? AND sender_id = ? AND is_deleted = 0
            "#,
        )
        .bind(content)
        .bind(now_rfc3339())
        .bind(message_id)
        .bind(room_id)
        .bind(&author.user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.mutation_failure(author, room_id, message_id).await?);
        }

        self.get(message_id).await?.ok_or(StoreError::NotFound)
    }

    #[instrument(skip(self, author), fields(user_id = %author.user_id))]
    async fn soft_delete(
        &self,
        author: &Identity,
        room_id: &str,
        message_id: &str,
    ) -> Result<Message, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET content = ?, is_deleted = 1, updated_at = ?
            WHERE id = ? AND room_id = ? AND sender_id = ? AND is_deleted = 0
            "#,
        )
        .bind(DELETED_PLACEHOLDER)
        .bind(now_rfc3339())
        .bind(message_id)
        .bind(room_id)
        .bind(&author.user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.mutation_failure(author, room_id, message_id).await?);
        }

        self.get(message_id).await?.ok_or(StoreError::NotFound)
    }
}
