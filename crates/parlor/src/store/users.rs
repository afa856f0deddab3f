//! User repository: identity directory and persisted presence flag.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;
use tracing::{debug, instrument};

use super::{PresenceStore, StoreError, User};
use crate::auth::{Identity, IdentityDirectory};

/// Fields needed to create a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
}

/// Repository for user rows.
#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Generate a user id.
    pub fn generate_user_id() -> String {
        format!("usr_{}", nanoid::nanoid!(12))
    }

    /// Create a new user.
    #[instrument(skip(self, user), fields(username = %user.username))]
    pub async fn create(&self, user: NewUser) -> Result<User, StoreError> {
        let id = Self::generate_user_id();
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);

        debug!("Creating user: {} ({})", user.username, id);

        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.get(&id).await?.ok_or(StoreError::NotFound)
    }

    /// Get a user by ID.
    #[instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, is_online, last_seen, created_at
            FROM users
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    /// Get a user by username.
    #[instrument(skip(self))]
    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, is_online, last_seen, created_at
            FROM users
            WHERE username = ?
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    /// Clear every online flag.
    ///
    /// Called at startup: no connection survives a restart, so flags left by
    /// a previous process are stale.
    #[instrument(skip(self))]
    pub async fn reset_presence(&self) -> Result<u64, StoreError> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let result =
            sqlx::query("UPDATE users SET is_online = 0, last_seen = ? WHERE is_online = 1")
                .bind(&now)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl IdentityDirectory for UserRepository {
    async fn find_identity(&self, user_id: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self.get(user_id).await?.map(Identity::from))
    }
}

#[async_trait]
impl PresenceStore for UserRepository {
    #[instrument(skip(self, identity), fields(user_id = %identity.user_id))]
    async fn set_online(
        &self,
        identity: &Identity,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let at = at.to_rfc3339_opts(SecondsFormat::Millis, true);

        // last_seen only moves when the user goes offline.
        let result = if online {
            sqlx::query("UPDATE users SET is_online = 1 WHERE id = ?")
                .bind(&identity.user_id)
                .execute(&self.pool)
                .await?
        } else {
            sqlx::query("UPDATE users SET is_online = 0, last_seen = ? WHERE id = ?")
                .bind(&at)
                .bind(&identity.user_id)
                .execute(&self.pool)
                .await?
        };

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn online_users(&self) -> Result<Vec<Identity>, StoreError> {
        let users = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, email, is_online, last_seen, created_at
            FROM users
            WHERE is_online = 1
            ORDER BY username, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(users.into_iter().map(Identity::from).collect())
    }
}
