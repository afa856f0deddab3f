//! Application assembly.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::api::AppState;
use crate::auth::{AuthConfig, JwtVerifier};
use crate::db::Database;
use crate::store::{MessageRepository, UserRepository};
use crate::ws::{Relay, RelayConfig};

/// Build the shared application state over an open database.
///
/// Validates the auth configuration and clears online flags left behind by
/// a previous process. Must be called within a tokio runtime.
pub async fn build_state(db: &Database, auth: AuthConfig, relay: RelayConfig) -> Result<AppState> {
    auth.validate().context("validating auth configuration")?;

    let users = UserRepository::new(db.pool().clone());
    let messages = MessageRepository::new(db.pool().clone());

    let stale = users
        .reset_presence()
        .await
        .context("resetting persisted presence")?;
    if stale > 0 {
        info!("Cleared {} stale online flag(s)", stale);
    }

    let verifier = JwtVerifier::new(&auth, Arc::new(users.clone()))
        .context("building credential verifier")?;
    let relay = Relay::new(
        relay,
        Arc::new(verifier),
        Arc::new(messages),
        Arc::new(users.clone()),
    );

    Ok(AppState::new(relay, users, auth))
}
