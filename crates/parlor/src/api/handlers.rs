//! HTTP handlers.

use axum::{
    Json,
    extract::{Path, State},
};
use serde::Serialize;
use tracing::instrument;

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::ws::SnapshotSource;

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub online_users: usize,
    pub connections: usize,
    pub rooms: usize,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.relay.registry();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        online_users: registry.len(),
        connections: registry.total_connections(),
        rooms: state.relay.rooms().room_count(),
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUserEntry {
    pub user_id: String,
    pub username: String,
    pub sockets: usize,
}

#[derive(Debug, Serialize)]
pub struct OnlineUsersResponse {
    pub data: Vec<OnlineUserEntry>,
    pub source: SnapshotSource,
}

/// Online users over request/response.
///
/// GET /api/socket/online-users
#[instrument(skip(state))]
pub async fn online_users(State(state): State<AppState>) -> Json<OnlineUsersResponse> {
    let snapshot = state.relay.online_snapshot().await;
    Json(OnlineUsersResponse {
        data: snapshot
            .users
            .into_iter()
            .map(|entry| OnlineUserEntry {
                user_id: entry.user_id,
                username: entry.username,
                sockets: entry.connection_count,
            })
            .collect(),
        source: snapshot.source,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresenceResponse {
    pub user_id: String,
    pub username: String,
    pub online: bool,
    pub sockets: usize,
    pub last_seen: Option<String>,
}

/// Presence of a single user.
///
/// GET /api/socket/users/{user_id}
#[instrument(skip(state))]
pub async fn user_presence(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<UserPresenceResponse>> {
    let user = state
        .users
        .get(&user_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("user {}", user_id)))?;

    let sockets = state.relay.registry().connection_count(&user.id);
    Ok(Json(UserPresenceResponse {
        online: sockets > 0,
        sockets,
        last_seen: user.last_seen,
        user_id: user.id,
        username: user.username,
    }))
}

/// Fallback for unknown routes.
pub async fn not_found() -> ApiError {
    ApiError::not_found("no such route")
}
