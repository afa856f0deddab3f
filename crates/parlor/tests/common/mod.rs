//! Test utilities and common setup.
#![allow(clippy::field_reassign_with_default)]
#![allow(dead_code)]

use axum::Router;
use parlor::api::{self, AppState};
use parlor::app::build_state;
use parlor::auth::{AuthConfig, Identity};
use parlor::db::Database;
use parlor::store::{NewUser, UserRepository};
use parlor::ws::RelayConfig;

pub const TEST_SECRET: &str = "test-secret-for-integration-tests-minimum-32-chars";

/// Create a test AuthConfig with dev credentials and a JWT secret.
pub fn test_auth_config() -> AuthConfig {
    let mut config = AuthConfig::default();
    config.dev_mode = true;
    config.jwt_secret = Some(TEST_SECRET.to_string());
    config
}

/// A fully wired application over an in-memory database.
pub struct TestApp {
    pub db: Database,
    pub state: AppState,
    pub users: UserRepository,
}

impl TestApp {
    pub fn router(&self) -> Router {
        api::create_router(self.state.clone())
    }

    /// Add a user to the directory.
    pub async fn seed_user(&self, username: &str) -> Identity {
        let user = self
            .users
            .create(NewUser {
                username: username.to_string(),
                email: format!("{username}@example.com"),
            })
            .await
            .expect("seed user");
        Identity::from(user)
    }
}

pub async fn test_state() -> TestApp {
    test_state_with(RelayConfig::default()).await
}

pub async fn test_state_with(relay: RelayConfig) -> TestApp {
    let db = Database::in_memory().await.expect("in-memory database");
    let state = build_state(&db, test_auth_config(), relay)
        .await
        .expect("build state");
    let users = UserRepository::new(db.pool().clone());
    TestApp { db, state, users }
}

/// Create a test application router.
pub async fn test_app() -> Router {
    test_state().await.router()
}
