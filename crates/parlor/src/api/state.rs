//! Application state shared across handlers.

use std::sync::Arc;

use crate::auth::AuthConfig;
use crate::store::UserRepository;
use crate::ws::Relay;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Relay core.
    pub relay: Relay,
    /// User directory.
    pub users: UserRepository,
    /// Auth settings (CORS origins, dev mode).
    pub auth: Arc<AuthConfig>,
}

impl AppState {
    pub fn new(relay: Relay, users: UserRepository, auth: AuthConfig) -> Self {
        Self {
            relay,
            users,
            auth: Arc::new(auth),
        }
    }
}
