//! HTTP surface: health, WebSocket upgrade and presence reads.

mod error;
mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use handlers::{HealthResponse, OnlineUserEntry, OnlineUsersResponse, UserPresenceResponse};
pub use routes::create_router;
pub use state::AppState;
