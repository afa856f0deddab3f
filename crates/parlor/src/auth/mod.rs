//! Connection authentication.
//!
//! Verifies the credential presented when a live connection opens and
//! resolves it to an [`Identity`]:
//! - HS256 JWT validation against the configured secret
//! - Identity lookup through an [`IdentityDirectory`]
//! - Dev bypass tokens (`dev:<user_id>`) when dev mode is enabled

mod claims;
mod config;
mod credential;
mod error;
mod verifier;

pub use claims::{Claims, Identity};
pub use config::{AuthConfig, ConfigValidationError};
pub use credential::credential_from_request;
pub use error::AuthError;
pub use verifier::{AuthVerifier, ConnectionAuthenticator, IdentityDirectory, JwtVerifier};
