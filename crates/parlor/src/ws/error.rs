//! Errors reported back to the originating connection.

use thiserror::Error;

use crate::store::StoreError;

/// Failure of a single inbound event.
///
/// The `Display` text is what the client receives in the `error` event.
/// None of these close the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Malformed or invalid payload.
    #[error("{0}")]
    Protocol(String),

    #[error("Not authorized to {0} this message")]
    NotAuthorized(&'static str),

    #[error("Message not found")]
    NotFound,

    /// Store failure; not retried.
    #[error("Failed to {0} message")]
    Transient(&'static str),
}

impl RelayError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Map a store failure for the given action (`send`, `edit`, `delete`).
    pub fn from_store(err: &StoreError, action: &'static str) -> Self {
        match err {
            StoreError::NotAuthorized => Self::NotAuthorized(action),
            StoreError::NotFound => Self::NotFound,
            StoreError::Database(_) | StoreError::Unavailable(_) => Self::Transient(action),
        }
    }
}
