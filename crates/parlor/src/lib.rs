//! Parlor relay library
//!
//! Authenticated WebSocket connections, per-user presence tracking,
//! channel-scoped broadcast and the HTTP surface around them.

pub mod api;
pub mod app;
pub mod auth;
pub mod db;
pub mod store;
pub mod ws;
