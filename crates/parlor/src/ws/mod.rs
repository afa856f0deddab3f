//! Real-time presence and broadcast relay.
//!
//! A connection authenticates once at open time, is registered in the
//! [`PresenceRegistry`], and from then on exchanges tagged JSON events:
//! room membership goes through the [`RoomRouter`], chat mutations through
//! the [`EventDispatcher`] and the message store, and every online/offline
//! transition makes the [`BroadcastBus`] push the full online list to all
//! connections.

mod bus;
mod config;
mod dispatcher;
mod error;
mod handler;
mod outbox;
mod presence;
mod relay;
mod rooms;
pub mod types;

pub use bus::BroadcastBus;
pub use config::RelayConfig;
pub use dispatcher::{EventDispatcher, Origin};
pub use error::RelayError;
pub use handler::ws_handler;
pub use outbox::{Outbox, OutboxSubscription};
pub use presence::{
    OnlineSnapshot, PresenceChange, PresenceRegistry, PresenceSnapshotEntry, PresenceWriter,
    Registration, SnapshotSource, Unregistration,
};
pub use relay::{ConnectionState, Relay, Session};
pub use rooms::RoomRouter;
pub use types::{ConnectionId, InboundEvent, OnlineUser, OutboundEvent};
