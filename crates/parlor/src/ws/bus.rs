//! Global online-list broadcasts.

use std::sync::{Arc, Mutex};

use log::debug;

use super::outbox::Outbox;
use super::presence::PresenceRegistry;
use super::types::{ConnectionId, OnlineUser, OutboundEvent};

/// Pushes the full online list to every live connection.
///
/// Publication is serialized: the snapshot is taken and handed to every
/// outbound channel under one lock, so two publications never interleave and
/// the last list each client receives reflects the latest registry state.
pub struct BroadcastBus {
    registry: Arc<PresenceRegistry>,
    outbox: Arc<Outbox>,
    publish_lock: Mutex<()>,
}

impl BroadcastBus {
    pub fn new(registry: Arc<PresenceRegistry>, outbox: Arc<Outbox>) -> Self {
        Self {
            registry,
            outbox,
            publish_lock: Mutex::new(()),
        }
    }

    fn online_users(&self) -> OutboundEvent {
        let users = self
            .registry
            .snapshot()
            .iter()
            .map(OnlineUser::from)
            .collect();
        OutboundEvent::OnlineUsers(users)
    }

    /// Recompute the snapshot and send it to all connections.
    ///
    /// Returns the number of connections reached.
    pub fn publish(&self) -> usize {
        let _guard = self
            .publish_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let event = self.online_users();
        let reached = self.outbox.send_all(&event);
        debug!("Published online users to {} connection(s)", reached);
        reached
    }

    /// Send the current snapshot to a single connection.
    pub fn send_snapshot_to(&self, connection_id: ConnectionId) -> bool {
        let _guard = self
            .publish_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let event = self.online_users();
        self.outbox.send(connection_id, event)
    }
}
