//! Channel-scoped subscription groups.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use log::debug;

use super::outbox::Outbox;
use super::types::{ConnectionId, OutboundEvent};

/// Room membership and room-scoped delivery.
///
/// Membership is indexed both ways so a closing connection can be purged
/// without scanning every room. Rooms with no members are removed.
pub struct RoomRouter {
    /// Room ID -> member connections
    rooms: DashMap<String, HashSet<ConnectionId>>,

    /// Connection -> rooms it has joined
    memberships: DashMap<ConnectionId, HashSet<String>>,

    outbox: Arc<Outbox>,
}

impl RoomRouter {
    pub fn new(outbox: Arc<Outbox>) -> Self {
        Self {
            rooms: DashMap::new(),
            memberships: DashMap::new(),
            outbox,
        }
    }

    /// Add a connection to a room. Returns false if it was already a member.
    pub fn join(&self, connection_id: ConnectionId, room_id: &str) -> bool {
        let joined = self
            .rooms
            .entry(room_id.to_string())
            .or_default()
            .insert(connection_id);

        if joined {
            self.memberships
                .entry(connection_id)
                .or_default()
                .insert(room_id.to_string());
            debug!("Connection {} joined room {}", connection_id, room_id);
        }
        joined
    }

    /// Remove a connection from a room. Returns false if it was not a member.
    pub fn leave(&self, connection_id: ConnectionId, room_id: &str) -> bool {
        let mut left = false;
        self.rooms.remove_if_mut(room_id, |_, members| {
            left = members.remove(&connection_id);
            members.is_empty()
        });

        if left {
            self.memberships.remove_if_mut(&connection_id, |_, rooms| {
                rooms.remove(room_id);
                rooms.is_empty()
            });
            debug!("Connection {} left room {}", connection_id, room_id);
        }
        left
    }

    /// Deliver an event to every current member of a room except `exclude`.
    ///
    /// Returns the number of connections the event was handed to.
    pub fn broadcast(
        &self,
        room_id: &str,
        event: &OutboundEvent,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let Some(members) = self.rooms.get(room_id) else {
            return 0;
        };

        members
            .iter()
            .filter(|id| Some(**id) != exclude)
            .filter(|id| self.outbox.send(**id, event.clone()))
            .count()
    }

    /// Remove a connection from every room it joined.
    ///
    /// Returns the number of rooms it was removed from.
    pub fn purge(&self, connection_id: ConnectionId) -> usize {
        let Some((_, rooms)) = self.memberships.remove(&connection_id) else {
            return 0;
        };

        for room_id in &rooms {
            self.rooms.remove_if_mut(room_id.as_str(), |_, members| {
                members.remove(&connection_id);
                members.is_empty()
            });
        }

        debug!(
            "Purged connection {} from {} room(s)",
            connection_id,
            rooms.len()
        );
        rooms.len()
    }

    /// Current members of a room.
    pub fn members(&self, room_id: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Rooms a connection has joined.
    pub fn rooms_of(&self, connection_id: ConnectionId) -> Vec<String> {
        self.memberships
            .get(&connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of non-empty rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
