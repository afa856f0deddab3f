//! Relay composition root and per-connection sessions.

use std::sync::{Arc, Mutex};

use log::{debug, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::bus::BroadcastBus;
use super::config::RelayConfig;
use super::dispatcher::{EventDispatcher, Origin};
use super::error::RelayError;
use super::outbox::{Outbox, OutboxSubscription};
use super::presence::{OnlineSnapshot, PresenceRegistry, PresenceWriter};
use super::rooms::RoomRouter;
use super::types::{ConnectionId, OutboundEvent};
use crate::auth::{AuthError, AuthVerifier, ConnectionAuthenticator, Identity};
use crate::store::{MessageStore, PresenceStore};

/// Lifecycle of one connection.
///
/// `Connecting → Authenticated → Registered → RoomMember* → Closed`.
/// A failed handshake goes straight from `Connecting` to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Registered,
    RoomMember,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Authenticated => write!(f, "authenticated"),
            ConnectionState::Registered => write!(f, "registered"),
            ConnectionState::RoomMember => write!(f, "room-member"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// The relay core, built once per process and shared by every connection.
#[derive(Clone)]
pub struct Relay {
    authenticator: ConnectionAuthenticator,
    registry: Arc<PresenceRegistry>,
    rooms: Arc<RoomRouter>,
    bus: Arc<BroadcastBus>,
    dispatcher: Arc<EventDispatcher>,
    outbox: Arc<Outbox>,
    presence_store: Arc<dyn PresenceStore>,
    presence_writer: Arc<Mutex<Option<PresenceWriter>>>,
    config: Arc<RelayConfig>,
}

impl Relay {
    /// Wire up the relay. Spawns the presence writer, so it must be called
    /// within a tokio runtime.
    pub fn new(
        config: RelayConfig,
        verifier: Arc<dyn AuthVerifier>,
        messages: Arc<dyn MessageStore>,
        presence_store: Arc<dyn PresenceStore>,
    ) -> Self {
        let outbox = Arc::new(Outbox::new(config.connection_buffer));
        let (registry, writer) = PresenceRegistry::with_presence_store(presence_store.clone());
        let registry = Arc::new(registry);
        let rooms = Arc::new(RoomRouter::new(outbox.clone()));
        let bus = Arc::new(BroadcastBus::new(registry.clone(), outbox.clone()));
        let dispatcher = Arc::new(EventDispatcher::new(
            rooms.clone(),
            messages,
            config.max_message_len,
        ));

        Self {
            authenticator: ConnectionAuthenticator::new(verifier),
            registry,
            rooms,
            bus,
            dispatcher,
            outbox,
            presence_store,
            presence_writer: Arc::new(Mutex::new(Some(writer))),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    pub fn rooms(&self) -> &RoomRouter {
        &self.rooms
    }

    /// Verify the credential presented at connection-open time.
    pub async fn authenticate(&self, credential: Option<&str>) -> Result<Identity, AuthError> {
        self.authenticator.authenticate(credential).await
    }

    /// Register a new connection for an authenticated identity.
    ///
    /// Returns the session and the receiver of its outbound events. The
    /// receiver already holds the online list when this returns.
    pub fn open(&self, identity: Identity) -> (Session, mpsc::Receiver<OutboundEvent>) {
        let connection_id = ConnectionId::new();
        let (subscription, events) = self.outbox.subscribe(connection_id);
        let registration = self.registry.register(&identity, connection_id);

        if registration.became_online {
            self.bus.publish();
        } else {
            self.bus.send_snapshot_to(connection_id);
        }

        info!(
            "Connection {} registered for {} ({} live)",
            connection_id, identity, registration.connection_count
        );

        let session = Session {
            relay: self.clone(),
            origin: Origin {
                connection_id,
                identity,
            },
            subscription: Some(subscription),
        };
        (session, events)
    }

    /// Flush queued presence writes and stop the writer.
    ///
    /// Called once the server has stopped accepting connections. Later calls
    /// do nothing.
    pub async fn shutdown(&self) {
        let writer = self
            .presence_writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(writer) = writer {
            writer.finish().await;
            info!("Presence writes flushed");
        }
    }

    /// Online users for request/response callers.
    pub async fn online_snapshot(&self) -> OnlineSnapshot {
        self.registry
            .snapshot_or_persisted(self.presence_store.as_ref())
            .await
    }
}

/// One live connection.
///
/// Dropping the session (or calling [`Session::close`]) runs the teardown
/// exactly once: outbox unsubscribe, room purge, presence unregister, and an
/// online-list publish if the user went offline.
pub struct Session {
    relay: Relay,
    origin: Origin,
    subscription: Option<OutboxSubscription>,
}

impl Session {
    pub fn id(&self) -> ConnectionId {
        self.origin.connection_id
    }

    pub fn identity(&self) -> &Identity {
        &self.origin.identity
    }

    /// Fires when the relay can no longer deliver to this connection. The
    /// transport should then close, which runs the normal teardown.
    pub fn close_signal(&self) -> CancellationToken {
        match &self.subscription {
            Some(subscription) => subscription.close_signal(),
            None => {
                let token = CancellationToken::new();
                token.cancel();
                token
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        if self.subscription.is_none() {
            ConnectionState::Closed
        } else if self.relay.rooms.rooms_of(self.id()).is_empty() {
            ConnectionState::Registered
        } else {
            ConnectionState::RoomMember
        }
    }

    /// Handle one inbound text frame.
    ///
    /// Failures are reported to this connection as an `error` event and
    /// returned; the session stays open.
    pub async fn handle_text(&self, text: &str) -> Result<(), RelayError> {
        let result = self.relay.dispatcher.handle_text(&self.origin, text).await;
        if let Err(e) = &result {
            self.relay
                .outbox
                .send(self.id(), OutboundEvent::error(e.to_string()));
        }
        result
    }

    /// Close the connection.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            return;
        };
        drop(subscription);

        let connection_id = self.id();
        let rooms = self.relay.rooms.purge(connection_id);
        let unregistration = self
            .relay
            .registry
            .unregister(&self.origin.identity, connection_id);

        if unregistration.became_offline {
            self.relay.bus.publish();
        }

        debug!(
            "Connection {} for {} closed (left {} room(s), {} live)",
            connection_id, self.origin.identity, rooms, unregistration.connection_count
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}
