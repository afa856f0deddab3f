//! Per-connection outbound delivery.

use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::types::{ConnectionId, OutboundEvent};

/// A sender for outbound events to one connection.
pub type EventSender = mpsc::Sender<OutboundEvent>;

struct Subscriber {
    tx: EventSender,
    close: CancellationToken,
}

/// Registry of live connections' outbound channels.
///
/// Delivery never blocks. A connection whose buffer is full is evicted: its
/// channel is dropped and its close signal fires, so the client never keeps
/// a stale view while still looking connected.
pub struct Outbox {
    subscribers: DashMap<ConnectionId, Subscriber>,
    buffer: usize,
}

impl Outbox {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    /// Subscribe a connection.
    ///
    /// Returns the receiving half and a guard that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        connection_id: ConnectionId,
    ) -> (OutboxSubscription, mpsc::Receiver<OutboundEvent>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let close = CancellationToken::new();
        self.subscribers.insert(
            connection_id,
            Subscriber {
                tx,
                close: close.clone(),
            },
        );
        debug!("Outbox subscribed connection {}", connection_id);

        (
            OutboxSubscription {
                outbox: Arc::clone(self),
                connection_id,
                close,
            },
            rx,
        )
    }

    fn unsubscribe(&self, connection_id: ConnectionId) {
        if self.subscribers.remove(&connection_id).is_some() {
            debug!("Outbox unsubscribed connection {}", connection_id);
        }
    }

    fn evict(&self, connection_id: ConnectionId) {
        if let Some((_, subscriber)) = self.subscribers.remove(&connection_id) {
            warn!(
                "Outbound buffer full for connection {}, closing it",
                connection_id
            );
            subscriber.close.cancel();
        }
    }

    /// Deliver an event to one connection. Returns whether it was queued.
    pub fn send(&self, connection_id: ConnectionId, event: OutboundEvent) -> bool {
        let outcome = match self.subscribers.get(&connection_id) {
            Some(subscriber) => Delivery::attempt(&subscriber.tx, event),
            None => return false,
        };
        if outcome == Delivery::Full {
            self.evict(connection_id);
        }
        outcome == Delivery::Queued
    }

    /// Deliver an event to every subscribed connection.
    ///
    /// Returns the number of connections reached. Connections that could not
    /// take the event are evicted.
    pub fn send_all(&self, event: &OutboundEvent) -> usize {
        let mut reached = 0;
        let mut full = Vec::new();
        for entry in self.subscribers.iter() {
            match Delivery::attempt(&entry.tx, event.clone()) {
                Delivery::Queued => reached += 1,
                Delivery::Full => full.push(*entry.key()),
                Delivery::Closed => {}
            }
        }
        // Shard guards must be released before removing.
        for connection_id in full {
            self.evict(connection_id);
        }
        reached
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Queued,
    Full,
    Closed,
}

impl Delivery {
    fn attempt(tx: &EventSender, event: OutboundEvent) -> Self {
        match tx.try_send(event) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) => Delivery::Full,
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Keeps a connection subscribed to the [`Outbox`] while alive.
pub struct OutboxSubscription {
    outbox: Arc<Outbox>,
    connection_id: ConnectionId,
    close: CancellationToken,
}

impl OutboxSubscription {
    /// Fires when the outbox gives up on this connection.
    pub fn close_signal(&self) -> CancellationToken {
        self.close.clone()
    }
}

impl Drop for OutboxSubscription {
    fn drop(&mut self) {
        self.outbox.unsubscribe(self.connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_unsubscribe_on_drop() {
        let outbox = Arc::new(Outbox::new(8));
        let id = ConnectionId::new();
        let (sub, mut rx) = outbox.subscribe(id);

        assert!(outbox.send(id, OutboundEvent::error("hi")));
        assert_eq!(rx.recv().await, Some(OutboundEvent::error("hi")));

        let close = sub.close_signal();
        drop(sub);
        assert!(!outbox.send(id, OutboundEvent::error("gone")));
        assert!(!close.is_cancelled());
    }

    #[tokio::test]
    async fn test_full_buffer_evicts_connection() {
        let outbox = Arc::new(Outbox::new(1));
        let id = ConnectionId::new();
        let (sub, mut rx) = outbox.subscribe(id);
        let close = sub.close_signal();

        assert!(outbox.send(id, OutboundEvent::error("first")));
        assert!(!close.is_cancelled());
        assert!(!outbox.send(id, OutboundEvent::error("second")));
        assert!(close.is_cancelled());

        // Already queued events drain, then the channel ends.
        assert_eq!(rx.recv().await, Some(OutboundEvent::error("first")));
        assert_eq!(rx.recv().await, None);
        assert!(!outbox.send(id, OutboundEvent::error("third")));
    }

    #[tokio::test]
    async fn test_send_all_evicts_only_full_connections() {
        let outbox = Arc::new(Outbox::new(1));
        let slow = ConnectionId::new();
        let (slow_sub, _slow_rx) = outbox.subscribe(slow);
        let (fast_sub, mut fast_rx) = outbox.subscribe(ConnectionId::new());
        let list = OutboundEvent::OnlineUsers(vec![]);

        assert_eq!(outbox.send_all(&list), 2);
        assert_eq!(fast_rx.recv().await, Some(list.clone()));

        assert_eq!(outbox.send_all(&list), 1);
        assert!(slow_sub.close_signal().is_cancelled());
        assert!(!fast_sub.close_signal().is_cancelled());
        assert_eq!(fast_rx.recv().await, Some(list.clone()));

        // The evicted connection is no longer a target.
        assert_eq!(outbox.send_all(&list), 1);
        assert!(!outbox.send(slow, list));
    }
}
