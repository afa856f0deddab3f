//! Presence registry: which users are online and through how many connections.
//!
//! Each user's entry is mutated under its dashmap shard lock, so the 0→1 and
//! 1→0 edges are detected exactly once even when connections of the same user
//! open and close concurrently. The matching persistence side effect is queued
//! inside the same critical section, which keeps the queue in edge order.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::types::{ConnectionId, OnlineUser};
use crate::auth::Identity;
use crate::store::PresenceStore;

struct PresenceEntry {
    username: String,
    connections: HashSet<ConnectionId>,
}

/// A presence edge to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub identity: Identity,
    pub online: bool,
    pub at: DateTime<Utc>,
}

/// Outcome of registering a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    /// This was the user's first live connection.
    pub became_online: bool,
    pub connection_count: usize,
}

/// Outcome of unregistering a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unregistration {
    /// This was the user's last live connection.
    pub became_offline: bool,
    pub connection_count: usize,
}

/// One row of the presence snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshotEntry {
    pub user_id: String,
    pub username: String,
    pub connection_count: usize,
}

impl From<&PresenceSnapshotEntry> for OnlineUser {
    fn from(entry: &PresenceSnapshotEntry) -> Self {
        OnlineUser {
            user_id: entry.user_id.clone(),
            username: entry.username.clone(),
        }
    }
}

/// Where an online list came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    Live,
    Persisted,
}

/// Online list for the request/response read path.
#[derive(Debug, Clone, Serialize)]
pub struct OnlineSnapshot {
    pub source: SnapshotSource,
    pub users: Vec<PresenceSnapshotEntry>,
}

/// Live presence state for this process.
#[derive(Default)]
pub struct PresenceRegistry {
    entries: DashMap<String, PresenceEntry>,
    changes: Option<mpsc::UnboundedSender<PresenceChange>>,
}

impl PresenceRegistry {
    /// Registry without persistence side effects.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that queues every presence edge onto `changes`.
    pub fn with_change_sink(changes: mpsc::UnboundedSender<PresenceChange>) -> Self {
        Self {
            entries: DashMap::new(),
            changes: Some(changes),
        }
    }

    /// Registry whose edges are written to `store` by a background task.
    ///
    /// Must be called within a tokio runtime.
    pub fn with_presence_store(store: Arc<dyn PresenceStore>) -> (Self, PresenceWriter) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_presence_writer(store, rx, shutdown.clone()));
        (Self::with_change_sink(tx), PresenceWriter { handle, shutdown })
    }

    fn enqueue(&self, identity: &Identity, online: bool) {
        let Some(changes) = &self.changes else {
            return;
        };
        let change = PresenceChange {
            identity: identity.clone(),
            online,
            at: Utc::now(),
        };
        if changes.send(change).is_err() {
            warn!(
                "Presence writer is gone; not persisting {} for {}",
                if online { "online" } else { "offline" },
                identity
            );
        }
    }

    /// Add a connection to the identity's set.
    pub fn register(&self, identity: &Identity, connection_id: ConnectionId) -> Registration {
        let mut entry = self
            .entries
            .entry(identity.user_id.clone())
            .or_insert_with(|| PresenceEntry {
                username: identity.username.clone(),
                connections: HashSet::new(),
            });

        let became_online = entry.connections.is_empty();
        entry.username.clone_from(&identity.username);
        entry.connections.insert(connection_id);
        let connection_count = entry.connections.len();

        if became_online {
            self.enqueue(identity, true);
        }
        drop(entry);

        if became_online {
            info!("User {} is online", identity);
        } else {
            debug!(
                "User {} opened connection {} ({} live)",
                identity, connection_id, connection_count
            );
        }

        Registration {
            became_online,
            connection_count,
        }
    }

    /// Remove a connection from the identity's set.
    ///
    /// Unknown connections are ignored; the count never goes negative.
    pub fn unregister(&self, identity: &Identity, connection_id: ConnectionId) -> Unregistration {
        let mut connection_count = 0;
        let removed = self
            .entries
            .remove_if_mut(&identity.user_id, |_, entry| {
                entry.connections.remove(&connection_id);
                connection_count = entry.connections.len();
                if connection_count == 0 {
                    self.enqueue(identity, false);
                    true
                } else {
                    false
                }
            })
            .is_some();

        if removed {
            info!("User {} is offline", identity);
        } else {
            debug!(
                "User {} closed connection {} ({} live)",
                identity, connection_id, connection_count
            );
        }

        Unregistration {
            became_offline: removed,
            connection_count,
        }
    }

    /// Every online user with their live connection count, ordered by username.
    pub fn snapshot(&self) -> Vec<PresenceSnapshotEntry> {
        let mut snapshot: Vec<_> = self
            .entries
            .iter()
            .map(|entry| PresenceSnapshotEntry {
                user_id: entry.key().clone(),
                username: entry.username.clone(),
                connection_count: entry.connections.len(),
            })
            .collect();
        snapshot.sort_by(|a, b| {
            a.username
                .cmp(&b.username)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        snapshot
    }

    /// The live snapshot, or users flagged online in `store` when nobody is
    /// connected to this process.
    pub async fn snapshot_or_persisted(&self, store: &dyn PresenceStore) -> OnlineSnapshot {
        let live = self.snapshot();
        if !live.is_empty() {
            return OnlineSnapshot {
                source: SnapshotSource::Live,
                users: live,
            };
        }

        match store.online_users().await {
            Ok(users) => OnlineSnapshot {
                source: SnapshotSource::Persisted,
                users: users
                    .into_iter()
                    .map(|identity| PresenceSnapshotEntry {
                        user_id: identity.user_id,
                        username: identity.username,
                        connection_count: 0,
                    })
                    .collect(),
            },
            Err(e) => {
                warn!("Failed to read persisted presence: {}", e);
                OnlineSnapshot {
                    source: SnapshotSource::Live,
                    users: live,
                }
            }
        }
    }

    pub fn connection_count(&self, user_id: &str) -> usize {
        self.entries
            .get(user_id)
            .map(|entry| entry.connections.len())
            .unwrap_or(0)
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.entries.contains_key(user_id)
    }

    /// Number of online users.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live connections across all users.
    pub fn total_connections(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| entry.connections.len())
            .sum()
    }
}

/// Handle to the background task persisting presence edges.
pub struct PresenceWriter {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl PresenceWriter {
    /// Persist every edge queued so far, then stop the task.
    pub async fn finish(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!("Presence writer task failed: {}", e);
        }
    }
}

/// Apply presence edges to the store in the order they were queued.
///
/// Failures are logged and skipped. Exits once the registry is dropped, or
/// on shutdown after draining what is already queued.
async fn run_presence_writer(
    store: Arc<dyn PresenceStore>,
    mut changes: mpsc::UnboundedReceiver<PresenceChange>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            change = changes.recv() => match change {
                Some(change) => persist(store.as_ref(), change).await,
                None => break,
            },
            _ = shutdown.cancelled() => {
                while let Ok(change) = changes.try_recv() {
                    persist(store.as_ref(), change).await;
                }
                break;
            }
        }
    }
    debug!("Presence writer stopped");
}

async fn persist(store: &dyn PresenceStore, change: PresenceChange) {
    if let Err(e) = store
        .set_online(&change.identity, change.online, change.at)
        .await
    {
        warn!(
            "Failed to persist presence ({}) for {}: {}",
            change.online, change.identity, e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreError;
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn alice() -> Identity {
        Identity::new("u1", "alice")
    }

    #[test]
    fn test_two_tabs_scenario() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = PresenceRegistry::with_change_sink(tx);
        let (a, b) = (ConnectionId::new(), ConnectionId::new());

        let reg = registry.register(&alice(), a);
        assert!(reg.became_online);
        assert_eq!(reg.connection_count, 1);

        let reg = registry.register(&alice(), b);
        assert!(!reg.became_online);
        assert_eq!(reg.connection_count, 2);

        let unreg = registry.unregister(&alice(), a);
        assert!(!unreg.became_offline);
        assert_eq!(unreg.connection_count, 1);
        assert!(registry.is_online("u1"));

        let unreg = registry.unregister(&alice(), b);
        assert!(unreg.became_offline);
        assert_eq!(unreg.connection_count, 0);
        assert!(!registry.is_online("u1"));
        assert!(registry.is_empty());

        let first = rx.try_recv().unwrap();
        assert!(first.online);
        let second = rx.try_recv().unwrap();
        assert!(!second.online);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unregister_unknown_connection() {
        let registry = PresenceRegistry::new();
        let unreg = registry.unregister(&alice(), ConnectionId::new());
        assert!(!unreg.became_offline);
        assert_eq!(unreg.connection_count, 0);

        let a = ConnectionId::new();
        registry.register(&alice(), a);
        let unreg = registry.unregister(&alice(), ConnectionId::new());
        assert!(!unreg.became_offline);
        assert_eq!(registry.connection_count("u1"), 1);
    }

    #[test]
    fn test_double_unregister_is_single_edge() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = PresenceRegistry::with_change_sink(tx);
        let a = ConnectionId::new();

        registry.register(&alice(), a);
        assert!(registry.unregister(&alice(), a).became_offline);
        assert!(!registry.unregister(&alice(), a).became_offline);

        assert!(rx.try_recv().unwrap().online);
        assert!(!rx.try_recv().unwrap().online);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_snapshot_sorted() {
        let registry = PresenceRegistry::new();
        registry.register(&Identity::new("u2", "bob"), ConnectionId::new());
        registry.register(&alice(), ConnectionId::new());
        registry.register(&alice(), ConnectionId::new());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].username, "alice");
        assert_eq!(snapshot[0].connection_count, 2);
        assert_eq!(snapshot[1].username, "bob");
        assert_eq!(registry.total_connections(), 3);
    }

    #[test]
    fn test_concurrent_edges_on_one_identity() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = Arc::new(PresenceRegistry::with_change_sink(tx));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let id = ConnectionId::new();
                        registry.register(&alice(), id);
                        registry.unregister(&alice(), id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(registry.is_empty());

        // Edges must strictly alternate online/offline, starting online.
        let mut expect_online = true;
        let mut edges = 0;
        while let Ok(change) = rx.try_recv() {
            assert_eq!(change.online, expect_online);
            expect_online = !expect_online;
            edges += 1;
        }
        assert!(edges > 0);
        assert_eq!(edges % 2, 0);
    }

    #[derive(Default)]
    struct RecordingStore {
        writes: Mutex<Vec<(String, bool)>>,
        persisted: Vec<Identity>,
        fail_reads: bool,
    }

    #[async_trait]
    impl PresenceStore for RecordingStore {
        async fn set_online(
            &self,
            identity: &Identity,
            online: bool,
            _at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            self.writes
                .lock()
                .unwrap()
                .push((identity.user_id.clone(), online));
            Err(StoreError::Unavailable("writes always fail".into()))
        }

        async fn online_users(&self) -> Result<Vec<Identity>, StoreError> {
            if self.fail_reads {
                return Err(StoreError::Unavailable("offline".into()));
            }
            Ok(self.persisted.clone())
        }
    }

    #[tokio::test]
    async fn test_writer_applies_in_order_despite_failures() {
        let store = Arc::new(RecordingStore::default());
        let (registry, writer) = PresenceRegistry::with_presence_store(store.clone());
        let a = ConnectionId::new();

        registry.register(&alice(), a);
        registry.unregister(&alice(), a);
        registry.register(&alice(), a);
        assert!(registry.is_online("u1"));

        drop(registry);
        writer.finish().await;

        let writes = store.writes.lock().unwrap().clone();
        assert_eq!(
            writes,
            vec![
                ("u1".to_string(), true),
                ("u1".to_string(), false),
                ("u1".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn test_writer_finish_flushes_while_registry_alive() {
        let store = Arc::new(RecordingStore::default());
        let (registry, writer) = PresenceRegistry::with_presence_store(store.clone());
        let a = ConnectionId::new();

        registry.register(&alice(), a);
        registry.unregister(&alice(), a);
        writer.finish().await;

        let writes = store.writes.lock().unwrap().clone();
        assert_eq!(
            writes,
            vec![("u1".to_string(), true), ("u1".to_string(), false)]
        );

        // Edges after shutdown are not persisted, but the registry keeps working.
        let reg = registry.register(&alice(), a);
        assert!(reg.became_online);
        assert_eq!(store.writes.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_falls_back_only_when_empty() {
        let store = RecordingStore {
            persisted: vec![Identity::new("u9", "zed")],
            ..Default::default()
        };
        let registry = PresenceRegistry::new();

        let snapshot = registry.snapshot_or_persisted(&store).await;
        assert_eq!(snapshot.source, SnapshotSource::Persisted);
        assert_eq!(snapshot.users[0].user_id, "u9");
        assert_eq!(snapshot.users[0].connection_count, 0);

        registry.register(&alice(), ConnectionId::new());
        let snapshot = registry.snapshot_or_persisted(&store).await;
        assert_eq!(snapshot.source, SnapshotSource::Live);
        assert_eq!(snapshot.users.len(), 1);
        assert_eq!(snapshot.users[0].user_id, "u1");
    }

    #[tokio::test]
    async fn test_snapshot_fallback_read_failure() {
        let store = RecordingStore {
            fail_reads: true,
            ..Default::default()
        };
        let snapshot = PresenceRegistry::new().snapshot_or_persisted(&store).await;
        assert_eq!(snapshot.source, SnapshotSource::Live);
        assert!(snapshot.users.is_empty());
    }
}
