//! Snapshot publication.
//!
//! [`SnapshotPublisher`] is the fan-out hub between the registry and the
//! stream subscribers. It owns the last emitted snapshot per session,
//! applies the change-detection rules from [`crate::snapshot`], and
//! distributes [`SnapshotOp`]s over a tokio broadcast channel.
//!
//! Delivery is decoupled: the registry calls [`SnapshotPublisher::upsert`]
//! while holding a session mutex, but the broadcast send never blocks and
//! subscribers drain on their own tasks. A slow subscriber lags and is told
//! so; it can always recover from a fresh [`SnapshotPublisher::resync`].

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tracing::{debug, trace, warn};

use crate::snapshot::{should_emit_update, Snapshot};

/// Default capacity of the broadcast channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// One publication: the operation kind plus the full snapshot. On `delete`
/// the snapshot is the last known value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum SnapshotOp {
    Insert { snapshot: Snapshot },
    Update { snapshot: Snapshot },
    Delete { snapshot: Snapshot },
}

impl SnapshotOp {
    /// The snapshot carried by this operation.
    #[must_use]
    pub fn snapshot(&self) -> &Snapshot {
        match self {
            Self::Insert { snapshot } | Self::Update { snapshot } | Self::Delete { snapshot } => {
                snapshot
            }
        }
    }

    /// The session this operation concerns.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.snapshot().session_id
    }

    /// The wire name of the operation kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert { .. } => "insert",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Publishes session snapshots to all subscribers.
#[derive(Debug)]
pub struct SnapshotPublisher {
    last: Mutex<HashMap<String, Snapshot>>,
    tx: Sender<SnapshotOp>,
}

impl SnapshotPublisher {
    /// Creates a publisher with the default channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a publisher with a custom channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            last: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Subscribes to live operations. Events published before the
    /// subscription are not replayed; use [`resync`](Self::resync) first.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<SnapshotOp> {
        self.tx.subscribe()
    }

    /// Returns the current collection, sorted by session id, for the
    /// initial `insert` replay a new subscriber receives.
    #[must_use]
    pub fn resync(&self) -> Vec<Snapshot> {
        let last = self.last.lock().expect("publisher lock poisoned");
        let mut snapshots: Vec<Snapshot> = last.values().cloned().collect();
        snapshots.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        snapshots
    }

    /// Offers a fresh snapshot. Emits `insert` on first observation,
    /// `update` iff a change-detection field differs, nothing otherwise.
    /// Returns the kind of the emitted operation, if any.
    pub fn upsert(&self, snapshot: Snapshot) -> Option<&'static str> {
        let op = {
            let mut last = self.last.lock().expect("publisher lock poisoned");
            match last.get(&snapshot.session_id) {
                None => {
                    last.insert(snapshot.session_id.clone(), snapshot.clone());
                    Some(SnapshotOp::Insert { snapshot })
                }
                Some(prev) if should_emit_update(prev, &snapshot) => {
                    last.insert(snapshot.session_id.clone(), snapshot.clone());
                    Some(SnapshotOp::Update { snapshot })
                }
                Some(_) => {
                    trace!(session_id = %snapshot.session_id, "snapshot unchanged, suppressed");
                    None
                }
            }
        };

        op.map(|op| {
            let kind = op.kind();
            self.send(op);
            kind
        })
    }

    /// Removes a session, emitting exactly one `delete` with the last known
    /// snapshot. Returns false when the session was never published.
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = {
            let mut last = self.last.lock().expect("publisher lock poisoned");
            last.remove(session_id)
        };
        match removed {
            Some(snapshot) => {
                self.send(SnapshotOp::Delete { snapshot });
                true
            }
            None => false,
        }
    }

    /// Number of currently published sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.last.lock().expect("publisher lock poisoned").len()
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn send(&self, op: SnapshotOp) {
        debug!(
            session_id = %op.session_id(),
            kind = op.kind(),
            "publishing snapshot operation"
        );
        if self.tx.send(op).is_err() {
            // No subscribers right now; the state is retained for resync.
            warn!("no active snapshot subscribers");
        }
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use chrono::{TimeZone, Utc};

    fn snapshot(id: &str) -> Snapshot {
        let session = Session::from_hook(
            id.to_string(),
            None,
            Some("/repo".to_string()),
            None,
            Utc.timestamp_opt(100, 0).unwrap(),
        );
        Snapshot::from_session(&session)
    }

    #[test]
    fn first_observation_inserts() {
        let publisher = SnapshotPublisher::new();
        let mut rx = publisher.subscribe();
        assert_eq!(publisher.upsert(snapshot("s1")), Some("insert"));
        let op = rx.try_recv().unwrap();
        assert!(matches!(op, SnapshotOp::Insert { .. }));
        assert_eq!(op.session_id(), "s1");
    }

    #[test]
    fn unchanged_snapshot_is_suppressed() {
        let publisher = SnapshotPublisher::new();
        let mut rx = publisher.subscribe();
        publisher.upsert(snapshot("s1"));
        assert_eq!(publisher.upsert(snapshot("s1")), None);
        rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn changed_snapshot_updates() {
        let publisher = SnapshotPublisher::new();
        let mut rx = publisher.subscribe();
        publisher.upsert(snapshot("s1"));
        let mut next = snapshot("s1");
        next.message_count = 3;
        assert_eq!(publisher.upsert(next), Some("update"));
        rx.try_recv().unwrap();
        assert!(matches!(rx.try_recv().unwrap(), SnapshotOp::Update { .. }));
    }

    #[test]
    fn delete_emits_exactly_once() {
        let publisher = SnapshotPublisher::new();
        let mut rx = publisher.subscribe();
        publisher.upsert(snapshot("s1"));
        assert!(publisher.remove("s1"));
        assert!(!publisher.remove("s1"));
        rx.try_recv().unwrap();
        assert!(matches!(rx.try_recv().unwrap(), SnapshotOp::Delete { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn remove_unknown_session_is_noop() {
        let publisher = SnapshotPublisher::new();
        assert!(!publisher.remove("ghost"));
        assert_eq!(publisher.session_count(), 0);
    }

    #[test]
    fn resync_returns_sorted_collection() {
        let publisher = SnapshotPublisher::new();
        publisher.upsert(snapshot("s2"));
        publisher.upsert(snapshot("s1"));
        publisher.upsert(snapshot("s3"));
        let ids: Vec<_> = publisher
            .resync()
            .into_iter()
            .map(|s| s.session_id)
            .collect();
        assert_eq!(ids, ["s1", "s2", "s3"]);
    }

    #[tokio::test]
    async fn per_session_emission_order_is_preserved() {
        let publisher = SnapshotPublisher::new();
        let mut rx = publisher.subscribe();

        publisher.upsert(snapshot("s1"));
        let mut next = snapshot("s1");
        next.message_count = 1;
        publisher.upsert(next.clone());
        next.message_count = 2;
        publisher.upsert(next);
        publisher.remove("s1");

        let kinds: Vec<&str> = (0..4).map(|_| rx.try_recv().unwrap().kind()).collect();
        assert_eq!(kinds, ["insert", "update", "update", "delete"]);
    }

    #[test]
    fn op_serializes_with_op_tag() {
        let op = SnapshotOp::Insert {
            snapshot: snapshot("s1"),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "insert");
        assert_eq!(json["snapshot"]["sessionId"], "s1");
    }
}
