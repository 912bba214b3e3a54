//! Publisher interface (spec.md §4.9, C9): `subscribe(filter) -> stream
//! of Snapshot`. Pull-on-demand; coalesces updates so a slow subscriber
//! sees only the latest state, never a backlog. Concrete sinks (dashboard
//! socket, MQTT, persistence writer) subscribe through this contract but
//! are not part of the core.

use crate::domain::{StandardKey, SystemState};
use std::sync::Arc;
use tokio::sync::watch;

/// An immutable view of `SystemState` plus the version it was taken at
/// (spec.md §6 subscriber snapshot schema).
#[derive(Clone)]
pub struct Snapshot {
    pub state: Arc<SystemState>,
    pub version: u64,
    pub server_timestamp_ms_utc: i64,
}

/// A key predicate; `All` forwards every key, `Only` restricts a
/// subscription to a fixed set (e.g. a dashboard panel that only cares
/// about battery keys).
#[derive(Clone)]
pub enum KeyFilter {
    All,
    Only(Vec<StandardKey>),
}

impl KeyFilter {
    fn matches(&self, key: &StandardKey) -> bool {
        match self {
            KeyFilter::All => true,
            KeyFilter::Only(keys) => keys.contains(key),
        }
    }
}

/// Publishes `SystemState` versions to subscribers via a `tokio::sync::
/// watch` channel, which inherently coalesces: a subscriber that misses
/// intermediate updates simply observes the latest value on its next
/// poll (spec.md §4.9: "the publisher coalesces multiple updates into the
/// latest").
pub struct Publisher {
    tx: watch::Sender<Option<Snapshot>>,
}

impl Publisher {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn publish(&self, state: Arc<SystemState>) {
        let version = state.version();
        let snapshot = Snapshot {
            state,
            version,
            server_timestamp_ms_utc: chrono::Utc::now().timestamp_millis(),
        };
        let _ = self.tx.send(Some(snapshot));
    }

    /// Returns a handle the subscriber polls at its own pace (spec.md
    /// §4.9 "pull-on-demand"). `filter` is stored for the caller's own use
    /// when projecting a `Snapshot` down to a subset of keys.
    pub fn subscribe(&self, filter: KeyFilter) -> Subscription {
        Subscription { rx: self.tx.subscribe(), filter }
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Subscription {
    rx: watch::Receiver<Option<Snapshot>>,
    filter: KeyFilter,
}

impl Subscription {
    /// Blocks until a new snapshot is published, then returns it. Never
    /// returns the same version twice.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.rx.changed().await.ok()?;
        self.rx.borrow().clone()
    }

    /// Projects a snapshot's entries down to the keys this subscription
    /// cares about.
    pub fn project(&self, snapshot: &Snapshot) -> Vec<(StandardKey, crate::domain::Value)> {
        snapshot
            .state
            .iter()
            .filter(|(k, _)| self.filter.matches(k))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }
}
