//! `SystemState` — the single process-wide merged view (spec.md §3).
//!
//! Only the aggregator ever holds `&mut SystemState`; every other
//! component (supervisor, publisher) reads through an immutable
//! `Snapshot`, matching the ownership rule in spec.md §3/§5.

use super::keys::StandardKey;
use super::value::Value;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Per-instance connection bookkeeping folded into `SystemState`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PluginStatus {
    pub connected: bool,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

impl Default for PluginStatus {
    fn default() -> Self {
        Self {
            connected: false,
            last_error: None,
            consecutive_failures: 0,
        }
    }
}

/// A single entry in `SystemState`: the value plus who last wrote it and
/// when, used to derive staleness (spec.md §3 invariant).
#[derive(Debug, Clone, Serialize)]
pub struct StateEntry {
    pub value: Value,
    pub owner_instance_id: String,
    pub wall_ts: DateTime<Utc>,
}

/// The canonical, process-wide merged view.
#[derive(Debug, Clone, Default)]
pub struct SystemState {
    entries: BTreeMap<StandardKey, StateEntry>,
    pub last_seen_by_instance: BTreeMap<String, DateTime<Utc>>,
    pub plugin_status: BTreeMap<String, PluginStatus>,
    /// Monotonically increasing version, bumped on every accepted write
    /// (spec.md §8 invariant 6: "snapshot_version increases strictly
    /// monotonically").
    version: u64,
}

impl SystemState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get(&self, key: &StandardKey) -> Option<&StateEntry> {
        self.entries.get(key)
    }

    /// Write an accepted value for `key`, owned by `instance_id`, bumping
    /// the snapshot version. Called only by the aggregator after the
    /// filter has accepted the value.
    pub fn set(&mut self, key: StandardKey, value: Value, instance_id: &str, wall_ts: DateTime<Utc>) {
        self.entries.insert(
            key,
            StateEntry {
                value,
                owner_instance_id: instance_id.to_string(),
                wall_ts,
            },
        );
        self.last_seen_by_instance
            .insert(instance_id.to_string(), wall_ts);
        self.version += 1;
    }

    pub fn mark_status(&mut self, instance_id: &str, status: PluginStatus) {
        self.plugin_status.insert(instance_id.to_string(), status);
        // Status changes are visible to subscribers, so they count as a
        // state mutation for versioning purposes too.
        self.version += 1;
    }

    /// Keys whose owning instance has gone stale relative to `now`, given
    /// `staleness_timeout`. Used by the publisher to downgrade entries
    /// per spec.md §3's staleness invariant.
    pub fn stale_keys(&self, now: DateTime<Utc>, staleness_timeout: chrono::Duration) -> Vec<StandardKey> {
        self.entries
            .iter()
            .filter(|(_, entry)| now - entry.wall_ts > staleness_timeout)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&StandardKey, &StateEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bumps_version_monotonically() {
        let mut state = SystemState::new();
        assert_eq!(state.version(), 0);
        let now = Utc::now();
        state.set(StandardKey::PvTotalDcPowerWatts, Value::Number(1.0), "inv1", now);
        assert_eq!(state.version(), 1);
        state.set(StandardKey::PvTotalDcPowerWatts, Value::Number(2.0), "inv1", now);
        assert_eq!(state.version(), 2);
    }

    #[test]
    fn stale_keys_respects_timeout() {
        let mut state = SystemState::new();
        let old = Utc::now() - chrono::Duration::seconds(1000);
        state.set(StandardKey::GridVoltageVolts, Value::Number(230.0), "inv1", old);
        let stale = state.stale_keys(Utc::now(), chrono::Duration::seconds(900));
        assert_eq!(stale, vec![StandardKey::GridVoltageVolts]);
    }
}
