//! `Reading` — one atomic output of a plugin poll (spec.md §3).

use super::keys::StandardKey;
use super::value::Value;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Instant;

/// One atomic emission from a plugin's `read_static` or `read_dynamic`.
///
/// `monotonic_ts` is used for all elapsed-time arithmetic (filter,
/// watchdog); `wall_ts_utc` is used only for human-visible timestamps and
/// daily-midnight rollover, per the design note in spec.md §9.
#[derive(Debug, Clone)]
pub struct Reading {
    pub instance_id: String,
    pub monotonic_ts: Instant,
    pub wall_ts_utc: DateTime<Utc>,
    pub values: BTreeMap<StandardKey, Value>,
}

impl Reading {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            monotonic_ts: Instant::now(),
            wall_ts_utc: Utc::now(),
            values: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, key: StandardKey, value: impl Into<Value>) -> Self {
        self.values.insert(key, value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
