//! Concrete plugins (spec.md §4.4, C4): register maps, status/fault
//! dictionaries, and raw-key-to-`StandardKey` translation, per device
//! family.

pub mod generic_bms;
pub mod generic_modbus_inverter;
pub mod powmr_inv8851;

use crate::domain::StandardKey;
use std::collections::HashSet;
use std::sync::Mutex;

/// Drop unrecognized raw keys silently except for a one-time warning per
/// key per session (spec.md §4.4).
pub(crate) struct UnknownKeyWarner {
    warned: Mutex<HashSet<String>>,
}

impl UnknownKeyWarner {
    pub fn new() -> Self {
        Self {
            warned: Mutex::new(HashSet::new()),
        }
    }

    pub fn warn_once(&self, instance_id: &str, raw_key: &str) {
        let mut warned = self.warned.lock().unwrap();
        if warned.insert(raw_key.to_string()) {
            tracing::warn!(instance_id, raw_key, "dropping unrecognized raw key");
        }
    }
}

impl Default for UnknownKeyWarner {
    fn default() -> Self {
        Self::new()
    }
}

/// Translate a raw `(name, StandardKey)` pair, returning `None` (and
/// warning once) when `key` is an escape-hatch `Unknown` variant that a
/// real plugin should never emit.
pub(crate) fn translate_or_warn(
    warner: &UnknownKeyWarner,
    instance_id: &str,
    raw_key: &str,
    key: StandardKey,
) -> Option<StandardKey> {
    if matches!(key, StandardKey::Unknown(_)) {
        warner.warn_once(instance_id, raw_key);
        None
    } else {
        Some(key)
    }
}
