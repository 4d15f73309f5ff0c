//! Property bags attached to intervals and references, and the pending-ack
//! bookkeeping that makes concurrent property edits converge.

use std::collections::HashMap;

use serde_json::Value;
use smartstring::alias::String as SmartString;

use crate::{Seq, UNASSIGNED_SEQ};

/// A mapping from property key to arbitrary JSON value.
///
/// A `null` value in an incoming change deletes the key.
pub type PropertySet = HashMap<SmartString, Value>;

/// Property key holding an interval's stable id. Immutable once set.
pub const RESERVED_INTERVAL_ID_KEY: &str = "intervalId";

/// Property key naming the collection an endpoint belongs to. Always an
/// array of exactly one label.
pub const RESERVED_RANGE_LABELS_KEY: &str = "rangeLabels";

pub fn is_reserved_key(key: &str) -> bool {
    key == RESERVED_INTERVAL_ID_KEY || key == RESERVED_RANGE_LABELS_KEY
}

/// Tracks property changes that have been applied locally but not yet
/// acknowledged.
///
/// While a key has pending local updates, remote writes to that key are
/// ignored: the local client will eventually send its own op, and
/// first-writer-wins at the key level would otherwise let a remote change
/// flicker through before being overwritten on ack.
#[derive(Debug, Clone, Default)]
pub struct PropertyManager {
    pending_key_update_count: HashMap<SmartString, usize>,
}

impl PropertyManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_pending_property(&self, key: &str) -> bool {
        self.pending_key_update_count
            .get(key)
            .is_some_and(|count| *count > 0)
    }

    /// Apply a property change to `target`, returning the deltas (the
    /// previous value per applied key; `null` where the key was absent).
    ///
    /// `seq` is [`UNASSIGNED_SEQ`] for local changes, which marks every
    /// touched key pending. Remote changes (a real sequence number) skip
    /// keys with pending local updates.
    pub fn change_properties(
        &mut self,
        op_props: &PropertySet,
        target: &mut PropertySet,
        seq: Seq,
    ) -> PropertySet {
        let local = seq == UNASSIGNED_SEQ;
        let mut deltas = PropertySet::new();
        for (key, value) in op_props {
            if local {
                *self
                    .pending_key_update_count
                    .entry(key.clone())
                    .or_insert(0) += 1;
            } else if self.has_pending_property(key) {
                continue;
            }

            let previous = if value.is_null() {
                target.remove(key)
            } else {
                target.insert(key.clone(), value.clone())
            };
            deltas.insert(key.clone(), previous.unwrap_or(Value::Null));
        }
        deltas
    }

    /// Acknowledge a local property change. Must be called exactly once per
    /// local `change_properties` call, with the same keys.
    pub fn ack_pending_properties(&mut self, op_props: &PropertySet) {
        for key in op_props.keys() {
            let count = self
                .pending_key_update_count
                .get_mut(key)
                .unwrap_or_else(|| {
                    panic!("Internal consistency error: ack for non-pending property {key}")
                });
            *count -= 1;
            if *count == 0 {
                self.pending_key_update_count.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(pairs: &[(&str, Value)]) -> PropertySet {
        pairs
            .iter()
            .map(|(k, v)| (SmartString::from(*k), v.clone()))
            .collect()
    }

    #[test]
    fn local_change_applies_and_tracks_pending() {
        let mut manager = PropertyManager::new();
        let mut target = PropertySet::new();

        let deltas = manager.change_properties(
            &props(&[("a", json!(1))]),
            &mut target,
            UNASSIGNED_SEQ,
        );
        assert_eq!(target.get("a"), Some(&json!(1)));
        assert_eq!(deltas.get("a"), Some(&Value::Null));
        assert!(manager.has_pending_property("a"));

        manager.ack_pending_properties(&props(&[("a", json!(1))]));
        assert!(!manager.has_pending_property("a"));
    }

    #[test]
    fn remote_change_skips_pending_keys() {
        let mut manager = PropertyManager::new();
        let mut target = PropertySet::new();

        manager.change_properties(&props(&[("a", json!(1))]), &mut target, UNASSIGNED_SEQ);

        // Remote write to "a" is suppressed, "b" applies.
        let deltas =
            manager.change_properties(&props(&[("a", json!(9)), ("b", json!(2))]), &mut target, 17);
        assert_eq!(target.get("a"), Some(&json!(1)));
        assert_eq!(target.get("b"), Some(&json!(2)));
        assert!(!deltas.contains_key("a"));

        manager.ack_pending_properties(&props(&[("a", json!(1))]));
        let _ = manager.change_properties(&props(&[("a", json!(9))]), &mut target, 18);
        assert_eq!(target.get("a"), Some(&json!(9)));
    }

    #[test]
    fn null_deletes_key() {
        let mut manager = PropertyManager::new();
        let mut target = props(&[("a", json!(1))]);

        let deltas =
            manager.change_properties(&props(&[("a", Value::Null)]), &mut target, UNASSIGNED_SEQ);
        assert!(!target.contains_key("a"));
        assert_eq!(deltas.get("a"), Some(&json!(1)));
    }
}
