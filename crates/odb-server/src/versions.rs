//! Last-write versions for conflict detection
//!
//! Entries are sharded by FieldId. Entries at or below the collection
//! horizon are pruned; a missing entry then means "written at the horizon",
//! so a reader older than the horizon always conflicts.

use std::collections::HashMap;

use odb_core::{FieldId, IndexId, IndexValue, ObjectFieldId, ObjectId, Tid};

#[derive(Debug, Default)]
struct Shard {
    slots: HashMap<(ObjectId, bool), Tid>,
    indices: HashMap<IndexValue, Tid>,
}

impl Shard {
    fn is_empty(&self) -> bool {
        self.slots.is_empty() && self.indices.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct VersionTable {
    shards: HashMap<FieldId, Shard>,
    horizon: Tid,
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table whose history before `horizon` is unknown
    pub fn with_horizon(horizon: Tid) -> Self {
        VersionTable {
            shards: HashMap::new(),
            horizon,
        }
    }

    pub fn horizon(&self) -> Tid {
        self.horizon
    }

    pub fn stamp_slot(&mut self, key: &ObjectFieldId, tid: Tid) {
        self.shards
            .entry(key.field)
            .or_default()
            .slots
            .insert((key.object, key.is_index_value), tid);
    }

    pub fn stamp_index(&mut self, index: &IndexId, tid: Tid) {
        self.shards
            .entry(index.field)
            .or_default()
            .indices
            .insert(index.value.clone(), tid);
    }

    pub fn slot_version(&self, key: &ObjectFieldId) -> Tid {
        self.shards
            .get(&key.field)
            .and_then(|s| s.slots.get(&(key.object, key.is_index_value)))
            .copied()
            .unwrap_or(self.horizon)
    }

    pub fn index_version(&self, index: &IndexId) -> Tid {
        self.shards
            .get(&index.field)
            .and_then(|s| s.indices.get(&index.value))
            .copied()
            .unwrap_or(self.horizon)
    }

    /// Written after a reader at `as_of` could have seen it
    pub fn slot_is_stale(&self, key: &ObjectFieldId, as_of: Tid) -> bool {
        self.slot_version(key) > as_of
    }

    pub fn index_is_stale(&self, index: &IndexId, as_of: Tid) -> bool {
        self.index_version(index) > as_of
    }

    /// Forget entries at or below `horizon`; returns how many were dropped
    pub fn prune(&mut self, horizon: Tid) -> usize {
        if horizon <= self.horizon {
            return 0;
        }
        self.horizon = horizon;

        let mut dropped = 0;
        self.shards.retain(|_, shard| {
            let before = shard.slots.len() + shard.indices.len();
            shard.slots.retain(|_, tid| *tid > horizon);
            shard.indices.retain(|_, tid| *tid > horizon);
            dropped += before - shard.slots.len() - shard.indices.len();
            !shard.is_empty()
        });
        dropped
    }

    pub fn len(&self) -> usize {
        self.shards
            .values()
            .map(|s| s.slots.len() + s.indices.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn slot(o: u64) -> ObjectFieldId {
        ObjectFieldId::value(ObjectId::new(o), FieldId::new(1))
    }

    #[test]
    fn test_stale_after_later_write() {
        let mut table = VersionTable::new();
        table.stamp_slot(&slot(1), Tid::new(5));

        assert!(!table.slot_is_stale(&slot(1), Tid::new(5)));
        assert!(table.slot_is_stale(&slot(1), Tid::new(4)));
        assert!(!table.slot_is_stale(&slot(2), Tid::new(0)));
        assert!(!table.slot_is_stale(&ObjectFieldId::index(ObjectId::new(1), FieldId::new(1)), Tid::new(0)));
    }

    #[test]
    fn test_pruned_keys_count_as_written_at_horizon() {
        let mut table = VersionTable::new();
        table.stamp_slot(&slot(1), Tid::new(3));
        table.stamp_slot(&slot(2), Tid::new(8));
        let index = IndexId::new(FieldId::new(1), Bytes::from_static(b"v"));
        table.stamp_index(&index, Tid::new(2));

        assert_eq!(table.prune(Tid::new(5)), 2);
        assert_eq!(table.len(), 1);

        // older than the horizon: conflicts even though nothing newer was written
        assert!(table.slot_is_stale(&slot(1), Tid::new(4)));
        assert!(table.index_is_stale(&index, Tid::new(4)));
        assert!(!table.slot_is_stale(&slot(1), Tid::new(5)));
        assert!(table.slot_is_stale(&slot(2), Tid::new(7)));

        // horizon never moves backwards
        assert_eq!(table.prune(Tid::new(1)), 0);
        assert_eq!(table.horizon(), Tid::new(5));
    }
}
