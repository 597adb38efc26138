//! The proxy's copy of every type it subscribes to upstream
//!
//! Only the latest value of each slot is kept, with the tid that wrote it.
//! Downstream subscriptions are served from here.

use std::collections::{BTreeSet, HashMap};

use bytes::Bytes;

use odb_core::{FieldSlot, IndexId, ObjectFieldId, ObjectId, SetDeltas, Tid, Writes};

#[derive(Debug, Default)]
pub struct Mirror {
    slots: HashMap<ObjectFieldId, (Option<Bytes>, Tid)>,
    members: HashMap<IndexId, BTreeSet<ObjectId>>,
}

impl Mirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ObjectFieldId) -> Option<Bytes> {
        self.slots.get(key).and_then(|(value, _)| value.clone())
    }

    pub fn written_at(&self, key: &ObjectFieldId) -> Option<Tid> {
        self.slots.get(key).map(|(_, tid)| *tid)
    }

    pub fn members(&self, index: &IndexId) -> Vec<ObjectId> {
        self.members
            .get(index)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn add_member(&mut self, index: IndexId, oid: ObjectId) {
        self.members.entry(index).or_default().insert(oid);
    }

    fn remove_member(&mut self, index: &IndexId, oid: ObjectId) {
        if let Some(members) = self.members.get_mut(index) {
            members.remove(&oid);
            if members.is_empty() {
                self.members.remove(index);
            }
        }
    }

    pub fn apply_transaction(
        &mut self,
        writes: &Writes,
        set_adds: &SetDeltas,
        set_removes: &SetDeltas,
        tid: Tid,
    ) {
        for (key, value) in writes {
            self.slots.insert(*key, (value.clone(), tid));
        }
        for (index, oids) in set_removes {
            for &oid in oids {
                self.remove_member(index, oid);
            }
        }
        for (index, oids) in set_adds {
            for &oid in oids {
                self.add_member(index.clone(), oid);
            }
        }
    }

    /// Apply a streamed snapshot taken at `at`. Slots written by a
    /// transaction after `since` are newer than the snapshot and kept.
    /// Returns the number of slots taken from the snapshot.
    pub fn apply_snapshot(&mut self, values: Writes, index_values: Writes, since: Tid, at: Tid) -> usize {
        let mut applied = 0;
        for (key, value) in values.into_iter().chain(index_values) {
            if self.written_at(&key).map_or(false, |t| t > since) {
                continue;
            }
            if key.is_index_value {
                let old = self.get(&key);
                if old != value {
                    if let Some(old) = old {
                        self.remove_member(&IndexId::new(key.field, old), key.object);
                    }
                }
                if let Some(new) = &value {
                    self.add_member(IndexId::new(key.field, new.clone()), key.object);
                }
            }
            self.slots.insert(key, (value, at));
            applied += 1;
        }
        applied
    }

    /// Current slots of `oids`: (value slots, index slots)
    pub fn object_values(&self, fields: &[FieldSlot], oids: &[ObjectId], with_values: bool) -> (Writes, Writes) {
        let mut values = Writes::new();
        let mut index_values = Writes::new();
        for &oid in oids {
            for field in fields {
                if with_values {
                    let key = ObjectFieldId::value(oid, field.id);
                    values.insert(key, self.get(&key));
                }
                if field.indexed {
                    let key = ObjectFieldId::index(oid, field.id);
                    index_values.insert(key, self.get(&key));
                }
            }
        }
        (values, index_values)
    }

    /// Values `keys` hold right now
    pub fn priors(&self, keys: impl IntoIterator<Item = ObjectFieldId>) -> Writes {
        keys.into_iter().map(|k| (k, self.get(&k))).collect()
    }
}
