//! Process-local persistence

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use parking_lot::RwLock;

use odb_core::{IndexId, ObjectId, OdbResult, SetDeltas};

use crate::{plan_set_deltas, Persistence, SetSeveralOutcome, StoreKey};

#[derive(Debug, Default)]
struct MemoryState {
    values: HashMap<StoreKey, Bytes>,
    sets: HashMap<IndexId, HashSet<ObjectId>>,
}

/// In-memory store; one lock covers values and sets so batches are atomic
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: RwLock<MemoryState>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored scalar keys
    pub fn len(&self) -> usize {
        self.state.read().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Persistence for MemoryPersistence {
    fn get(&self, key: &StoreKey) -> OdbResult<Option<Bytes>> {
        Ok(self.state.read().values.get(key).cloned())
    }

    fn get_several(&self, keys: &[StoreKey]) -> OdbResult<Vec<Option<Bytes>>> {
        let state = self.state.read();
        Ok(keys.iter().map(|k| state.values.get(k).cloned()).collect())
    }

    fn get_set_members(&self, index: &IndexId) -> OdbResult<HashSet<ObjectId>> {
        Ok(self.state.read().sets.get(index).cloned().unwrap_or_default())
    }

    fn set_several(
        &self,
        writes: Vec<(StoreKey, Option<Bytes>)>,
        adds: &SetDeltas,
        removes: &SetDeltas,
    ) -> OdbResult<SetSeveralOutcome> {
        let mut state = self.state.write();

        let plan = plan_set_deltas(adds, removes, |index| {
            Ok(state.sets.get(index).cloned().unwrap_or_default())
        })?;

        for (key, value) in writes {
            match value {
                Some(v) => {
                    state.values.insert(key, v);
                }
                None => {
                    state.values.remove(&key);
                }
            }
        }

        for (index, members) in plan.sets {
            if members.is_empty() {
                state.sets.remove(&index);
            } else {
                state.sets.insert(index, members);
            }
        }

        Ok(plan.outcome)
    }
}
