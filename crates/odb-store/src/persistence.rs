//! Persistence trait and shared set-delta validation

use std::collections::{HashMap, HashSet};

use bytes::Bytes;

use odb_core::{IndexId, ObjectFieldId, ObjectId, OdbError, OdbResult, SetDeltas};

/// Scalar key in the store
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StoreKey {
    /// A versioned slot
    Value(ObjectFieldId),
    /// Authority bookkeeping (counters, schemas)
    Meta(String),
}

impl StoreKey {
    pub fn meta(name: impl Into<String>) -> Self {
        StoreKey::Meta(name.into())
    }
}

impl From<ObjectFieldId> for StoreKey {
    fn from(key: ObjectFieldId) -> Self {
        StoreKey::Value(key)
    }
}

/// Sets whose emptiness changed in a `set_several` call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetSeveralOutcome {
    /// Sets that went from empty to non-empty
    pub newly_set: Vec<IndexId>,
    /// Sets that became empty
    pub now_empty: Vec<IndexId>,
}

/// KV + set storage behind the authority
pub trait Persistence: Send + Sync {
    fn get(&self, key: &StoreKey) -> OdbResult<Option<Bytes>>;

    fn get_several(&self, keys: &[StoreKey]) -> OdbResult<Vec<Option<Bytes>>>;

    fn get_set_members(&self, index: &IndexId) -> OdbResult<HashSet<ObjectId>>;

    fn set(&self, key: StoreKey, value: Option<Bytes>) -> OdbResult<()> {
        self.set_several(vec![(key, value)], &SetDeltas::new(), &SetDeltas::new())
            .map(|_| ())
    }

    /// Apply writes (`None` deletes) and set deltas atomically.
    ///
    /// Adding a present member or removing an absent one is an invariant
    /// violation; nothing from the batch is applied in that case.
    fn set_several(
        &self,
        writes: Vec<(StoreKey, Option<Bytes>)>,
        adds: &SetDeltas,
        removes: &SetDeltas,
    ) -> OdbResult<SetSeveralOutcome>;

    fn exists(&self, key: &StoreKey) -> OdbResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn delete(&self, key: &StoreKey) -> OdbResult<()> {
        self.set(key.clone(), None)
    }
}

/// New membership of every set touched by a batch
#[derive(Debug, Default)]
pub struct SetPlan {
    pub sets: HashMap<IndexId, HashSet<ObjectId>>,
    pub outcome: SetSeveralOutcome,
}

/// Validate set deltas against current membership. Removes apply before
/// adds within a set.
pub fn plan_set_deltas(
    adds: &SetDeltas,
    removes: &SetDeltas,
    mut members: impl FnMut(&IndexId) -> OdbResult<HashSet<ObjectId>>,
) -> OdbResult<SetPlan> {
    let mut plan = SetPlan::default();
    let touched: HashSet<&IndexId> = adds.keys().chain(removes.keys()).collect();

    for index in touched {
        let before = members(index)?;
        let was_empty = before.is_empty();
        let mut after = before;

        for oid in removes.get(index).into_iter().flatten() {
            if !after.remove(oid) {
                return Err(OdbError::InvariantViolation(format!(
                    "remove of absent member {} from {:?}",
                    oid, index
                )));
            }
        }
        for oid in adds.get(index).into_iter().flatten() {
            if !after.insert(*oid) {
                return Err(OdbError::InvariantViolation(format!(
                    "add of present member {} to {:?}",
                    oid, index
                )));
            }
        }

        match (was_empty, after.is_empty()) {
            (true, false) => plan.outcome.newly_set.push(index.clone()),
            (false, true) => plan.outcome.now_empty.push(index.clone()),
            _ => {}
        }
        plan.sets.insert(index.clone(), after);
    }

    Ok(plan)
}
