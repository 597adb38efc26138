//! Write-through cache over a replicated key-value backend
//!
//! Backend key layout:
//! - `v:<object>:<field>:<0|1>` slot values (1 marks an index slot)
//! - `m:<name>` authority bookkeeping
//! - `s:<field>:<hex value>` index sets, members are 8-byte LE object ids

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use odb_core::{IndexId, ObjectId, OdbError, OdbResult, SetDeltas};

use crate::{plan_set_deltas, Persistence, SetSeveralOutcome, StoreKey};

/// One atomic batch of backend operations
#[derive(Clone, Debug, Default)]
pub struct KvBatch {
    /// Scalar writes; `None` deletes
    pub sets: Vec<(String, Option<Bytes>)>,
    pub set_adds: Vec<(String, Vec<Bytes>)>,
    pub set_removes: Vec<(String, Vec<Bytes>)>,
}

impl KvBatch {
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.set_adds.is_empty() && self.set_removes.is_empty()
    }
}

/// Operations a replicated KV backend must offer
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &str) -> OdbResult<Option<Bytes>>;

    fn mget(&self, keys: &[String]) -> OdbResult<Vec<Option<Bytes>>>;

    fn set_members(&self, key: &str) -> OdbResult<Vec<Bytes>>;

    /// Apply a batch atomically
    fn apply(&self, batch: KvBatch) -> OdbResult<()>;
}

impl<B: KvBackend + ?Sized> KvBackend for Arc<B> {
    fn get(&self, key: &str) -> OdbResult<Option<Bytes>> {
        (**self).get(key)
    }

    fn mget(&self, keys: &[String]) -> OdbResult<Vec<Option<Bytes>>> {
        (**self).mget(keys)
    }

    fn set_members(&self, key: &str) -> OdbResult<Vec<Bytes>> {
        (**self).set_members(key)
    }

    fn apply(&self, batch: KvBatch) -> OdbResult<()> {
        (**self).apply(batch)
    }
}

/// Backend key for a scalar
pub fn scalar_key(key: &StoreKey) -> String {
    match key {
        StoreKey::Value(slot) => format!(
            "v:{:016x}:{}:{}",
            slot.object.0, slot.field.0, slot.is_index_value as u8
        ),
        StoreKey::Meta(name) => format!("m:{}", name),
    }
}

/// Backend key for an index set
pub fn set_key(index: &IndexId) -> String {
    let mut key = format!("s:{}:", index.field.0);
    for b in index.value.iter() {
        let _ = write!(key, "{:02x}", b);
    }
    key
}

fn member_bytes(oid: &ObjectId) -> Bytes {
    Bytes::copy_from_slice(&oid.to_bytes())
}

fn parse_member(raw: &[u8]) -> OdbResult<ObjectId> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| OdbError::Store(format!("bad set member of {} bytes", raw.len())))?;
    Ok(ObjectId::from_bytes(bytes))
}

#[derive(Debug, Default)]
struct KvCache {
    values: HashMap<StoreKey, Option<Bytes>>,
    sets: HashMap<IndexId, HashSet<ObjectId>>,
}

/// Persistence over a [`KvBackend`]. Every read is served from the cache
/// once loaded; every write goes to the backend first, then the cache.
pub struct KvPersistence<B: KvBackend> {
    backend: B,
    cache: RwLock<KvCache>,
    writer: Mutex<()>,
}

impl<B: KvBackend> KvPersistence<B> {
    pub fn new(backend: B) -> Self {
        KvPersistence {
            backend,
            cache: RwLock::new(KvCache::default()),
            writer: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn load_set(&self, index: &IndexId) -> OdbResult<HashSet<ObjectId>> {
        if let Some(members) = self.cache.read().sets.get(index) {
            return Ok(members.clone());
        }
        let members = self
            .backend
            .set_members(&set_key(index))?
            .iter()
            .map(|raw| parse_member(raw))
            .collect::<OdbResult<HashSet<_>>>()?;
        self.cache
            .write()
            .sets
            .insert(index.clone(), members.clone());
        Ok(members)
    }
}

impl<B: KvBackend> Persistence for KvPersistence<B> {
    fn get(&self, key: &StoreKey) -> OdbResult<Option<Bytes>> {
        if let Some(value) = self.cache.read().values.get(key) {
            return Ok(value.clone());
        }
        let value = self.backend.get(&scalar_key(key))?;
        self.cache.write().values.insert(key.clone(), value.clone());
        Ok(value)
    }

    fn get_several(&self, keys: &[StoreKey]) -> OdbResult<Vec<Option<Bytes>>> {
        let mut out: Vec<Option<Option<Bytes>>> = {
            let cache = self.cache.read();
            keys.iter().map(|k| cache.values.get(k).cloned()).collect()
        };

        let missing: Vec<usize> = (0..keys.len()).filter(|i| out[*i].is_none()).collect();
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|i| scalar_key(&keys[*i])).collect();
            let fetched = self.backend.mget(&names)?;
            if fetched.len() != missing.len() {
                return Err(OdbError::Store(format!(
                    "mget returned {} values for {} keys",
                    fetched.len(),
                    missing.len()
                )));
            }
            let mut cache = self.cache.write();
            for (i, value) in missing.into_iter().zip(fetched) {
                cache.values.insert(keys[i].clone(), value.clone());
                out[i] = Some(value);
            }
        }

        Ok(out.into_iter().map(Option::flatten).collect())
    }

    fn get_set_members(&self, index: &IndexId) -> OdbResult<HashSet<ObjectId>> {
        self.load_set(index)
    }

    fn set_several(
        &self,
        writes: Vec<(StoreKey, Option<Bytes>)>,
        adds: &SetDeltas,
        removes: &SetDeltas,
    ) -> OdbResult<SetSeveralOutcome> {
        let _writer = self.writer.lock();

        let plan = plan_set_deltas(adds, removes, |index| self.load_set(index))?;

        let mut batch = KvBatch {
            sets: writes
                .iter()
                .map(|(k, v)| (scalar_key(k), v.clone()))
                .collect(),
            ..KvBatch::default()
        };
        for (index, oids) in adds {
            if !oids.is_empty() {
                batch
                    .set_adds
                    .push((set_key(index), oids.iter().map(member_bytes).collect()));
            }
        }
        for (index, oids) in removes {
            if !oids.is_empty() {
                batch
                    .set_removes
                    .push((set_key(index), oids.iter().map(member_bytes).collect()));
            }
        }

        if !batch.is_empty() {
            self.backend.apply(batch)?;
        }

        let mut cache = self.cache.write();
        for (key, value) in writes {
            cache.values.insert(key, value);
        }
        for (index, members) in plan.sets {
            cache.sets.insert(index, members);
        }

        Ok(plan.outcome)
    }
}
