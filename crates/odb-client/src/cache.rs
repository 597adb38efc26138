//! Versioned client cache
//!
//! Every slot keeps its values over time so a view pinned at a tid reads a
//! consistent snapshot while newer transactions keep arriving. Index
//! membership is derived from index-slot writes: when a slot moves from
//! `a` to `b`, the object leaves `(field, a)` and joins `(field, b)` at
//! that tid.
//!
//! Subscription data is buffered until `SubscriptionComplete` and applied
//! at its tid, skipping slots a transaction wrote while the subscription
//! was streaming.

use std::collections::{BTreeMap, HashMap, HashSet};

use bytes::Bytes;

use odb_core::{
    Catalog, FieldMapping, FieldSlot, IndexId, ObjectFieldId, ObjectId, SchemaDefinition, Tid,
    TypeKey, Writes,
};
use odb_wire::IndexKey;

/// A subscription as the authority names it
pub type SubscriptionKey = (TypeKey, IndexKey);

/// Values of one key, oldest first
#[derive(Clone, Debug)]
struct History<T> {
    entries: Vec<(Tid, T)>,
}

impl<T> Default for History<T> {
    fn default() -> Self {
        History {
            entries: Vec::new(),
        }
    }
}

impl<T> History<T> {
    fn at(&self, tid: Tid) -> Option<&T> {
        let idx = self.entries.partition_point(|(t, _)| *t <= tid);
        idx.checked_sub(1).map(|i| &self.entries[i].1)
    }

    fn latest(&self) -> Option<&T> {
        self.entries.last().map(|(_, v)| v)
    }

    fn latest_tid(&self) -> Option<Tid> {
        self.entries.last().map(|(t, _)| *t)
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn record(&mut self, tid: Tid, value: T) {
        let idx = self.entries.partition_point(|(t, _)| *t <= tid);
        match idx.checked_sub(1) {
            Some(prev) if self.entries[prev].0 == tid => self.entries[prev].1 = value,
            _ => self.entries.insert(idx, (tid, value)),
        }
    }

    /// Drop entries hidden from every view at or after `floor`
    fn prune(&mut self, floor: Tid) -> usize {
        let idx = self.entries.partition_point(|(t, _)| *t <= floor);
        if idx > 1 {
            self.entries.drain(..idx - 1);
            idx - 1
        } else {
            0
        }
    }

    /// Only a single old entry that reads the same as no entry
    fn is_dead(&self, floor: Tid, absent: impl Fn(&T) -> bool) -> bool {
        match self.entries.as_slice() {
            [(tid, value)] => *tid <= floor && absent(value),
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct PendingSubscription {
    lazy: bool,
    /// Cache tid when the request went out
    started: Tid,
    values: Writes,
    index_values: Writes,
    identities: Vec<ObjectId>,
}

#[derive(Debug, Default)]
pub struct VersionedCache {
    tid: Tid,
    gc_floor: Tid,
    catalog: Catalog,
    /// Schemas this connection defined, by name
    definitions: HashMap<String, SchemaDefinition>,
    slots: HashMap<ObjectFieldId, History<Option<Bytes>>>,
    members: HashMap<IndexId, HashMap<ObjectId, History<bool>>>,
    type_subscriptions: HashSet<TypeKey>,
    index_subscriptions: HashSet<IndexId>,
    pending: HashMap<SubscriptionKey, PendingSubscription>,
    completions: HashMap<SubscriptionKey, usize>,
    /// Lazily replicated objects not loaded yet, with the tid they
    /// entered scope at
    unloaded: HashMap<ObjectId, (TypeKey, Tid)>,
    open_views: BTreeMap<Tid, usize>,
}

impl VersionedCache {
    pub fn new() -> Self {
        VersionedCache {
            catalog: Catalog::new(),
            ..Default::default()
        }
    }

    /// Latest tid applied
    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn advance_to(&mut self, tid: Tid) {
        self.tid = self.tid.max(tid);
    }

    /// Views older than this can no longer be opened
    pub fn gc_floor(&self) -> Tid {
        self.gc_floor
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn remember_definition(&mut self, name: &str, definition: &SchemaDefinition) {
        self.definitions
            .entry(name.to_owned())
            .or_default()
            .merge(definition);
    }

    pub fn absorb_mapping(&mut self, name: &str, mapping: &FieldMapping) {
        let definition = self.definitions.get(name).cloned().unwrap_or_default();
        self.catalog.absorb_mapping(name, &definition, mapping);
    }

    /// Whether every field of `definition` has an id
    pub fn has_mapping_for(&self, name: &str, definition: &SchemaDefinition) -> bool {
        definition
            .field_definitions(name)
            .iter()
            .all(|field| self.catalog.field_id(field).is_some())
    }

    pub fn type_fields(&self, ty: &TypeKey) -> Vec<FieldSlot> {
        self.catalog.type_fields(ty)
    }

    pub fn begin_subscription(&mut self, key: SubscriptionKey, lazy: bool) {
        let started = self.tid;
        let pending = self.pending.entry(key).or_insert_with(|| PendingSubscription {
            lazy,
            started,
            ..Default::default()
        });
        pending.lazy &= lazy;
    }

    pub fn buffer_data(
        &mut self,
        key: &SubscriptionKey,
        values: Writes,
        index_values: Writes,
        identities: Option<Vec<ObjectId>>,
    ) {
        let Some(pending) = self.pending.get_mut(key) else {
            tracing::debug!("subscription data for {:?} nobody asked for", key);
            return;
        };
        pending.values.extend(values);
        pending.index_values.extend(index_values);
        pending.identities.extend(identities.unwrap_or_default());
    }

    pub fn buffer_lazy(&mut self, key: &SubscriptionKey, identities: Vec<ObjectId>, index_values: Writes) {
        self.buffer_data(key, Writes::new(), index_values, Some(identities));
    }

    /// Apply buffered data at `tid` and make the subscription visible
    pub fn complete_subscription(&mut self, key: &SubscriptionKey, tid: Tid) {
        if let Some(pending) = self.pending.remove(key) {
            let mut loaded = HashSet::new();
            for (slot, value) in pending.values.into_iter().chain(pending.index_values) {
                if !slot.is_index_value {
                    loaded.insert(slot.object);
                }
                let written_meanwhile = self
                    .slots
                    .get(&slot)
                    .and_then(History::latest_tid)
                    .map_or(false, |t| t > pending.started);
                if !written_meanwhile {
                    self.write_slot(slot, value, tid);
                }
            }

            let (ty, index_key) = key;
            if pending.lazy {
                for oid in pending.identities {
                    if !loaded.contains(&oid) {
                        self.unloaded.entry(oid).or_insert_with(|| (ty.clone(), tid));
                    }
                }
            } else {
                for oid in loaded {
                    self.unloaded.remove(&oid);
                }
            }

            match index_key {
                None => {
                    self.type_subscriptions.insert(ty.clone());
                }
                Some((fieldname, value)) => {
                    if let Some(field) = self.catalog.field_id(&ty.field(fieldname.as_str())) {
                        self.index_subscriptions
                            .insert(IndexId::new(field, value.clone()));
                    }
                }
            }
        }

        self.advance_to(tid);
        *self.completions.entry(key.clone()).or_default() += 1;
    }

    pub fn completions(&self, key: &SubscriptionKey) -> usize {
        self.completions.get(key).copied().unwrap_or(0)
    }

    fn write_slot(&mut self, key: ObjectFieldId, value: Option<Bytes>, tid: Tid) {
        if key.is_index_value {
            let old = self
                .slots
                .get(&key)
                .and_then(|h| h.latest().cloned())
                .flatten();
            if old != value {
                if let Some(old) = old {
                    self.membership(IndexId::new(key.field, old), key.object)
                        .record(tid, false);
                }
                if let Some(new) = &value {
                    self.membership(IndexId::new(key.field, new.clone()), key.object)
                        .record(tid, true);
                }
            }
        }
        self.slots.entry(key).or_default().record(tid, value);
    }

    /// Fill a slot nothing has written yet
    fn backfill_slot(&mut self, key: ObjectFieldId, value: Option<Bytes>, tid: Tid) {
        if self.slots.get(&key).map_or(false, |h| !h.is_empty()) {
            return;
        }
        if key.is_index_value {
            if let Some(v) = &value {
                self.membership(IndexId::new(key.field, v.clone()), key.object)
                    .record(tid, true);
            }
        }
        self.slots.entry(key).or_default().record(tid, value);
    }

    fn membership(&mut self, index: IndexId, oid: ObjectId) -> &mut History<bool> {
        self.members.entry(index).or_default().entry(oid).or_default()
    }

    pub fn apply_transaction(&mut self, writes: &Writes, tid: Tid) {
        for (key, value) in writes {
            self.write_slot(*key, value.clone(), tid);
        }
        self.advance_to(tid);
    }

    /// Values lazily replicated slots held before the next transaction
    pub fn apply_priors(&mut self, writes: Writes) {
        for (key, value) in writes {
            let since = self.unloaded.get(&key.object).map_or(self.tid, |(_, t)| *t);
            self.backfill_slot(key, value, since);
        }
    }

    pub fn apply_lazy_load(&mut self, oid: ObjectId, values: Writes) {
        let since = match self.unloaded.remove(&oid) {
            Some((_, since)) => since,
            None => self.tid,
        };
        for (key, value) in values {
            self.backfill_slot(key, value, since);
        }
    }

    /// Type to load `key`'s object as, when it is lazy and unread
    pub fn needs_load(&self, key: &ObjectFieldId, tid: Tid) -> Option<TypeKey> {
        let (ty, _) = self.unloaded.get(&key.object)?;
        self.value_at(key, tid).is_none().then(|| ty.clone())
    }

    pub fn is_loaded(&self, oid: ObjectId) -> bool {
        !self.unloaded.contains_key(&oid)
    }

    /// `None` when the slot is unknown at `tid`
    pub fn value_at(&self, key: &ObjectFieldId, tid: Tid) -> Option<Option<Bytes>> {
        self.slots.get(key).and_then(|h| h.at(tid)).cloned()
    }

    pub fn exists_at(&self, ty: &TypeKey, oid: ObjectId, tid: Tid) -> bool {
        self.catalog.exists_field(ty).map_or(false, |exists| {
            matches!(
                self.value_at(&ObjectFieldId::index(oid, exists), tid),
                Some(Some(_))
            )
        })
    }

    pub fn members_at(&self, index: &IndexId, tid: Tid) -> Vec<ObjectId> {
        let mut members: Vec<ObjectId> = self
            .members
            .get(index)
            .map(|m| {
                m.iter()
                    .filter(|(_, h)| h.at(tid).copied().unwrap_or(false))
                    .map(|(oid, _)| *oid)
                    .collect()
            })
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Whether a subscription replicates every member of `index`
    pub fn covers(&self, index: &IndexId) -> bool {
        if self.index_subscriptions.contains(index) {
            return true;
        }
        self.catalog
            .type_of(index.field)
            .map_or(false, |ty| self.type_subscriptions.contains(&ty))
    }

    pub fn is_type_subscribed(&self, ty: &TypeKey) -> bool {
        self.type_subscriptions.contains(ty)
    }

    pub fn open_view(&mut self, tid: Tid) {
        *self.open_views.entry(tid).or_default() += 1;
    }

    pub fn close_view(&mut self, tid: Tid) {
        if let Some(count) = self.open_views.get_mut(&tid) {
            *count -= 1;
            if *count == 0 {
                self.open_views.remove(&tid);
            }
        }
    }

    pub fn open_view_count(&self) -> usize {
        self.open_views.values().sum()
    }

    /// Forget versions no open view can read; returns entries dropped
    pub fn collect_garbage(&mut self) -> usize {
        let floor = self
            .open_views
            .keys()
            .next()
            .copied()
            .unwrap_or(self.tid)
            .min(self.tid);
        self.gc_floor = self.gc_floor.max(floor);

        let mut dropped = 0;
        self.slots.retain(|_, history| {
            dropped += history.prune(floor);
            !history.is_dead(floor, Option::is_none)
        });
        self.members.retain(|_, members| {
            members.retain(|_, history| {
                dropped += history.prune(floor);
                !history.is_dead(floor, |member| !*member)
            });
            !members.is_empty()
        });

        if dropped > 0 {
            tracing::trace!("cache dropped {} versions below {}", dropped, floor);
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use odb_core::{FieldId, TypeDefinition, EXISTS_FIELD};

    use super::*;

    struct Fixture {
        cache: VersionedCache,
        ty: TypeKey,
        k: FieldId,
        x: FieldId,
        exists: FieldId,
    }

    fn fixture() -> Fixture {
        let mut cache = VersionedCache::new();
        let definition =
            SchemaDefinition::new().with_type("Counter", TypeDefinition::new().index("k").field("x"));
        cache.remember_definition("app", &definition);

        let ty = TypeKey::new("app", "Counter");
        let mapping = FieldMapping::from([
            (ty.field("k"), FieldId::new(1)),
            (ty.field("x"), FieldId::new(2)),
            (ty.field(EXISTS_FIELD), FieldId::new(3)),
        ]);
        cache.absorb_mapping("app", &mapping);
        assert!(cache.has_mapping_for("app", &definition));

        Fixture {
            cache,
            ty,
            k: FieldId::new(1),
            x: FieldId::new(2),
            exists: FieldId::new(3),
        }
    }

    fn v(b: u8) -> Option<Bytes> {
        Some(Bytes::from(vec![b]))
    }

    fn created(f: &Fixture, oid: ObjectId, k: u8) -> Writes {
        Writes::from([
            (ObjectFieldId::index(oid, f.exists), v(1)),
            (ObjectFieldId::value(oid, f.exists), v(1)),
            (ObjectFieldId::value(oid, f.k), v(k)),
            (ObjectFieldId::index(oid, f.k), v(k)),
        ])
    }

    #[test]
    fn test_snapshot_reads() {
        let mut f = fixture();
        let oid = ObjectId::new(7);
        let writes = created(&f, oid, 5);
        f.cache.apply_transaction(&writes, Tid::new(3));
        f.cache
            .apply_transaction(&Writes::from([(ObjectFieldId::value(oid, f.x), v(9))]), Tid::new(5));

        let x = ObjectFieldId::value(oid, f.x);
        assert_eq!(f.cache.value_at(&x, Tid::new(4)), None);
        assert_eq!(f.cache.value_at(&x, Tid::new(5)), Some(v(9)));
        assert!(!f.cache.exists_at(&f.ty, oid, Tid::new(2)));
        assert!(f.cache.exists_at(&f.ty, oid, Tid::new(3)));
        assert_eq!(f.cache.tid(), Tid::new(5));
    }

    #[test]
    fn test_index_membership_follows_slot() {
        let mut f = fixture();
        let oid = ObjectId::new(7);
        f.cache.apply_transaction(&created(&f, oid, 5), Tid::new(1));
        f.cache
            .apply_transaction(&Writes::from([(ObjectFieldId::index(oid, f.k), v(6))]), Tid::new(2));

        let at5 = IndexId::new(f.k, vec![5]);
        let at6 = IndexId::new(f.k, vec![6]);
        assert_eq!(f.cache.members_at(&at5, Tid::new(1)), vec![oid]);
        assert!(f.cache.members_at(&at5, Tid::new(2)).is_empty());
        assert_eq!(f.cache.members_at(&at6, Tid::new(2)), vec![oid]);

        // delete
        f.cache.apply_transaction(
            &Writes::from([
                (ObjectFieldId::index(oid, f.k), None),
                (ObjectFieldId::index(oid, f.exists), None),
            ]),
            Tid::new(3),
        );
        assert!(f.cache.members_at(&at6, Tid::new(3)).is_empty());
        assert_eq!(f.cache.members_at(&at6, Tid::new(2)), vec![oid]);
        assert!(!f.cache.exists_at(&f.ty, oid, Tid::new(3)));
    }

    #[test]
    fn test_streamed_values_do_not_overwrite_newer_writes() {
        let mut f = fixture();
        let key: SubscriptionKey = (f.ty.clone(), None);
        let oid = ObjectId::new(7);
        let x = ObjectFieldId::value(oid, f.x);

        f.cache.begin_subscription(key.clone(), false);
        f.cache.buffer_data(&key, Writes::from([(x, v(1))]), created(&f, oid, 5), None);
        // a transaction lands while the subscription is still streaming
        f.cache.apply_transaction(&Writes::from([(x, v(2))]), Tid::new(4));
        f.cache.complete_subscription(&key, Tid::new(4));

        assert_eq!(f.cache.value_at(&x, Tid::new(4)), Some(v(2)));
        assert!(f.cache.exists_at(&f.ty, oid, Tid::new(4)));
        assert!(f.cache.covers(&IndexId::new(f.k, vec![5])));
        assert_eq!(f.cache.completions(&key), 1);
    }

    #[test]
    fn test_index_subscription_covers_only_its_value() {
        let mut f = fixture();
        let key: SubscriptionKey = (f.ty.clone(), Some(("k".into(), Bytes::from(vec![5]))));
        f.cache.begin_subscription(key.clone(), false);
        f.cache.complete_subscription(&key, Tid::new(1));

        assert!(f.cache.covers(&IndexId::new(f.k, vec![5])));
        assert!(!f.cache.covers(&IndexId::new(f.k, vec![6])));
        assert!(!f.cache.is_type_subscribed(&f.ty));
    }

    #[test]
    fn test_lazy_objects_load_once() {
        let mut f = fixture();
        let key: SubscriptionKey = (f.ty.clone(), None);
        let oid = ObjectId::new(7);
        let x = ObjectFieldId::value(oid, f.x);

        f.cache.begin_subscription(key.clone(), true);
        let index_values: Writes = created(&f, oid, 5)
            .into_iter()
            .filter(|(k, _)| k.is_index_value)
            .collect();
        f.cache.buffer_lazy(&key, vec![oid], index_values);
        f.cache.complete_subscription(&key, Tid::new(2));

        assert!(f.cache.exists_at(&f.ty, oid, Tid::new(2)));
        assert_eq!(f.cache.needs_load(&x, Tid::new(2)), Some(f.ty.clone()));

        // prior then transaction
        f.cache.apply_priors(Writes::from([(x, v(1))]));
        f.cache.apply_transaction(&Writes::from([(x, v(2))]), Tid::new(3));
        assert_eq!(f.cache.value_at(&x, Tid::new(2)), Some(v(1)));
        assert_eq!(f.cache.value_at(&x, Tid::new(3)), Some(v(2)));

        let k = ObjectFieldId::value(oid, f.k);
        assert_eq!(f.cache.needs_load(&k, Tid::new(3)), Some(f.ty.clone()));
        f.cache.apply_lazy_load(oid, Writes::from([(k, v(5)), (x, v(2))]));
        assert!(f.cache.is_loaded(oid));
        assert_eq!(f.cache.needs_load(&k, Tid::new(3)), None);
        assert_eq!(f.cache.value_at(&k, Tid::new(3)), Some(v(5)));
        assert_eq!(f.cache.value_at(&x, Tid::new(2)), Some(v(1)));
    }

    #[test]
    fn test_gc_keeps_what_open_views_read() {
        let mut f = fixture();
        let oid = ObjectId::new(7);
        let x = ObjectFieldId::value(oid, f.x);
        for tid in 1..=4u8 {
            f.cache
                .apply_transaction(&Writes::from([(x, v(tid))]), Tid::new(u64::from(tid)));
        }

        f.cache.open_view(Tid::new(2));
        assert_eq!(f.cache.collect_garbage(), 1);
        assert_eq!(f.cache.value_at(&x, Tid::new(2)), Some(v(2)));
        assert_eq!(f.cache.gc_floor(), Tid::new(2));

        f.cache.close_view(Tid::new(2));
        assert_eq!(f.cache.open_view_count(), 0);
        assert_eq!(f.cache.collect_garbage(), 2);
        assert_eq!(f.cache.value_at(&x, Tid::new(4)), Some(v(4)));
        assert_eq!(f.cache.value_at(&x, Tid::new(3)), None);
    }

    #[test]
    fn test_history_record_in_order() {
        let mut history = History::default();
        history.record(Tid::new(5), 'b');
        history.record(Tid::new(2), 'a');
        history.record(Tid::new(5), 'c');

        assert_eq!(history.at(Tid::new(1)), None);
        assert_eq!(history.at(Tid::new(3)), Some(&'a'));
        assert_eq!(history.at(Tid::new(9)), Some(&'c'));
        assert_eq!(history.entries.len(), 2);
    }
}
