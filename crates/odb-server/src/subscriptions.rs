//! Subscription registry - who receives which part of a transaction
//!
//! A channel sees an update when it subscribes to the written field's type,
//! subscribes to the touched index, or holds the object in scope. Scope
//! only grows: objects revealed by an index subscription, and objects a
//! channel writes, stay visible to it for the channel's lifetime.

use std::collections::{BTreeSet, HashMap, HashSet};

use odb_core::{
    parse_identity, Catalog, ChannelId, IndexId, ObjectFieldId, ObjectId, SetDeltas, TypeKey, Writes,
    IDENTITY_FIELD,
};
use odb_wire::IndexKey;

/// What a subscription key selects within its type
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubscriptionScope {
    Type,
    Index(IndexId),
    /// One object, whether or not it exists yet
    Object(ObjectId),
}

impl SubscriptionScope {
    /// `None` when the key names neither an indexed field nor an identity
    pub fn resolve(catalog: &Catalog, ty: &TypeKey, key: &IndexKey) -> Option<Self> {
        let Some((fieldname, value)) = key else {
            return Some(SubscriptionScope::Type);
        };
        if fieldname == IDENTITY_FIELD {
            return parse_identity(value).map(SubscriptionScope::Object);
        }
        catalog
            .field_id(&ty.field(fieldname.as_str()))
            .filter(|f| catalog.is_indexed(*f))
            .map(|f| SubscriptionScope::Index(IndexId::new(f, value.clone())))
    }
}

/// What one channel subscribed to
#[derive(Debug, Default)]
struct Interest {
    full_types: HashSet<TypeKey>,
    lazy_types: HashSet<TypeKey>,
    /// Types with any lazy subscription; writes to them carry priors
    prior_types: HashSet<TypeKey>,
    indices: HashSet<IndexId>,
    objects: HashSet<ObjectId>,
}

impl Interest {
    fn sees_type(&self, ty: Option<&TypeKey>) -> bool {
        ty.map_or(false, |t| self.full_types.contains(t) || self.lazy_types.contains(t))
    }
}

/// One channel's share of a committed transaction
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Fanout {
    pub channel: ChannelId,
    pub writes: Writes,
    pub set_adds: SetDeltas,
    pub set_removes: SetDeltas,
    /// Index subscriptions that gained members, with the newly revealed objects
    pub increases: Vec<(IndexId, Vec<ObjectId>)>,
    /// Written keys whose type the channel follows lazily
    pub prior_keys: Vec<ObjectFieldId>,
}

impl Fanout {
    /// Objects entering the channel's scope with this transaction
    pub fn revealed(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.increases.iter().flat_map(|(_, oids)| oids.iter().copied())
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    interests: HashMap<ChannelId, Interest>,
    type_subscribers: HashMap<TypeKey, HashSet<ChannelId>>,
    index_subscribers: HashMap<IndexId, HashSet<ChannelId>>,
    object_scope: HashMap<ObjectId, HashSet<ChannelId>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe_type(&mut self, channel: ChannelId, ty: TypeKey, lazy: bool) {
        let interest = self.interests.entry(channel).or_default();
        if lazy {
            interest.prior_types.insert(ty.clone());
            interest.lazy_types.insert(ty.clone());
        } else {
            interest.full_types.insert(ty.clone());
        }
        self.type_subscribers.entry(ty).or_default().insert(channel);
    }

    /// Register an index subscription; `members` enter scope immediately
    pub fn subscribe_index(
        &mut self,
        channel: ChannelId,
        ty: TypeKey,
        index: IndexId,
        lazy: bool,
        members: impl IntoIterator<Item = ObjectId>,
    ) {
        let interest = self.interests.entry(channel).or_default();
        if lazy {
            interest.prior_types.insert(ty);
        }
        interest.indices.insert(index.clone());
        self.index_subscribers.entry(index).or_default().insert(channel);
        self.add_to_scope(channel, members);
    }

    /// Register a subscription of any scope; `members` enter scope immediately
    pub fn subscribe(
        &mut self,
        channel: ChannelId,
        ty: TypeKey,
        scope: SubscriptionScope,
        lazy: bool,
        members: impl IntoIterator<Item = ObjectId>,
    ) {
        match scope {
            SubscriptionScope::Type => self.subscribe_type(channel, ty, lazy),
            SubscriptionScope::Index(index) => self.subscribe_index(channel, ty, index, lazy, members),
            SubscriptionScope::Object(_) => {
                if lazy {
                    self.interests.entry(channel).or_default().prior_types.insert(ty);
                }
                self.add_to_scope(channel, members);
            }
        }
    }

    /// Returns the objects that were not already in scope
    pub fn add_to_scope(
        &mut self,
        channel: ChannelId,
        objects: impl IntoIterator<Item = ObjectId>,
    ) -> Vec<ObjectId> {
        let interest = self.interests.entry(channel).or_default();
        let mut added = Vec::new();
        for oid in objects {
            if interest.objects.insert(oid) {
                self.object_scope.entry(oid).or_default().insert(channel);
                added.push(oid);
            }
        }
        added
    }

    pub fn remove_channel(&mut self, channel: ChannelId) {
        let Some(interest) = self.interests.remove(&channel) else {
            return;
        };
        for ty in interest.full_types.iter().chain(interest.lazy_types.iter()) {
            remove_from(&mut self.type_subscribers, ty, channel);
        }
        for index in &interest.indices {
            remove_from(&mut self.index_subscribers, index, channel);
        }
        for oid in &interest.objects {
            remove_from(&mut self.object_scope, oid, channel);
        }
    }

    pub fn sees_type(&self, channel: ChannelId, ty: &TypeKey) -> bool {
        self.interests
            .get(&channel)
            .map_or(false, |i| i.sees_type(Some(ty)))
    }

    pub fn is_lazy(&self, channel: ChannelId, ty: &TypeKey) -> bool {
        self.interests
            .get(&channel)
            .map_or(false, |i| i.lazy_types.contains(ty) && !i.full_types.contains(ty))
    }

    pub fn in_scope(&self, channel: ChannelId, oid: ObjectId) -> bool {
        self.interests
            .get(&channel)
            .map_or(false, |i| i.objects.contains(&oid))
    }

    pub fn subscribes_index(&self, channel: ChannelId, index: &IndexId) -> bool {
        self.interests
            .get(&channel)
            .map_or(false, |i| i.indices.contains(index))
    }

    /// Whether any channel needs priors for writes to `ty`
    pub fn has_lazy_interest(&self, ty: &TypeKey) -> bool {
        self.interests.values().any(|i| i.prior_types.contains(ty))
    }

    pub fn scope_len(&self, channel: ChannelId) -> usize {
        self.interests.get(&channel).map_or(0, |i| i.objects.len())
    }

    /// Split a committed transaction into per-channel deliveries, in channel
    /// order. The committer always receives everything it wrote. Scope grows
    /// as a side effect.
    pub fn route(
        &mut self,
        catalog: &Catalog,
        committer: Option<ChannelId>,
        writes: &Writes,
        set_adds: &SetDeltas,
        set_removes: &SetDeltas,
    ) -> Vec<Fanout> {
        let mut candidates: BTreeSet<ChannelId> = committer.into_iter().collect();
        for key in writes.keys() {
            if let Some(ty) = catalog.type_of(key.field) {
                extend_from(&mut candidates, &self.type_subscribers, &ty);
            }
            extend_from(&mut candidates, &self.object_scope, &key.object);
        }
        for (index, members) in set_adds.iter().chain(set_removes.iter()) {
            if let Some(ty) = catalog.type_of(index.field) {
                extend_from(&mut candidates, &self.type_subscribers, &ty);
            }
            extend_from(&mut candidates, &self.index_subscribers, index);
            for oid in members {
                extend_from(&mut candidates, &self.object_scope, oid);
            }
        }

        let mut fanouts = Vec::new();
        for channel in candidates {
            let is_committer = committer == Some(channel);

            let mut increases = Vec::new();
            if let Some(interest) = self.interests.get(&channel) {
                for (index, members) in set_adds {
                    let ty = catalog.type_of(index.field);
                    if !interest.indices.contains(index) || interest.sees_type(ty.as_ref()) {
                        continue;
                    }
                    let fresh: Vec<ObjectId> = members
                        .iter()
                        .filter(|oid| !interest.objects.contains(oid))
                        .copied()
                        .collect();
                    if !fresh.is_empty() {
                        increases.push((index.clone(), fresh));
                    }
                }
            }
            for (_, fresh) in &increases {
                self.add_to_scope(channel, fresh.iter().copied());
            }
            if is_committer {
                self.add_to_scope(channel, writes.keys().map(|k| k.object));
            }

            let Some(interest) = self.interests.get(&channel) else {
                continue;
            };

            let mut fanout = Fanout {
                channel,
                increases,
                ..Default::default()
            };
            for (key, value) in writes {
                let ty = catalog.type_of(key.field);
                if is_committer || interest.sees_type(ty.as_ref()) || interest.objects.contains(&key.object) {
                    fanout.writes.insert(*key, value.clone());
                    if ty.map_or(false, |t| interest.prior_types.contains(&t)) {
                        fanout.prior_keys.push(*key);
                    }
                }
            }
            filter_deltas(catalog, interest, is_committer, set_adds, &mut fanout.set_adds);
            filter_deltas(catalog, interest, is_committer, set_removes, &mut fanout.set_removes);

            let relevant = is_committer
                || !fanout.writes.is_empty()
                || !fanout.set_adds.is_empty()
                || !fanout.set_removes.is_empty()
                || !fanout.increases.is_empty();
            if relevant {
                fanout.prior_keys.sort();
                fanouts.push(fanout);
            }
        }
        fanouts
    }
}

fn filter_deltas(
    catalog: &Catalog,
    interest: &Interest,
    is_committer: bool,
    deltas: &SetDeltas,
    out: &mut SetDeltas,
) {
    for (index, members) in deltas {
        let ty = catalog.type_of(index.field);
        if is_committer || interest.sees_type(ty.as_ref()) || interest.indices.contains(index) {
            out.insert(index.clone(), members.clone());
            continue;
        }
        let visible: Vec<ObjectId> = members
            .iter()
            .filter(|oid| interest.objects.contains(oid))
            .copied()
            .collect();
        if !visible.is_empty() {
            out.insert(index.clone(), visible);
        }
    }
}

fn extend_from<K: Eq + std::hash::Hash>(
    out: &mut BTreeSet<ChannelId>,
    map: &HashMap<K, HashSet<ChannelId>>,
    key: &K,
) {
    if let Some(channels) = map.get(key) {
        out.extend(channels.iter().copied());
    }
}

fn remove_from<K: Eq + std::hash::Hash + Clone>(
    map: &mut HashMap<K, HashSet<ChannelId>>,
    key: &K,
    channel: ChannelId,
) {
    if let Some(channels) = map.get_mut(key) {
        channels.remove(&channel);
        if channels.is_empty() {
            map.remove(key);
        }
    }
}
