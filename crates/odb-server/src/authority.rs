//! Transaction authority
//!
//! Owns the tid counter, the version table, the catalog and every attached
//! connection. All methods run on the actor thread; nothing here locks.
//!
//! Commit path:
//! 1. `TransactionData` chunks accumulate per guid
//! 2. `CompleteTransaction` validates reads against the version table
//! 3. Priors are read for lazy subscribers, then writes, set deltas and the
//!    new tid go to the store in one `set_several`
//! 4. Touched keys are stamped and the transaction fans out
//! 5. The committer gets `TransactionResult` after its own `Transaction`

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use odb_core::{
    core_schema, BadKey, Catalog, ChannelId, FieldId, Guid, IndexId, ObjectFieldId, ObjectId,
    OdbError, OdbResult, SchemaDefinition, SetDeltas, Tid, TypeKey, Writes, CONNECTION_TYPE,
    CORE_SCHEMA, EXISTS_VALUE,
};
use odb_store::{plan_set_deltas, Persistence, StoreKey};
use odb_transport::DownstreamChannel;
use odb_wire::{from_bytes, to_bytes, ClientToServer, IndexKey, ServerToClient, WireMessage};

use crate::{
    AuthorityConfig, Fanout, LoggingTransactionWatcher, StoredCatalog, SubscriptionRegistry,
    SubscriptionScope, TransactionEvent, TransactionWatcher, VersionTable,
};

const TID_KEY: &str = "tid";
const IDENTITY_ROOT_KEY: &str = "identity_root";
const AUTHORITY_COUNTER_KEY: &str = "authority_counter";

/// Transaction chunks received so far under one guid
#[derive(Debug, Default)]
struct PendingTransaction {
    writes: Writes,
    set_adds: SetDeltas,
    set_removes: SetDeltas,
    key_versions: Vec<ObjectFieldId>,
    index_versions: Vec<IndexId>,
}

impl PendingTransaction {
    fn merge(
        &mut self,
        writes: Writes,
        set_adds: SetDeltas,
        set_removes: SetDeltas,
        key_versions: Vec<ObjectFieldId>,
        index_versions: Vec<IndexId>,
    ) {
        self.writes.extend(writes);
        for (index, oids) in set_adds {
            self.set_adds.entry(index).or_default().extend(oids);
        }
        for (index, oids) in set_removes {
            self.set_removes.entry(index).or_default().extend(oids);
        }
        self.key_versions.extend(key_versions);
        self.index_versions.extend(index_versions);
    }
}

struct Connection {
    channel: Arc<dyn DownstreamChannel>,
    /// Connection record; `None` until authenticated
    identity: Option<ObjectId>,
    last_seen: Instant,
    pending: HashMap<Guid, PendingTransaction>,
    dependents: HashSet<ObjectId>,
    /// Subscriptions still streaming
    streaming: usize,
    deferred_flushes: Vec<Guid>,
    /// Lowest tid the peer may still read or commit at; `None` until
    /// authenticated
    view_horizon: Option<Tid>,
}

/// Subscription data still to be sent
struct SubscriptionStream {
    channel: ChannelId,
    ty: TypeKey,
    key: IndexKey,
    lazy: bool,
    remaining: VecDeque<ObjectId>,
}

pub struct Authority {
    config: AuthorityConfig,
    store: Arc<dyn Persistence>,
    catalog: Catalog,
    versions: VersionTable,
    registry: SubscriptionRegistry,
    connections: HashMap<ChannelId, Connection>,
    streams: VecDeque<SubscriptionStream>,
    current_tid: Tid,
    next_identity_root: u32,
    next_record: u32,
    connection_type: TypeKey,
    watcher: Option<Box<dyn TransactionWatcher>>,
}

fn read_counter(store: &dyn Persistence, name: &str) -> OdbResult<Option<u64>> {
    store
        .get(&StoreKey::meta(name))?
        .map(from_bytes::<u64>)
        .transpose()
}

fn narrow(value: u64, what: &str) -> OdbResult<u32> {
    u32::try_from(value).map_err(|_| OdbError::Store(format!("{} counter overflow", what)))
}

impl Authority {
    /// Open against `store`, recovering counters and schemas
    pub fn open(config: AuthorityConfig, store: Arc<dyn Persistence>) -> OdbResult<Self> {
        let mut catalog = Catalog::load(store.as_ref())?;
        let (_, writes) = catalog.define(CORE_SCHEMA, &core_schema());
        if !writes.is_empty() {
            store.set_several(writes, &SetDeltas::new(), &SetDeltas::new())?;
        }

        let current_tid = Tid::new(read_counter(store.as_ref(), TID_KEY)?.unwrap_or(0));
        let next_identity_root =
            narrow(read_counter(store.as_ref(), IDENTITY_ROOT_KEY)?.unwrap_or(1), "identity root")?;
        let next_record =
            narrow(read_counter(store.as_ref(), AUTHORITY_COUNTER_KEY)?.unwrap_or(1), "record")?;

        tracing::info!(
            "authority open at tid {} (next identity root {})",
            current_tid,
            next_identity_root
        );

        let watcher: Option<Box<dyn TransactionWatcher>> = match &config.transaction_log_dir {
            Some(dir) => Some(Box::new(LoggingTransactionWatcher::create(dir)?)),
            None => None,
        };

        Ok(Authority {
            config,
            store,
            catalog,
            // history before a restart is unknown
            versions: VersionTable::with_horizon(current_tid),
            registry: SubscriptionRegistry::new(),
            connections: HashMap::new(),
            streams: VecDeque::new(),
            current_tid,
            next_identity_root,
            next_record,
            connection_type: TypeKey::new(CORE_SCHEMA, CONNECTION_TYPE),
            watcher,
        })
    }

    /// Report every finished transaction to `watcher`, replacing any
    /// configured one
    pub fn set_watcher(&mut self, watcher: Box<dyn TransactionWatcher>) {
        self.watcher = Some(watcher);
    }

    pub fn config(&self) -> &AuthorityConfig {
        &self.config
    }

    pub fn current_tid(&self) -> Tid {
        self.current_tid
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn version_horizon(&self) -> Tid {
        self.versions.horizon()
    }

    pub fn attach(&mut self, id: ChannelId, channel: Arc<dyn DownstreamChannel>) {
        tracing::debug!("channel {} attached", id);
        self.connections.insert(
            id,
            Connection {
                channel,
                identity: None,
                last_seen: Instant::now(),
                pending: HashMap::new(),
                dependents: HashSet::new(),
                streaming: 0,
                deferred_flushes: Vec::new(),
                view_horizon: None,
            },
        );
    }

    /// The channel closed underneath us
    pub fn detach(&mut self, id: ChannelId) -> OdbResult<()> {
        self.drop_connection(id, "channel closed")
    }

    /// Close every channel without touching the store
    pub fn shutdown(&mut self) {
        for (_, conn) in self.connections.drain() {
            conn.channel.close();
        }
        self.streams.clear();
        self.flush_watcher();
    }

    /// Handle one message. An error means the store failed and the
    /// authority must stop.
    pub fn handle_message(&mut self, id: ChannelId, message: ClientToServer) -> OdbResult<()> {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        conn.last_seen = Instant::now();

        if conn.identity.is_none() {
            return match message {
                ClientToServer::Heartbeat => Ok(()),
                ClientToServer::Authenticate { token } => self.authenticate(id, token),
                other => {
                    tracing::warn!("channel {} sent {} before authenticating", id, other.kind());
                    self.drop_connection(id, "unauthenticated message")
                }
            };
        }

        match message {
            ClientToServer::Heartbeat => Ok(()),
            ClientToServer::Authenticate { .. } => {
                tracing::debug!("channel {} authenticated twice; ignored", id);
                Ok(())
            }
            ClientToServer::DefineSchema { name, definition } => {
                self.define_schema(id, name, definition)
            }
            ClientToServer::Subscribe {
                schema,
                typename,
                fieldname_and_value,
                is_lazy,
            } => self.subscribe(id, TypeKey::new(schema, typename), fieldname_and_value, is_lazy),
            ClientToServer::SubscribeNone { schema, typename } => {
                self.send(
                    id,
                    ServerToClient::SubscriptionComplete {
                        schema,
                        typename,
                        fieldname_and_value: None,
                        tid: self.current_tid,
                    },
                );
                Ok(())
            }
            ClientToServer::TransactionData {
                writes,
                set_adds,
                set_removes,
                key_versions,
                index_versions,
                transaction_guid,
            } => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.pending.entry(transaction_guid).or_default().merge(
                        writes,
                        set_adds,
                        set_removes,
                        key_versions,
                        index_versions,
                    );
                }
                Ok(())
            }
            ClientToServer::CompleteTransaction {
                as_of_version,
                transaction_guid,
            } => self.complete_transaction(id, as_of_version, transaction_guid),
            ClientToServer::LoadLazyObject {
                schema,
                typename,
                identity,
            } => self.load_lazy(id, TypeKey::new(schema, typename), identity),
            ClientToServer::Flush { guid } => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    if conn.streaming > 0 {
                        conn.deferred_flushes.push(guid);
                    } else {
                        conn.channel.send_message(ServerToClient::FlushResponse { guid });
                    }
                }
                Ok(())
            }
            ClientToServer::RequestDependentConnectionId { parent, guid } => {
                self.create_dependent(id, parent, guid)
            }
            ClientToServer::DropDependentConnectionId { conn_identity } => {
                let owned = self
                    .connections
                    .get_mut(&id)
                    .map_or(false, |c| c.dependents.remove(&conn_identity));
                if owned {
                    tracing::debug!("dropping dependent connection {}", conn_identity);
                    self.delete_connection_records(&[conn_identity])?;
                }
                Ok(())
            }
            ClientToServer::ViewHorizon { tid } => {
                let current = self.current_tid;
                if let Some(conn) = self.connections.get_mut(&id) {
                    // never moves back
                    let reported = tid.min(current);
                    conn.view_horizon = Some(conn.view_horizon.map_or(reported, |h| h.max(reported)));
                }
                Ok(())
            }
        }
    }

    fn send(&self, id: ChannelId, message: ServerToClient) {
        if let Some(conn) = self.connections.get(&id) {
            conn.channel.send_message(message);
        }
    }

    fn authenticate(&mut self, id: ChannelId, token: String) -> OdbResult<()> {
        if let Some(expected) = &self.config.auth_token {
            if &token != expected {
                tracing::warn!("channel {} presented a bad token", id);
                return self.drop_connection(id, "authentication failed");
            }
        }

        let identity_root = self.allocate_identity_root()?;
        let identity = self.create_connection_record()?;
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.identity = Some(identity);
            conn.view_horizon = Some(self.current_tid);
        }
        tracing::info!("channel {} authenticated as {}", id, identity);

        self.send(
            id,
            ServerToClient::Initialize {
                transaction_num: self.current_tid,
                conn_identity: identity,
                identity_root,
            },
        );
        Ok(())
    }

    fn allocate_identity_root(&mut self) -> OdbResult<u32> {
        let root = self.next_identity_root;
        self.next_identity_root = root
            .checked_add(1)
            .ok_or_else(|| OdbError::Store("identity roots exhausted".into()))?;
        self.store.set(
            StoreKey::meta(IDENTITY_ROOT_KEY),
            Some(to_bytes(&u64::from(self.next_identity_root))),
        )?;
        Ok(root)
    }

    fn connection_exists_field(&self) -> OdbResult<FieldId> {
        self.catalog
            .exists_field(&self.connection_type)
            .ok_or_else(|| OdbError::InvariantViolation("core schema missing".into()))
    }

    fn create_connection_record(&mut self) -> OdbResult<ObjectId> {
        let exists = self.connection_exists_field()?;
        let oid = ObjectId::from_root(0, self.next_record);
        self.next_record += 1;

        let marker = Bytes::from_static(EXISTS_VALUE);
        let writes = Writes::from([
            (ObjectFieldId::value(oid, exists), Some(marker.clone())),
            (ObjectFieldId::index(oid, exists), Some(marker)),
        ]);
        let adds = SetDeltas::from([(IndexId::exists(exists), vec![oid])]);
        let meta = vec![(
            StoreKey::meta(AUTHORITY_COUNTER_KEY),
            Some(to_bytes(&u64::from(self.next_record))),
        )];
        let txn = PendingTransaction {
            writes,
            set_adds: adds,
            ..Default::default()
        };
        self.apply(None, txn, meta, None)?;
        Ok(oid)
    }

    fn delete_connection_records(&mut self, oids: &[ObjectId]) -> OdbResult<()> {
        if oids.is_empty() {
            return Ok(());
        }
        let exists = self.connection_exists_field()?;
        let members = self.store.get_set_members(&IndexId::exists(exists))?;
        let live: Vec<ObjectId> = oids.iter().copied().filter(|o| members.contains(o)).collect();
        if live.is_empty() {
            return Ok(());
        }

        let mut writes = Writes::new();
        for &oid in &live {
            writes.insert(ObjectFieldId::value(oid, exists), None);
            writes.insert(ObjectFieldId::index(oid, exists), None);
        }
        let txn = PendingTransaction {
            writes,
            set_removes: SetDeltas::from([(IndexId::exists(exists), live)]),
            ..Default::default()
        };
        self.apply(None, txn, Vec::new(), None)?;
        Ok(())
    }

    fn create_dependent(&mut self, id: ChannelId, parent: ObjectId, guid: Guid) -> OdbResult<()> {
        let owner = self.connections.get(&id).and_then(|c| c.identity);
        if owner != Some(parent) {
            tracing::warn!(
                "channel {} asked for a dependent of {} it does not own",
                id,
                parent
            );
        }

        let identity_root = self.allocate_identity_root()?;
        let conn_identity = self.create_connection_record()?;
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.dependents.insert(conn_identity);
        }
        self.send(
            id,
            ServerToClient::DependentConnectionId {
                guid,
                conn_identity,
                identity_root,
            },
        );
        Ok(())
    }

    fn drop_connection(&mut self, id: ChannelId, reason: &str) -> OdbResult<()> {
        let Some(conn) = self.connections.remove(&id) else {
            return Ok(());
        };
        conn.channel.close();
        self.registry.remove_channel(id);
        self.streams.retain(|s| s.channel != id);

        match conn.identity {
            Some(identity) => {
                tracing::info!("connection {} ({}) dropped: {}", id, identity, reason);
                let mut records: Vec<ObjectId> = conn.dependents.into_iter().collect();
                records.push(identity);
                records.sort();
                self.delete_connection_records(&records)
            }
            None => {
                tracing::debug!("unauthenticated channel {} dropped: {}", id, reason);
                Ok(())
            }
        }
    }

    fn define_schema(&mut self, id: ChannelId, name: String, definition: SchemaDefinition) -> OdbResult<()> {
        let (mapping, writes) = self.catalog.define(&name, &definition);
        if !writes.is_empty() {
            self.store
                .set_several(writes, &SetDeltas::new(), &SetDeltas::new())?;
        }
        self.send(
            id,
            ServerToClient::SchemaMapping {
                schema: name,
                mapping,
            },
        );
        Ok(())
    }

    fn complete(&self, id: ChannelId, ty: &TypeKey, key: IndexKey) {
        self.send(
            id,
            ServerToClient::SubscriptionComplete {
                schema: ty.schema.clone(),
                typename: ty.typename.clone(),
                fieldname_and_value: key,
                tid: self.current_tid,
            },
        );
    }

    fn subscribe(&mut self, id: ChannelId, ty: TypeKey, key: IndexKey, lazy: bool) -> OdbResult<()> {
        if !self.catalog.has_type(&ty) {
            tracing::warn!("channel {} subscribed to undefined type {}", id, ty);
            self.complete(id, &ty, key);
            return Ok(());
        }

        let Some(scope) = SubscriptionScope::resolve(&self.catalog, &ty, &key) else {
            tracing::warn!("channel {} subscribed to non-index key {:?} of {}", id, key, ty);
            self.complete(id, &ty, key);
            return Ok(());
        };
        let mut members: Vec<ObjectId> = match &scope {
            SubscriptionScope::Type => {
                let exists = self
                    .catalog
                    .exists_field(&ty)
                    .ok_or_else(|| OdbError::InvariantViolation(format!("{} has no exists field", ty)))?;
                self.store.get_set_members(&IndexId::exists(exists))?.into_iter().collect()
            }
            SubscriptionScope::Index(index) => self.store.get_set_members(index)?.into_iter().collect(),
            SubscriptionScope::Object(oid) => vec![*oid],
        };
        members.sort();
        tracing::debug!(
            "channel {} subscribed to {} {:?} ({} objects, lazy={})",
            id,
            ty,
            scope,
            members.len(),
            lazy
        );
        self.registry
            .subscribe(id, ty.clone(), scope, lazy, members.iter().copied());

        if let Some(conn) = self.connections.get_mut(&id) {
            conn.streaming += 1;
        }
        self.streams.push_back(SubscriptionStream {
            channel: id,
            ty,
            key,
            lazy,
            remaining: members.into(),
        });
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        !self.streams.is_empty()
    }

    /// Send the next chunk of the oldest pending subscription
    pub fn stream_step(&mut self) -> OdbResult<()> {
        let Some(mut stream) = self.streams.pop_front() else {
            return Ok(());
        };
        if !self.connections.contains_key(&stream.channel) {
            return Ok(());
        }

        let take = self.config.subscription_chunk_size.max(1).min(stream.remaining.len());
        let chunk: Vec<ObjectId> = stream.remaining.drain(..take).collect();
        if !chunk.is_empty() {
            let (values, index_values) = self.object_values(&stream.ty, &chunk, !stream.lazy)?;
            let message = if stream.lazy {
                ServerToClient::LazySubscriptionData {
                    schema: stream.ty.schema.clone(),
                    typename: stream.ty.typename.clone(),
                    fieldname_and_value: stream.key.clone(),
                    identities: chunk,
                    index_values,
                }
            } else {
                let identities = stream.key.is_some().then_some(chunk);
                ServerToClient::SubscriptionData {
                    schema: stream.ty.schema.clone(),
                    typename: stream.ty.typename.clone(),
                    fieldname_and_value: stream.key.clone(),
                    values,
                    index_values,
                    identities,
                }
            };
            self.send(stream.channel, message);
        }

        if !stream.remaining.is_empty() {
            self.streams.push_back(stream);
            return Ok(());
        }

        self.complete(stream.channel, &stream.ty, stream.key);
        if let Some(conn) = self.connections.get_mut(&stream.channel) {
            conn.streaming = conn.streaming.saturating_sub(1);
            if conn.streaming == 0 {
                for guid in conn.deferred_flushes.drain(..) {
                    conn.channel.send_message(ServerToClient::FlushResponse { guid });
                }
            }
        }
        Ok(())
    }

    /// Current slots of `oids`: (value slots, index slots)
    fn object_values(&self, ty: &TypeKey, oids: &[ObjectId], with_values: bool) -> OdbResult<(Writes, Writes)> {
        let fields = self.catalog.type_fields(ty);
        let mut keys = Vec::new();
        for &oid in oids {
            for field in &fields {
                if with_values {
                    keys.push(ObjectFieldId::value(oid, field.id));
                }
                if field.indexed {
                    keys.push(ObjectFieldId::index(oid, field.id));
                }
            }
        }

        let store_keys: Vec<StoreKey> = keys.iter().map(|k| StoreKey::Value(*k)).collect();
        let found = self.store.get_several(&store_keys)?;

        let mut values = Writes::new();
        let mut index_values = Writes::new();
        for (key, value) in keys.into_iter().zip(found) {
            if key.is_index_value {
                index_values.insert(key, value);
            } else {
                values.insert(key, value);
            }
        }
        Ok((values, index_values))
    }

    fn load_lazy(&mut self, id: ChannelId, ty: TypeKey, identity: ObjectId) -> OdbResult<()> {
        let (mut values, index_values) = self.object_values(&ty, &[identity], true)?;
        values.extend(index_values);
        self.send(id, ServerToClient::LazyLoadResponse { identity, values });
        Ok(())
    }

    fn complete_transaction(&mut self, id: ChannelId, as_of: Tid, guid: Guid) -> OdbResult<()> {
        let txn = self
            .connections
            .get_mut(&id)
            .and_then(|c| c.pending.remove(&guid))
            .unwrap_or_default();

        if let Err(bad_key) = self.validate(&txn, as_of)? {
            tracing::debug!("transaction {} from {} rejected: {:?}", guid, id, bad_key);
            self.send(
                id,
                ServerToClient::TransactionResult {
                    transaction_guid: guid,
                    success: false,
                    bad_key: Some(bad_key.clone()),
                },
            );
            if let Some(watcher) = self.watcher.as_mut() {
                watcher.on_transaction(&TransactionEvent {
                    connection: self.connections.get(&id).and_then(|c| c.identity),
                    transaction_guid: Some(guid),
                    as_of: Some(as_of),
                    transaction_id: None,
                    writes: txn.writes,
                    set_adds: txn.set_adds,
                    set_removes: txn.set_removes,
                    key_versions: txn.key_versions,
                    index_versions: txn.index_versions,
                    bad_key: Some(bad_key),
                    sent_to: Vec::new(),
                });
            }
            return Ok(());
        }

        let tid = self.apply(Some(id), txn, Vec::new(), Some((guid, as_of)))?;
        tracing::trace!("transaction {} from {} committed at {}", guid, id, tid);
        self.send(
            id,
            ServerToClient::TransactionResult {
                transaction_guid: guid,
                success: true,
                bad_key: None,
            },
        );
        Ok(())
    }

    /// Outer error: the store failed. Inner error: the key that conflicts.
    fn validate(&self, txn: &PendingTransaction, as_of: Tid) -> OdbResult<Result<(), BadKey>> {
        if as_of < self.versions.horizon() {
            return Ok(Err(BadKey::Other(format!(
                "version {} is older than the horizon {}",
                as_of,
                self.versions.horizon()
            ))));
        }
        if let Some(key) = txn
            .key_versions
            .iter()
            .find(|k| self.versions.slot_is_stale(k, as_of))
        {
            return Ok(Err(BadKey::Field(*key)));
        }
        if let Some(index) = txn
            .index_versions
            .iter()
            .find(|i| self.versions.index_is_stale(i, as_of))
        {
            return Ok(Err(BadKey::Index(index.clone())));
        }

        for key in txn.writes.keys() {
            if self.catalog.resolve(key.field).is_none() {
                return Ok(Err(BadKey::Other(format!("unknown field {}", key.field))));
            }
            if key.is_index_value && !self.catalog.is_indexed(key.field) {
                return Ok(Err(BadKey::Other(format!("field {} is not indexed", key.field))));
            }
        }

        // every membership change travels with its index slot
        for (index, oids) in &txn.set_adds {
            for &oid in oids {
                match txn.writes.get(&ObjectFieldId::index(oid, index.field)) {
                    Some(Some(v)) if *v == index.value => {}
                    _ => {
                        return Ok(Err(BadKey::Other(format!(
                            "add of {} to {:?} without its index slot",
                            oid, index
                        ))))
                    }
                }
            }
        }
        for (index, oids) in &txn.set_removes {
            for &oid in oids {
                match txn.writes.get(&ObjectFieldId::index(oid, index.field)) {
                    Some(Some(v)) if *v == index.value => {
                        return Ok(Err(BadKey::Other(format!(
                            "remove of {} from {:?} while keeping the value",
                            oid, index
                        ))))
                    }
                    Some(_) => {}
                    None => {
                        return Ok(Err(BadKey::Other(format!(
                            "remove of {} from {:?} without its index slot",
                            oid, index
                        ))))
                    }
                }
            }
        }

        // and every index slot change comes with its membership change
        let slots: Vec<(ObjectFieldId, &Option<Bytes>)> = txn
            .writes
            .iter()
            .filter(|(k, _)| k.is_index_value)
            .map(|(k, v)| (*k, v))
            .collect();
        let store_keys: Vec<StoreKey> = slots.iter().map(|(k, _)| StoreKey::Value(*k)).collect();
        let current = self.store.get_several(&store_keys)?;
        for ((key, new), old) in slots.iter().zip(current) {
            if old.as_ref() == new.as_ref() {
                continue;
            }
            let listed = |deltas: &SetDeltas, value: &Bytes| {
                deltas
                    .get(&IndexId::new(key.field, value.clone()))
                    .map_or(false, |oids| oids.contains(&key.object))
            };
            let removed = old.as_ref().map_or(true, |v| listed(&txn.set_removes, v));
            let added = new.as_ref().map_or(true, |v| listed(&txn.set_adds, v));
            if !removed || !added {
                return Ok(Err(BadKey::Other(format!(
                    "index slot {:?} changed without matching set deltas",
                    key
                ))));
            }
        }

        match plan_set_deltas(&txn.set_adds, &txn.set_removes, |i| self.store.get_set_members(i)) {
            Ok(_) => Ok(Ok(())),
            Err(OdbError::InvariantViolation(msg)) => Ok(Err(BadKey::Other(msg))),
            Err(e) => Err(e),
        }
    }

    /// Persist, stamp and fan out one transaction; returns its tid
    /// Commit `txn` at the next tid. `request` is the (guid, as_of) of a
    /// client commit.
    fn apply(
        &mut self,
        committer: Option<ChannelId>,
        txn: PendingTransaction,
        meta: Vec<(StoreKey, Option<Bytes>)>,
        request: Option<(Guid, Tid)>,
    ) -> OdbResult<Tid> {
        let PendingTransaction {
            writes,
            set_adds,
            set_removes,
            key_versions,
            index_versions,
        } = txn;
        let tid = self.current_tid.next();

        let prior_keys: Vec<ObjectFieldId> = writes
            .keys()
            .filter(|k| {
                self.catalog
                    .type_of(k.field)
                    .map_or(false, |t| self.registry.has_lazy_interest(&t))
            })
            .copied()
            .collect();
        let priors: Writes = if prior_keys.is_empty() {
            Writes::new()
        } else {
            let store_keys: Vec<StoreKey> = prior_keys.iter().map(|k| StoreKey::Value(*k)).collect();
            prior_keys
                .into_iter()
                .zip(self.store.get_several(&store_keys)?)
                .collect()
        };

        let mut batch: Vec<(StoreKey, Option<Bytes>)> = writes
            .iter()
            .map(|(k, v)| (StoreKey::Value(*k), v.clone()))
            .collect();
        batch.extend(meta);
        batch.push((StoreKey::meta(TID_KEY), Some(to_bytes(&tid.0))));

        if let Err(e) = self.store.set_several(batch, &set_adds, &set_removes) {
            tracing::error!("store rejected transaction {}: {}", tid, e);
            return Err(e);
        }
        self.current_tid = tid;

        for key in writes.keys() {
            self.versions.stamp_slot(key, tid);
        }
        for index in set_adds.keys().chain(set_removes.keys()) {
            self.versions.stamp_index(index, tid);
        }

        let fanouts = self
            .registry
            .route(&self.catalog, committer, &writes, &set_adds, &set_removes);
        let sent_to: Vec<ObjectId> = fanouts
            .iter()
            .filter_map(|f| self.connections.get(&f.channel).and_then(|c| c.identity))
            .collect();
        for fanout in fanouts {
            self.deliver(fanout, tid, &priors)?;
        }

        if let Some(watcher) = self.watcher.as_mut() {
            watcher.on_transaction(&TransactionEvent {
                connection: committer
                    .and_then(|id| self.connections.get(&id))
                    .and_then(|c| c.identity),
                transaction_guid: request.map(|(guid, _)| guid),
                as_of: request.map(|(_, as_of)| as_of),
                transaction_id: Some(tid),
                writes,
                set_adds,
                set_removes,
                key_versions,
                index_versions,
                bad_key: None,
                sent_to,
            });
        }
        Ok(tid)
    }

    /// Push buffered watcher output out
    pub fn flush_watcher(&mut self) {
        if let Some(watcher) = self.watcher.as_mut() {
            watcher.flush();
        }
    }

    fn deliver(&self, fanout: Fanout, tid: Tid, priors: &Writes) -> OdbResult<()> {
        let Some(conn) = self.connections.get(&fanout.channel) else {
            return Ok(());
        };
        if conn.identity.is_none() {
            return Ok(());
        }

        if !fanout.prior_keys.is_empty() {
            let writes = fanout
                .prior_keys
                .iter()
                .map(|k| (*k, priors.get(k).cloned().flatten()))
                .collect();
            conn.channel
                .send_message(ServerToClient::LazyTransactionPriors { writes });
        }

        let mut writes = fanout.writes;
        for (index, oids) in &fanout.increases {
            let Some(field) = self.catalog.resolve(index.field) else {
                continue;
            };
            conn.channel.send_message(ServerToClient::SubscriptionIncrease {
                schema: field.schema.clone(),
                typename: field.typename.clone(),
                fieldname_and_value: Some((field.fieldname.clone(), index.value.clone())),
                identities: oids.clone(),
                transaction_id: tid,
            });

            let (values, index_values) = self.object_values(&field.type_key(), oids, true)?;
            for (key, value) in values.into_iter().chain(index_values) {
                writes.entry(key).or_insert(value);
            }
        }

        conn.channel.send_message(ServerToClient::Transaction {
            writes,
            set_adds: fanout.set_adds,
            set_removes: fanout.set_removes,
            transaction_id: tid,
        });
        Ok(())
    }

    /// Drop connections that stayed silent too long
    pub fn check_heartbeats(&mut self, now: Instant) -> OdbResult<()> {
        let timeout = self.config.heartbeat.timeout();
        let expired: Vec<ChannelId> = self
            .connections
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            tracing::warn!("channel {} missed its heartbeats", id);
            self.drop_connection(id, "heartbeat timeout")?;
        }
        Ok(())
    }

    /// Lowest tid any live connection may still read at
    pub fn oldest_view(&self) -> Option<Tid> {
        self.connections.values().filter_map(|c| c.view_horizon).min()
    }

    /// Prune the version table below the retention horizon, never past a
    /// tid a connected peer still reads at
    pub fn collect_garbage(&mut self) -> usize {
        let retained = self.current_tid.saturating_sub(self.config.version_retention);
        let horizon = self.oldest_view().map_or(retained, |oldest| oldest.min(retained));
        let dropped = self.versions.prune(horizon);
        if dropped > 0 {
            tracing::debug!("pruned {} versions below {}", dropped, horizon);
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use odb_core::{FieldDefinition, HeartbeatConfig, TypeDefinition};
    use odb_store::MemoryPersistence;
    use odb_transport::{Handler, OnClosed};
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<ServerToClient>>,
        closed: AtomicBool,
    }

    impl RecordingChannel {
        fn take(&self) -> Vec<ServerToClient> {
            std::mem::take(&mut *self.sent.lock())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl DownstreamChannel for RecordingChannel {
        fn send_message(&self, message: ServerToClient) {
            self.sent.lock().push(message);
        }

        fn set_handler(&self, _handler: Handler<ClientToServer>) {}

        fn set_on_closed(&self, _on_closed: OnClosed) {}

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct Fields {
        k: FieldId,
        x: FieldId,
        exists: FieldId,
    }

    fn open(config: AuthorityConfig) -> (Authority, Arc<MemoryPersistence>) {
        let store = Arc::new(MemoryPersistence::new());
        let authority = Authority::open(config, store.clone()).unwrap();
        (authority, store)
    }

    /// Attach and authenticate; returns the channel and its identity root
    fn connect(authority: &mut Authority, n: u64) -> (Arc<RecordingChannel>, u32) {
        let channel = Arc::new(RecordingChannel::default());
        authority.attach(ChannelId::new(n), channel.clone());
        authority
            .handle_message(
                ChannelId::new(n),
                ClientToServer::Authenticate {
                    token: String::new(),
                },
            )
            .unwrap();
        match channel.take().as_slice() {
            [ServerToClient::Initialize { identity_root, .. }] => (channel, *identity_root),
            other => panic!("expected Initialize, got {:?}", other),
        }
    }

    fn define_counter(authority: &mut Authority, n: u64, channel: &RecordingChannel) -> Fields {
        authority
            .handle_message(
                ChannelId::new(n),
                ClientToServer::DefineSchema {
                    name: "app".into(),
                    definition: SchemaDefinition::new()
                        .with_type("Counter", TypeDefinition::new().index("k").field("x")),
                },
            )
            .unwrap();
        let mapping = match channel.take().pop() {
            Some(ServerToClient::SchemaMapping { mapping, .. }) => mapping,
            other => panic!("expected SchemaMapping, got {:?}", other),
        };
        let id = |name: &str| mapping[&FieldDefinition::new("app", "Counter", name)];
        Fields {
            k: id("k"),
            x: id("x"),
            exists: id(odb_core::EXISTS_FIELD),
        }
    }

    fn b(v: u8) -> Option<Bytes> {
        Some(Bytes::from(vec![v]))
    }

    fn data(guid: u64, writes: Writes, adds: SetDeltas, removes: SetDeltas, reads: Vec<ObjectFieldId>) -> ClientToServer {
        ClientToServer::TransactionData {
            writes,
            set_adds: adds,
            set_removes: removes,
            key_versions: reads,
            index_versions: Vec::new(),
            transaction_guid: Guid::new(guid),
        }
    }

    fn create(f: &Fields, oid: ObjectId, k: u8, guid: u64) -> ClientToServer {
        let marker = Some(Bytes::from_static(EXISTS_VALUE));
        data(
            guid,
            Writes::from([
                (ObjectFieldId::value(oid, f.exists), marker.clone()),
                (ObjectFieldId::index(oid, f.exists), marker),
                (ObjectFieldId::value(oid, f.k), b(k)),
                (ObjectFieldId::index(oid, f.k), b(k)),
                (ObjectFieldId::value(oid, f.x), b(0)),
            ]),
            SetDeltas::from([
                (IndexId::exists(f.exists), vec![oid]),
                (IndexId::new(f.k, vec![k]), vec![oid]),
            ]),
            SetDeltas::new(),
            Vec::new(),
        )
    }

    fn commit(authority: &mut Authority, n: u64, message: ClientToServer, as_of: Tid) {
        let guid = match &message {
            ClientToServer::TransactionData {
                transaction_guid, ..
            } => *transaction_guid,
            _ => unreachable!(),
        };
        authority.handle_message(ChannelId::new(n), message).unwrap();
        authority
            .handle_message(
                ChannelId::new(n),
                ClientToServer::CompleteTransaction {
                    as_of_version: as_of,
                    transaction_guid: guid,
                },
            )
            .unwrap();
    }

    fn commit_latest(authority: &mut Authority, n: u64, message: ClientToServer) {
        let as_of = authority.current_tid();
        commit(authority, n, message, as_of);
    }

    fn result(messages: &[ServerToClient]) -> (bool, Option<BadKey>) {
        messages
            .iter()
            .find_map(|m| match m {
                ServerToClient::TransactionResult {
                    success, bad_key, ..
                } => Some((*success, bad_key.clone())),
                _ => None,
            })
            .expect("no TransactionResult")
    }

    fn drain_streams(authority: &mut Authority) {
        while authority.is_streaming() {
            authority.stream_step().unwrap();
        }
    }

    fn subscribe(authority: &mut Authority, n: u64, key: IndexKey, lazy: bool) {
        authority
            .handle_message(
                ChannelId::new(n),
                ClientToServer::Subscribe {
                    schema: "app".into(),
                    typename: "Counter".into(),
                    fieldname_and_value: key,
                    is_lazy: lazy,
                },
            )
            .unwrap();
    }

    #[test]
    fn test_bad_token_dropped_without_reply() {
        let (mut authority, _) = open(AuthorityConfig::default().with_auth_token("t"));

        let intruder = Arc::new(RecordingChannel::default());
        authority.attach(ChannelId::new(1), intruder.clone());
        authority
            .handle_message(ChannelId::new(1), ClientToServer::Authenticate { token: "x".into() })
            .unwrap();
        assert!(intruder.is_closed());
        assert!(intruder.take().is_empty());
        assert_eq!(authority.connection_count(), 0);

        let client = Arc::new(RecordingChannel::default());
        authority.attach(ChannelId::new(2), client.clone());
        authority
            .handle_message(ChannelId::new(2), ClientToServer::Authenticate { token: "t".into() })
            .unwrap();
        assert!(matches!(
            client.take().as_slice(),
            [ServerToClient::Initialize { identity_root: 1, .. }]
        ));
    }

    #[test]
    fn test_message_before_auth_drops_connection() {
        let (mut authority, _) = open(AuthorityConfig::default());
        let channel = Arc::new(RecordingChannel::default());
        authority.attach(ChannelId::new(1), channel.clone());

        authority
            .handle_message(ChannelId::new(1), ClientToServer::Heartbeat)
            .unwrap();
        assert!(!channel.is_closed());

        authority
            .handle_message(ChannelId::new(1), ClientToServer::Flush { guid: Guid::new(1) })
            .unwrap();
        assert!(channel.is_closed());
        assert!(channel.take().is_empty());
    }

    #[test]
    fn test_first_committer_wins() {
        let (mut authority, _) = open(AuthorityConfig::default());
        let (a, root_a) = connect(&mut authority, 1);
        let (b_chan, _) = connect(&mut authority, 2);
        let f = define_counter(&mut authority, 1, &a);

        let oid = ObjectId::from_root(root_a, 1);
        commit_latest(&mut authority, 1, create(&f, oid, 5, 1));
        assert_eq!(result(&a.take()), (true, None));
        let base = authority.current_tid();

        let x = ObjectFieldId::value(oid, f.x);
        commit(&mut authority, 1, data(2, Writes::from([(x, b(1))]), SetDeltas::new(), SetDeltas::new(), vec![x]), base);
        assert_eq!(result(&a.take()), (true, None));

        commit(&mut authority, 2, data(3, Writes::from([(x, b(2))]), SetDeltas::new(), SetDeltas::new(), vec![x]), base);
        assert_eq!(result(&b_chan.take()), (false, Some(BadKey::Field(x))));

        // a blind write at the old base does not conflict
        let k = ObjectFieldId::value(oid, f.k);
        commit(&mut authority, 2, data(4, Writes::from([(k, b(9))]), SetDeltas::new(), SetDeltas::new(), Vec::new()), base);
        assert_eq!(result(&b_chan.take()), (true, None));
    }

    #[test]
    fn test_type_subscriber_receives_commits() {
        let (mut authority, _) = open(AuthorityConfig::default());
        let (a, root_a) = connect(&mut authority, 1);
        let (watcher, _) = connect(&mut authority, 2);
        let f = define_counter(&mut authority, 1, &a);

        subscribe(&mut authority, 2, None, false);
        drain_streams(&mut authority);
        assert!(matches!(
            watcher.take().as_slice(),
            [ServerToClient::SubscriptionComplete { .. }]
        ));

        commit_latest(&mut authority, 1, create(&f, ObjectId::from_root(root_a, 1), 5, 1));

        let committed = authority.current_tid();
        match watcher.take().as_slice() {
            [ServerToClient::Transaction {
                writes,
                set_adds,
                transaction_id,
                ..
            }] => {
                assert_eq!(*transaction_id, committed);
                assert_eq!(writes.len(), 5);
                assert_eq!(set_adds.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }

        // committer sees its own transaction before the result
        let mine = a.take();
        assert!(matches!(mine[0], ServerToClient::Transaction { .. }));
        assert!(matches!(mine[1], ServerToClient::TransactionResult { success: true, .. }));
    }

    #[test]
    fn test_identity_subscription_sees_one_object() {
        let (mut authority, _) = open(AuthorityConfig::default());
        let (a, root_a) = connect(&mut authority, 1);
        let (watcher, _) = connect(&mut authority, 2);
        let f = define_counter(&mut authority, 1, &a);
        let watched = ObjectId::from_root(root_a, 1);
        let other = ObjectId::from_root(root_a, 2);
        commit_latest(&mut authority, 1, create(&f, watched, 5, 1));
        commit_latest(&mut authority, 1, create(&f, other, 5, 2));

        subscribe(&mut authority, 2, Some(odb_core::identity_key(watched)), false);
        drain_streams(&mut authority);
        match watcher.take().as_slice() {
            [ServerToClient::SubscriptionData {
                values, identities, ..
            }, ServerToClient::SubscriptionComplete { .. }] => {
                assert_eq!(identities.as_deref(), Some(&[watched][..]));
                assert_eq!(values[&ObjectFieldId::value(watched, f.k)], b(5));
            }
            other => panic!("unexpected {:?}", other),
        }

        let x = |oid| ObjectFieldId::value(oid, f.x);
        commit_latest(&mut authority, 1, data(3, Writes::from([(x(other), b(1))]), SetDeltas::new(), SetDeltas::new(), Vec::new()));
        assert!(watcher.take().is_empty());
        commit_latest(&mut authority, 1, data(4, Writes::from([(x(watched), b(1))]), SetDeltas::new(), SetDeltas::new(), Vec::new()));
        assert!(matches!(
            watcher.take().as_slice(),
            [ServerToClient::Transaction { .. }]
        ));
    }

    struct RecordingWatcher(Arc<Mutex<Vec<TransactionEvent>>>);

    impl TransactionWatcher for RecordingWatcher {
        fn on_transaction(&mut self, event: &TransactionEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[test]
    fn test_watcher_sees_commits_and_rejections() {
        let (mut authority, _) = open(AuthorityConfig::default());
        let events = Arc::new(Mutex::new(Vec::new()));
        authority.set_watcher(Box::new(RecordingWatcher(events.clone())));

        let (a, root_a) = connect(&mut authority, 1);
        {
            let events = events.lock();
            assert_eq!(events.len(), 1);
            assert!(events[0].succeeded());
            assert_eq!(events[0].transaction_guid, None);
        }

        let f = define_counter(&mut authority, 1, &a);
        let oid = ObjectId::from_root(root_a, 1);
        commit_latest(&mut authority, 1, create(&f, oid, 5, 7));
        let base = authority.current_tid();
        let x = ObjectFieldId::value(oid, f.x);
        commit(&mut authority, 1, data(8, Writes::from([(x, b(1))]), SetDeltas::new(), SetDeltas::new(), vec![x]), base);
        commit(&mut authority, 1, data(9, Writes::from([(x, b(2))]), SetDeltas::new(), SetDeltas::new(), vec![x]), base);

        let events = events.lock();
        assert_eq!(events.len(), 4);
        let created = &events[1];
        assert_eq!(created.transaction_guid, Some(Guid::new(7)));
        assert_eq!(created.transaction_id, Some(base));
        assert_eq!(created.writes.len(), 5);
        assert_eq!(created.sent_to.len(), 1);
        assert_eq!(created.connection, created.sent_to.first().copied());

        let rejected = &events[3];
        assert!(!rejected.succeeded());
        assert_eq!(rejected.as_of, Some(base));
        assert_eq!(rejected.bad_key, Some(BadKey::Field(x)));
        assert_eq!(rejected.key_versions, vec![x]);
    }

    #[test]
    fn test_configured_transaction_log() {
        let dir = std::env::temp_dir().join(format!("odb-authority-log-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let (mut authority, _) = open(AuthorityConfig::default().with_transaction_log_dir(&dir));
        connect(&mut authority, 1);
        connect(&mut authority, 2);
        authority.flush_watcher();

        let mut tids = Vec::new();
        LoggingTransactionWatcher::replay(&dir, |e| tids.push(e.transaction_id)).unwrap();
        assert_eq!(tids, vec![Some(Tid::new(1)), Some(Tid::new(2))]);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_membership_without_index_slot_rejected() {
        let (mut authority, _) = open(AuthorityConfig::default());
        let (a, root) = connect(&mut authority, 1);
        let f = define_counter(&mut authority, 1, &a);
        let oid = ObjectId::from_root(root, 1);

        let bogus = data(
            1,
            Writes::from([(ObjectFieldId::value(oid, f.k), b(5))]),
            SetDeltas::from([(IndexId::new(f.k, vec![5]), vec![oid])]),
            SetDeltas::new(),
            Vec::new(),
        );
        commit_latest(&mut authority, 1, bogus);
        assert!(matches!(result(&a.take()), (false, Some(BadKey::Other(_)))));

        // slot change with no membership change is just as wrong
        let bogus = data(
            2,
            Writes::from([(ObjectFieldId::index(oid, f.k), b(5))]),
            SetDeltas::new(),
            SetDeltas::new(),
            Vec::new(),
        );
        commit_latest(&mut authority, 1, bogus);
        assert!(matches!(result(&a.take()), (false, Some(BadKey::Other(_)))));
    }

    #[test]
    fn test_subscription_streams_in_chunks() {
        let (mut authority, _) = open(AuthorityConfig::default().with_subscription_chunk_size(2));
        let (a, root) = connect(&mut authority, 1);
        let f = define_counter(&mut authority, 1, &a);
        for i in 1..=5 {
            commit_latest(&mut authority, 1, create(&f, ObjectId::from_root(root, i), 5, u64::from(i)));
        }

        let (late, _) = connect(&mut authority, 2);
        subscribe(&mut authority, 2, None, false);
        authority
            .handle_message(ChannelId::new(2), ClientToServer::Flush { guid: Guid::new(77) })
            .unwrap();
        assert!(late.take().is_empty());

        drain_streams(&mut authority);
        let messages = late.take();
        let chunks: Vec<usize> = messages
            .iter()
            .filter_map(|m| match m {
                ServerToClient::SubscriptionData { index_values, .. } => {
                    Some(index_values.len())
                }
                _ => None,
            })
            .collect();
        // exists + k index slots per object
        assert_eq!(chunks, vec![4, 4, 2]);
        assert!(matches!(
            messages[3],
            ServerToClient::SubscriptionComplete { tid, .. } if tid == authority.current_tid()
        ));
        assert_eq!(messages[4], ServerToClient::FlushResponse { guid: Guid::new(77) });
    }

    #[test]
    fn test_index_subscription_grows() {
        let (mut authority, _) = open(AuthorityConfig::default());
        let (a, root) = connect(&mut authority, 1);
        let (watcher, _) = connect(&mut authority, 2);
        let f = define_counter(&mut authority, 1, &a);
        let oid = ObjectId::from_root(root, 1);
        commit_latest(&mut authority, 1, create(&f, oid, 4, 1));

        subscribe(&mut authority, 2, Some(("k".into(), Bytes::from(vec![5]))), false);
        drain_streams(&mut authority);
        match watcher.take().as_slice() {
            [ServerToClient::SubscriptionComplete { .. }] => {}
            other => panic!("unexpected {:?}", other),
        }

        let slot = ObjectFieldId::index(oid, f.k);
        commit_latest(
            &mut authority,
            1,
            data(
                2,
                Writes::from([(ObjectFieldId::value(oid, f.k), b(5)), (slot, b(5))]),
                SetDeltas::from([(IndexId::new(f.k, vec![5]), vec![oid])]),
                SetDeltas::from([(IndexId::new(f.k, vec![4]), vec![oid])]),
                vec![slot],
            ),
        );

        match watcher.take().as_slice() {
            [ServerToClient::SubscriptionIncrease { identities, .. }, ServerToClient::Transaction { writes, .. }] =>
            {
                assert_eq!(identities, &vec![oid]);
                // revealed object's other fields are folded in
                assert_eq!(writes.get(&ObjectFieldId::value(oid, f.x)), Some(&b(0)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_lazy_subscription_priors_and_load() {
        let (mut authority, _) = open(AuthorityConfig::default());
        let (a, root) = connect(&mut authority, 1);
        let (lazy, _) = connect(&mut authority, 2);
        let f = define_counter(&mut authority, 1, &a);
        let oid = ObjectId::from_root(root, 1);
        commit_latest(&mut authority, 1, create(&f, oid, 5, 1));

        subscribe(&mut authority, 2, None, true);
        drain_streams(&mut authority);
        match lazy.take().as_slice() {
            [ServerToClient::LazySubscriptionData { identities, .. }, ServerToClient::SubscriptionComplete { .. }] => {
                assert_eq!(identities, &vec![oid])
            }
            other => panic!("unexpected {:?}", other),
        }

        let x = ObjectFieldId::value(oid, f.x);
        commit_latest(&mut authority, 1, data(2, Writes::from([(x, b(3))]), SetDeltas::new(), SetDeltas::new(), Vec::new()));
        match lazy.take().as_slice() {
            [ServerToClient::LazyTransactionPriors { writes }, ServerToClient::Transaction { .. }] => {
                assert_eq!(writes.get(&x), Some(&b(0)))
            }
            other => panic!("unexpected {:?}", other),
        }

        authority
            .handle_message(
                ChannelId::new(2),
                ClientToServer::LoadLazyObject {
                    schema: "app".into(),
                    typename: "Counter".into(),
                    identity: oid,
                },
            )
            .unwrap();
        match lazy.take().as_slice() {
            [ServerToClient::LazyLoadResponse { identity, values }] => {
                assert_eq!(*identity, oid);
                assert_eq!(values.get(&x), Some(&b(3)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_deletes_connection_record() {
        let (mut authority, store) = open(AuthorityConfig::default());
        let (watcher, _) = connect(&mut authority, 1);
        authority
            .handle_message(
                ChannelId::new(1),
                ClientToServer::Subscribe {
                    schema: CORE_SCHEMA.into(),
                    typename: CONNECTION_TYPE.into(),
                    fieldname_and_value: None,
                    is_lazy: false,
                },
            )
            .unwrap();
        drain_streams(&mut authority);
        watcher.take();

        connect(&mut authority, 2);
        assert_eq!(watcher.take().len(), 1);

        let exists = authority.catalog().exists_field(&authority.connection_type).unwrap();
        assert_eq!(store.get_set_members(&IndexId::exists(exists)).unwrap().len(), 2);

        authority.detach(ChannelId::new(2)).unwrap();
        match watcher.take().as_slice() {
            [ServerToClient::Transaction { writes, set_removes, .. }] => {
                assert!(writes.values().all(Option::is_none));
                assert_eq!(set_removes.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(store.get_set_members(&IndexId::exists(exists)).unwrap().len(), 1);
    }

    #[test]
    fn test_heartbeat_timeout_drops_connection() {
        let heartbeat = HeartbeatConfig::default()
            .with_interval(Duration::from_millis(100))
            .with_missed_heartbeats_allowed(2);
        let (mut authority, _) = open(AuthorityConfig::default().with_heartbeat(heartbeat));
        let (channel, _) = connect(&mut authority, 1);

        authority.check_heartbeats(Instant::now()).unwrap();
        assert_eq!(authority.connection_count(), 1);

        authority
            .check_heartbeats(Instant::now() + Duration::from_secs(1))
            .unwrap();
        assert_eq!(authority.connection_count(), 0);
        assert!(channel.is_closed());
    }

    #[test]
    fn test_dependent_connections_die_with_parent() {
        let (mut authority, store) = open(AuthorityConfig::default());
        let (proxy, _) = connect(&mut authority, 1);
        let exists = authority.catalog().exists_field(&authority.connection_type).unwrap();
        let parent = store
            .get_set_members(&IndexId::exists(exists))
            .unwrap()
            .into_iter()
            .next()
            .unwrap();

        for guid in 1..=2 {
            authority
                .handle_message(
                    ChannelId::new(1),
                    ClientToServer::RequestDependentConnectionId {
                        parent,
                        guid: Guid::new(guid),
                    },
                )
                .unwrap();
        }
        let dependents: Vec<(ObjectId, u32)> = proxy
            .take()
            .into_iter()
            .filter_map(|m| match m {
                ServerToClient::DependentConnectionId {
                    conn_identity,
                    identity_root,
                    ..
                } => Some((conn_identity, identity_root)),
                _ => None,
            })
            .collect();
        assert_eq!(dependents.len(), 2);
        assert_ne!(dependents[0].1, dependents[1].1);
        assert_eq!(store.get_set_members(&IndexId::exists(exists)).unwrap().len(), 3);

        authority
            .handle_message(
                ChannelId::new(1),
                ClientToServer::DropDependentConnectionId {
                    conn_identity: dependents[0].0,
                },
            )
            .unwrap();
        assert_eq!(store.get_set_members(&IndexId::exists(exists)).unwrap().len(), 2);

        authority.detach(ChannelId::new(1)).unwrap();
        assert!(store.get_set_members(&IndexId::exists(exists)).unwrap().is_empty());
    }

    #[test]
    fn test_recovery_resumes_counters() {
        let (mut authority, store) = open(AuthorityConfig::default());
        let (a, root) = connect(&mut authority, 1);
        let f = define_counter(&mut authority, 1, &a);
        commit_latest(&mut authority, 1, create(&f, ObjectId::from_root(root, 1), 5, 1));
        let tid = authority.current_tid();
        let mapping = authority.catalog().mapping("app");
        drop(authority);

        let mut reopened = Authority::open(AuthorityConfig::default(), store).unwrap();
        assert_eq!(reopened.current_tid(), tid);
        assert_eq!(reopened.catalog().mapping("app"), mapping);
        assert_eq!(reopened.version_horizon(), tid);

        let (_, next_root) = connect(&mut reopened, 1);
        assert!(next_root > root);
    }

    fn report_view(authority: &mut Authority, n: u64, tid: Tid) {
        authority
            .handle_message(ChannelId::new(n), ClientToServer::ViewHorizon { tid })
            .unwrap();
    }

    #[test]
    fn test_open_view_survives_gc() {
        let (mut authority, _) = open(AuthorityConfig::default().with_version_retention(1));
        let (a, root) = connect(&mut authority, 1);
        let f = define_counter(&mut authority, 1, &a);
        commit_latest(&mut authority, 1, create(&f, ObjectId::from_root(root, 1), 5, 1));
        let old = authority.current_tid();
        report_view(&mut authority, 1, old);
        for i in 2..=4 {
            commit_latest(&mut authority, 1, create(&f, ObjectId::from_root(root, i), 5, u64::from(i)));
        }
        a.take();

        authority.collect_garbage();
        assert_eq!(authority.version_horizon(), old);

        // untouched since the view's tid: commits
        let x = ObjectFieldId::value(ObjectId::from_root(root, 1), f.x);
        commit(&mut authority, 1, data(9, Writes::from([(x, b(1))]), SetDeltas::new(), SetDeltas::new(), vec![x]), old);
        assert_eq!(result(&a.take()), (true, None));

        // written since: still conflicts
        let k = ObjectFieldId::value(ObjectId::from_root(root, 2), f.k);
        commit(&mut authority, 1, data(10, Writes::from([(k, b(7))]), SetDeltas::new(), SetDeltas::new(), vec![k]), old);
        assert_eq!(result(&a.take()), (false, Some(BadKey::Field(k))));
    }

    #[test]
    fn test_gc_follows_slowest_connection() {
        let (mut authority, _) = open(AuthorityConfig::default().with_version_retention(1));
        let (a, root) = connect(&mut authority, 1);
        let f = define_counter(&mut authority, 1, &a);
        let (_b, _) = connect(&mut authority, 2);
        let joined = authority.current_tid();
        report_view(&mut authority, 1, joined);
        for i in 1..=3 {
            commit_latest(&mut authority, 1, create(&f, ObjectId::from_root(root, i), 5, u64::from(i)));
        }

        // the second peer never reported, so it pins the tid it joined at
        authority.collect_garbage();
        assert_eq!(authority.version_horizon(), joined);

        let latest = authority.current_tid();
        report_view(&mut authority, 1, latest);
        report_view(&mut authority, 2, latest);
        // reports never move a peer back
        report_view(&mut authority, 2, joined);
        assert_eq!(authority.oldest_view(), Some(latest));

        assert!(authority.collect_garbage() > 0);
        assert_eq!(authority.version_horizon(), latest.saturating_sub(1));

        // a snapshot the horizon passed conflicts
        let x = ObjectFieldId::value(ObjectId::from_root(root, 1), f.x);
        a.take();
        commit(&mut authority, 1, data(9, Writes::from([(x, b(1))]), SetDeltas::new(), SetDeltas::new(), vec![x]), joined);
        assert!(matches!(result(&a.take()), (false, Some(BadKey::Other(_)))));
    }
}
