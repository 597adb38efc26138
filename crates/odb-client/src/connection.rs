//! Database connection
//!
//! Incoming messages are applied on the channel's delivery thread: cache
//! updates happen under the cache's write lock so a reader never sees half
//! a message, then waiters are woken through one condition variable.
//! Every blocking call fails with `Disconnected` once the channel is gone.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};

use odb_core::{
    core_schema, identity_key, BadKey, FieldMapping, Guid, IndexId, ObjectFieldId, ObjectId, OdbError,
    OdbResult, SchemaDefinition, SetDeltas, Tid, TypeKey, Writes, CONNECTION_TYPE, CORE_SCHEMA,
};
use odb_transport::{BusConfig, Endpoint, TcpUpstreamChannel, UpstreamChannel};
use odb_wire::{ClientToServer, IndexKey, ServerToClient};

use crate::{retry_on_conflict, ConnectionConfig, Transaction, VersionedCache, View};

/// How a submitted transaction ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionOutcome {
    Success,
    Conflict(Option<BadKey>),
    Disconnected,
}

impl TransactionOutcome {
    pub fn into_result(self) -> OdbResult<()> {
        match self {
            TransactionOutcome::Success => Ok(()),
            TransactionOutcome::Conflict(key) => Err(OdbError::RevisionConflict(key)),
            TransactionOutcome::Disconnected => Err(OdbError::Disconnected),
        }
    }
}

/// Called once with the outcome of a transaction
pub type ConfirmListener = Box<dyn FnOnce(&TransactionOutcome) + Send>;

/// A transaction applied to this connection's cache
#[derive(Debug)]
pub struct TransactionNotice<'a> {
    pub writes: &'a Writes,
    pub set_adds: &'a SetDeltas,
    pub set_removes: &'a SetDeltas,
    pub tid: Tid,
}

pub type TransactionHandler = Arc<dyn Fn(&TransactionNotice<'_>) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// A transaction ready to send
pub(crate) struct Submission {
    pub as_of: Tid,
    pub writes: Writes,
    pub set_adds: SetDeltas,
    pub set_removes: SetDeltas,
    pub reads: Vec<ObjectFieldId>,
    pub index_reads: Vec<IndexId>,
}

#[derive(Default)]
struct State {
    /// (connection object, identity root) once initialized
    identity: Option<(ObjectId, u32)>,
    disconnected: bool,
    next_counter: u32,
    flushed: HashSet<Guid>,
    awaiting: HashSet<Guid>,
    results: HashMap<Guid, TransactionOutcome>,
    listeners: HashMap<Guid, Vec<ConfirmListener>>,
    handlers: Vec<(HandlerId, TransactionHandler)>,
    next_handler: u64,
    applied_since_gc: u64,
}

pub(crate) struct Shared {
    channel: Arc<dyn UpstreamChannel>,
    config: ConnectionConfig,
    cache: RwLock<VersionedCache>,
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    fn notify(&self) {
        let _state = self.state.lock();
        self.changed.notify_all();
    }

    fn on_message(&self, message: ServerToClient) {
        match message {
            ServerToClient::Initialize {
                transaction_num,
                conn_identity,
                identity_root,
            } => {
                self.cache.write().advance_to(transaction_num);
                let mut state = self.state.lock();
                state.identity = Some((conn_identity, identity_root));
                state.next_counter = 1;
            }
            ServerToClient::TransactionResult {
                transaction_guid,
                success,
                bad_key,
            } => {
                let outcome = if success {
                    TransactionOutcome::Success
                } else {
                    TransactionOutcome::Conflict(bad_key)
                };
                self.resolve(transaction_guid, outcome);
            }
            ServerToClient::SchemaMapping { schema, mapping } => {
                tracing::debug!("schema {} mapped ({} fields)", schema, mapping.len());
                self.cache.write().absorb_mapping(&schema, &mapping);
            }
            ServerToClient::FlushResponse { guid } => {
                self.state.lock().flushed.insert(guid);
            }
            ServerToClient::SubscriptionData {
                schema,
                typename,
                fieldname_and_value,
                values,
                index_values,
                identities,
            } => {
                let key = (TypeKey::new(schema, typename), fieldname_and_value);
                self.cache
                    .write()
                    .buffer_data(&key, values, index_values, identities);
            }
            ServerToClient::LazySubscriptionData {
                schema,
                typename,
                fieldname_and_value,
                identities,
                index_values,
            } => {
                let key = (TypeKey::new(schema, typename), fieldname_and_value);
                self.cache.write().buffer_lazy(&key, identities, index_values);
            }
            ServerToClient::SubscriptionComplete {
                schema,
                typename,
                fieldname_and_value,
                tid,
            } => {
                let key = (TypeKey::new(schema, typename), fieldname_and_value);
                tracing::debug!("subscription {:?} complete at {}", key, tid);
                self.cache.write().complete_subscription(&key, tid);
            }
            ServerToClient::SubscriptionIncrease {
                identities,
                transaction_id,
                ..
            } => {
                tracing::trace!(
                    "{} objects entered scope at {}",
                    identities.len(),
                    transaction_id
                );
            }
            ServerToClient::LazyTransactionPriors { writes } => {
                self.cache.write().apply_priors(writes);
            }
            ServerToClient::LazyLoadResponse { identity, values } => {
                self.cache.write().apply_lazy_load(identity, values);
            }
            ServerToClient::Transaction {
                writes,
                set_adds,
                set_removes,
                transaction_id,
            } => {
                self.cache.write().apply_transaction(&writes, transaction_id);

                let (handlers, collect) = {
                    let mut state = self.state.lock();
                    state.applied_since_gc += 1;
                    let collect = state.applied_since_gc >= self.config.cache_gc_every;
                    if collect {
                        state.applied_since_gc = 0;
                    }
                    let handlers: Vec<TransactionHandler> =
                        state.handlers.iter().map(|(_, h)| h.clone()).collect();
                    (handlers, collect)
                };
                if collect {
                    self.collect_garbage();
                }

                let notice = TransactionNotice {
                    writes: &writes,
                    set_adds: &set_adds,
                    set_removes: &set_removes,
                    tid: transaction_id,
                };
                for handler in handlers {
                    handler(&notice);
                }
            }
            ServerToClient::Disconnected => self.mark_disconnected(),
            ServerToClient::DependentConnectionId { guid, .. } => {
                tracing::debug!("ignoring dependent connection id for {}", guid);
            }
        }
        self.notify();
    }

    /// Prune the cache and tell the server how far back we still read
    fn collect_garbage(&self) {
        let (before, after) = {
            let mut cache = self.cache.write();
            let before = cache.gc_floor();
            cache.collect_garbage();
            (before, cache.gc_floor())
        };
        if after > before {
            self.channel
                .send_message(ClientToServer::ViewHorizon { tid: after });
        }
    }

    fn resolve(&self, guid: Guid, outcome: TransactionOutcome) {
        let listeners = {
            let mut state = self.state.lock();
            if state.awaiting.remove(&guid) {
                state.results.insert(guid, outcome.clone());
            }
            state.listeners.remove(&guid).unwrap_or_default()
        };
        for listener in listeners {
            listener(&outcome);
        }
    }

    fn mark_disconnected(&self) {
        let listeners: Vec<ConfirmListener> = {
            let mut state = self.state.lock();
            if state.disconnected {
                return;
            }
            tracing::info!("database connection lost");
            state.disconnected = true;
            let awaiting: Vec<Guid> = state.awaiting.drain().collect();
            for guid in awaiting {
                state.results.insert(guid, TransactionOutcome::Disconnected);
            }
            state.listeners.drain().flat_map(|(_, l)| l).collect()
        };
        for listener in listeners {
            listener(&TransactionOutcome::Disconnected);
        }
    }
}

/// A connection to an authority or proxy. Cloning shares the connection.
#[derive(Clone)]
pub struct DatabaseConnection {
    shared: Arc<Shared>,
}

impl DatabaseConnection {
    /// Authenticate over `channel` and wait for `Initialize`
    pub fn connect(channel: Arc<dyn UpstreamChannel>, config: ConnectionConfig) -> OdbResult<Self> {
        let shared = Arc::new(Shared {
            channel: channel.clone(),
            config,
            cache: RwLock::new(VersionedCache::new()),
            state: Mutex::new(State::default()),
            changed: Condvar::new(),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        channel.set_handler(Box::new(move |message| {
            if let Some(shared) = weak.upgrade() {
                shared.on_message(message);
            }
        }));

        let db = DatabaseConnection { shared };
        db.send(ClientToServer::Authenticate {
            token: db.shared.config.auth_token.clone(),
        })?;
        let (identity, root) = db.wait(db.shared.config.connect_timeout, |state, _| state.identity)?;
        tracing::info!("connected as {} (identity root {})", identity, root);

        db.define_schema(CORE_SCHEMA, &core_schema())?;
        Ok(db)
    }

    /// Connect over TCP
    pub fn connect_tcp(endpoint: Endpoint, bus: BusConfig, config: ConnectionConfig) -> OdbResult<Self> {
        let channel = TcpUpstreamChannel::connect(bus, endpoint, &config.heartbeat)?;
        Self::connect(channel, config)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    pub(crate) fn cache(&self) -> &RwLock<VersionedCache> {
        &self.shared.cache
    }

    /// Block until `ready` yields, the connection drops or `timeout` passes
    fn wait<T>(
        &self,
        timeout: Option<Duration>,
        mut ready: impl FnMut(&mut State, &VersionedCache) -> Option<T>,
    ) -> OdbResult<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state.lock();
        loop {
            if let Some(value) = ready(&mut state, &self.shared.cache.read()) {
                return Ok(value);
            }
            if state.disconnected {
                return Err(OdbError::Disconnected);
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .shared
                        .changed
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        if let Some(value) = ready(&mut state, &self.shared.cache.read()) {
                            return Ok(value);
                        }
                        return Err(OdbError::Timeout(timeout.unwrap_or_default()));
                    }
                }
                None => self.shared.changed.wait(&mut state),
            }
        }
    }

    fn send(&self, message: ClientToServer) -> OdbResult<()> {
        if self.shared.state.lock().disconnected {
            return Err(OdbError::Disconnected);
        }
        self.shared.channel.send_message(message);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.state.lock().disconnected
    }

    /// Latest tid applied locally
    pub fn current_tid(&self) -> Tid {
        self.shared.cache.read().tid()
    }

    /// This connection's `core.Connection` object
    pub fn connection_object(&self) -> OdbResult<ObjectId> {
        self.shared
            .state
            .lock()
            .identity
            .map(|(oid, _)| oid)
            .ok_or(OdbError::Disconnected)
    }

    pub fn identity_root(&self) -> OdbResult<u32> {
        self.shared
            .state
            .lock()
            .identity
            .map(|(_, root)| root)
            .ok_or(OdbError::Disconnected)
    }

    /// Mint an identity from this connection's block
    pub fn new_object_id(&self) -> OdbResult<ObjectId> {
        let mut state = self.shared.state.lock();
        let (_, root) = state.identity.ok_or(OdbError::Disconnected)?;
        let counter = state.next_counter;
        state.next_counter = counter
            .checked_add(1)
            .ok_or_else(|| OdbError::InvalidState(format!("identity root {} exhausted", root)))?;
        Ok(ObjectId::from_root(root, counter))
    }

    /// Define (or extend) a schema and wait for its field ids
    pub fn define_schema(&self, name: &str, definition: &SchemaDefinition) -> OdbResult<FieldMapping> {
        self.shared.cache.write().remember_definition(name, definition);
        self.send(ClientToServer::DefineSchema {
            name: name.to_owned(),
            definition: definition.clone(),
        })?;
        let mapping = self.wait(self.shared.config.request_timeout, |_, cache| {
            cache
                .has_mapping_for(name, definition)
                .then(|| cache.catalog().mapping(name))
        })?;
        self.shared.cache.write().absorb_mapping(name, &mapping);
        Ok(mapping)
    }

    /// Replicate every object of a type. Lazy subscriptions replicate
    /// identities and index slots; values load on first read.
    pub fn subscribe_type(&self, schema: &str, typename: &str, lazy: bool) -> OdbResult<()> {
        self.subscribe(TypeKey::new(schema, typename), None, lazy)
    }

    /// Replicate the objects whose `fieldname` is `value`, including those
    /// that take the value later
    pub fn subscribe_index(
        &self,
        schema: &str,
        typename: &str,
        fieldname: &str,
        value: impl Into<Bytes>,
    ) -> OdbResult<()> {
        self.subscribe(
            TypeKey::new(schema, typename),
            Some((fieldname.to_owned(), value.into())),
            false,
        )
    }

    /// Replicate the single object `oid`, including writes made to it
    /// after it is created
    pub fn subscribe_object(&self, schema: &str, typename: &str, oid: ObjectId) -> OdbResult<()> {
        self.subscribe(TypeKey::new(schema, typename), Some(identity_key(oid)), false)
    }

    /// Learn the authority's tid for a type without replicating it
    pub fn subscribe_none(&self, schema: &str, typename: &str) -> OdbResult<()> {
        let key = (TypeKey::new(schema, typename), None);
        let before = self.shared.cache.read().completions(&key);
        self.send(ClientToServer::SubscribeNone {
            schema: schema.to_owned(),
            typename: typename.to_owned(),
        })?;
        self.wait(self.shared.config.request_timeout, |_, cache| {
            (cache.completions(&key) > before).then_some(())
        })
    }

    fn subscribe(&self, ty: TypeKey, index: IndexKey, lazy: bool) -> OdbResult<()> {
        let key = (ty.clone(), index.clone());
        let before = {
            let mut cache = self.shared.cache.write();
            cache.begin_subscription(key.clone(), lazy);
            cache.completions(&key)
        };
        self.send(ClientToServer::Subscribe {
            schema: ty.schema,
            typename: ty.typename,
            fieldname_and_value: index,
            is_lazy: lazy,
        })?;

        let done = self.wait(self.shared.config.request_timeout, |_, cache| {
            (cache.completions(&key) > before).then_some(())
        });
        if let Err(OdbError::Timeout(after)) = &done {
            tracing::warn!("subscription {:?} still streaming after {:?}", key, after);
        }
        done
    }

    /// Wait until every message sent so far has been processed upstream
    pub fn flush(&self) -> OdbResult<()> {
        let guid = Guid::random();
        self.send(ClientToServer::Flush { guid })?;
        self.wait(self.shared.config.request_timeout, |state, _| {
            state.flushed.remove(&guid).then_some(())
        })
    }

    /// Fetch a lazily replicated object's values
    pub fn load_lazy(&self, ty: &TypeKey, oid: ObjectId) -> OdbResult<()> {
        if self.shared.cache.read().is_loaded(oid) {
            return Ok(());
        }
        tracing::trace!("loading lazy object {}", oid);
        self.send(ClientToServer::LoadLazyObject {
            schema: ty.schema.clone(),
            typename: ty.typename.clone(),
            identity: oid,
        })?;
        self.wait(self.shared.config.request_timeout, |_, cache| {
            cache.is_loaded(oid).then_some(())
        })
    }

    /// Snapshot at the latest applied tid
    pub fn view(&self) -> View {
        let tid = {
            let mut cache = self.shared.cache.write();
            let tid = cache.tid();
            cache.open_view(tid);
            tid
        };
        View::open(self.clone(), tid)
    }

    /// Snapshot at an earlier tid
    pub fn view_at(&self, tid: Tid) -> OdbResult<View> {
        {
            let mut cache = self.shared.cache.write();
            if tid < cache.gc_floor() {
                return Err(OdbError::VersionTooOld {
                    requested: tid,
                    horizon: cache.gc_floor(),
                });
            }
            if tid > cache.tid() {
                return Err(OdbError::InvalidState(format!(
                    "tid {} has not been applied yet",
                    tid
                )));
            }
            cache.open_view(tid);
        }
        Ok(View::open(self.clone(), tid))
    }

    pub fn transaction(&self) -> Transaction {
        Transaction::new(self.view())
    }

    /// Run `f` in a fresh transaction and commit, retrying on conflict
    pub fn transact<T, F>(&self, mut f: F) -> OdbResult<T>
    where
        F: FnMut(&mut Transaction) -> OdbResult<T>,
    {
        retry_on_conflict(self.shared.config.max_retries, || {
            let mut txn = self.transaction();
            let value = f(&mut txn)?;
            txn.commit()?;
            Ok(value)
        })
    }

    /// Call `handler` for every transaction applied from now on
    pub fn register_transaction_handler<H>(&self, handler: H) -> HandlerId
    where
        H: Fn(&TransactionNotice<'_>) + Send + Sync + 'static,
    {
        let mut state = self.shared.state.lock();
        let id = HandlerId(state.next_handler);
        state.next_handler += 1;
        state.handlers.push((id, Arc::new(handler)));
        id
    }

    pub fn drop_transaction_handler(&self, id: HandlerId) {
        self.shared.state.lock().handlers.retain(|(h, _)| *h != id);
    }

    /// Send a transaction; with `wait`, block for its outcome
    pub(crate) fn submit(
        &self,
        submission: Submission,
        listeners: Vec<ConfirmListener>,
        wait: bool,
    ) -> OdbResult<Option<TransactionOutcome>> {
        let guid = Guid::random();
        {
            let mut state = self.shared.state.lock();
            if state.disconnected {
                drop(state);
                for listener in listeners {
                    listener(&TransactionOutcome::Disconnected);
                }
                return Err(OdbError::Disconnected);
            }
            if !listeners.is_empty() {
                state.listeners.insert(guid, listeners);
            }
            if wait {
                state.awaiting.insert(guid);
            }
        }

        let Submission {
            as_of,
            writes,
            mut set_adds,
            mut set_removes,
            mut reads,
            mut index_reads,
        } = submission;

        let chunk_size = self.shared.config.transaction_chunk_size.max(1);
        let mut remaining: Vec<(ObjectFieldId, Option<Bytes>)> = writes.into_iter().collect();
        loop {
            let rest = if remaining.len() > chunk_size {
                remaining.split_off(chunk_size)
            } else {
                Vec::new()
            };
            let chunk: Writes = std::mem::replace(&mut remaining, rest).into_iter().collect();
            self.send(ClientToServer::TransactionData {
                writes: chunk,
                set_adds: std::mem::take(&mut set_adds),
                set_removes: std::mem::take(&mut set_removes),
                key_versions: std::mem::take(&mut reads),
                index_versions: std::mem::take(&mut index_reads),
                transaction_guid: guid,
            })?;
            if remaining.is_empty() {
                break;
            }
        }
        self.send(ClientToServer::CompleteTransaction {
            as_of_version: as_of,
            transaction_guid: guid,
        })?;

        if !wait {
            return Ok(None);
        }
        let outcome = self.wait(self.shared.config.request_timeout, |state, _| {
            state.results.remove(&guid)
        });
        if outcome.is_err() {
            self.shared.state.lock().awaiting.remove(&guid);
        }
        outcome.map(Some)
    }

    /// Close the channel; pending and future calls fail with `Disconnected`
    pub fn disconnect(&self) {
        self.shared.channel.close();
        self.shared.mark_disconnected();
        self.shared.notify();
    }

    /// Live `core.Connection` objects, if subscribed to them
    pub fn connection_objects(&self) -> OdbResult<Vec<ObjectId>> {
        self.view()
            .lookup_type(&TypeKey::new(CORE_SCHEMA, CONNECTION_TYPE))
    }
}
