//! Proxy state
//!
//! Downstream channels speak the client protocol to the proxy; the proxy
//! holds one connection upstream. Every type a downstream subscribes to is
//! subscribed upstream once, in full, and mirrored here; downstream
//! subscriptions of any shape are then served from the mirror and routed
//! with the same [`SubscriptionRegistry`] the authority uses.
//! `SubscribeNone` starts the upstream subscription without waiting on it.
//!
//! The view horizon reported upstream is the oldest one any downstream
//! reported, so upstream pruning never outruns a downstream view.
//!
//! All methods run on the proxy's actor thread.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use odb_core::{
    core_schema, Catalog, ChannelId, FieldMapping, Guid, IndexId, ObjectFieldId, ObjectId, OdbError,
    OdbResult, SchemaDefinition, SetDeltas, Tid, TypeKey, Writes, CORE_SCHEMA,
};
use odb_server::{Fanout, SubscriptionRegistry, SubscriptionScope};
use odb_transport::{DownstreamChannel, UpstreamChannel};
use odb_wire::{ClientToServer, IndexKey, ServerToClient, WireMessage};

use crate::{Mirror, ProxyConfig};

/// The proxy's own subscription to one type
enum UpstreamSubscription {
    Streaming {
        started: Tid,
        values: Writes,
        index_values: Writes,
        /// Downstream subscriptions released on completion
        waiting: Vec<(ChannelId, IndexKey, bool)>,
    },
    Complete,
}

/// A downstream commit forwarded upstream
struct Inflight {
    guid: Guid,
    channel: ChannelId,
    downstream_guid: Guid,
    writes: Writes,
    matched: bool,
}

struct Downstream {
    channel: Arc<dyn DownstreamChannel>,
    authenticated: bool,
    identity: Option<ObjectId>,
    dependents: HashSet<ObjectId>,
    last_seen: Instant,
    /// Subscriptions waiting on an upstream subscription
    pending_subscriptions: usize,
    /// Messages held back until those complete
    held: VecDeque<ClientToServer>,
    /// Downstream guid → (proxy guid, writes so far)
    building: HashMap<Guid, (Guid, Writes)>,
    /// Lowest tid the downstream may still read or commit at; `None`
    /// until initialized
    view_horizon: Option<Tid>,
}

pub struct Proxy {
    config: ProxyConfig,
    upstream: Arc<dyn UpstreamChannel>,
    upstream_lost: bool,
    identity: Option<ObjectId>,
    current_tid: Tid,
    /// Last view horizon reported upstream
    view_horizon: Option<Tid>,
    catalog: Catalog,
    /// Union of every definition sent upstream, by schema
    definitions: HashMap<String, SchemaDefinition>,
    schema_waiters: Vec<(ChannelId, String, SchemaDefinition)>,
    registry: SubscriptionRegistry,
    mirror: Mirror,
    subscriptions: HashMap<TypeKey, UpstreamSubscription>,
    connections: HashMap<ChannelId, Downstream>,
    awaiting_identity: Vec<ChannelId>,
    /// Proxy guid → (channel, the guid it used for a nested request)
    identity_requests: HashMap<Guid, (ChannelId, Option<Guid>)>,
    inflight: Vec<Inflight>,
    flushes: HashMap<Guid, (ChannelId, Guid)>,
}

impl Proxy {
    /// Authenticate upstream over `upstream`, whose handler must already
    /// feed [`Proxy::handle_upstream`]
    pub fn new(config: ProxyConfig, upstream: Arc<dyn UpstreamChannel>) -> Self {
        upstream.send_message(ClientToServer::Authenticate {
            token: config.upstream_token.clone(),
        });
        upstream.send_message(ClientToServer::DefineSchema {
            name: CORE_SCHEMA.to_owned(),
            definition: core_schema(),
        });

        Proxy {
            config,
            upstream,
            upstream_lost: false,
            identity: None,
            current_tid: Tid::ZERO,
            view_horizon: None,
            catalog: Catalog::new(),
            definitions: HashMap::from([(CORE_SCHEMA.to_owned(), core_schema())]),
            schema_waiters: Vec::new(),
            registry: SubscriptionRegistry::new(),
            mirror: Mirror::new(),
            subscriptions: HashMap::new(),
            connections: HashMap::new(),
            awaiting_identity: Vec::new(),
            identity_requests: HashMap::new(),
            inflight: Vec::new(),
            flushes: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn current_tid(&self) -> Tid {
        self.current_tid
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Types subscribed upstream
    pub fn upstream_subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_upstream_lost(&self) -> bool {
        self.upstream_lost
    }

    fn send_upstream(&self, message: ClientToServer) -> OdbResult<()> {
        if self.upstream_lost {
            return Err(OdbError::Disconnected);
        }
        self.upstream.send_message(message);
        Ok(())
    }

    fn send(&self, id: ChannelId, message: ServerToClient) {
        if let Some(conn) = self.connections.get(&id) {
            conn.channel.send_message(message);
        }
    }

    pub fn attach(&mut self, id: ChannelId, channel: Arc<dyn DownstreamChannel>) {
        tracing::debug!("downstream {} attached", id);
        self.connections.insert(
            id,
            Downstream {
                channel,
                authenticated: false,
                identity: None,
                dependents: HashSet::new(),
                last_seen: Instant::now(),
                pending_subscriptions: 0,
                held: VecDeque::new(),
                building: HashMap::new(),
                view_horizon: None,
            },
        );
    }

    pub fn detach(&mut self, id: ChannelId) -> OdbResult<()> {
        self.drop_downstream(id, "channel closed")
    }

    /// Close every downstream channel and the upstream one
    pub fn shutdown(&mut self) {
        for (_, conn) in self.connections.drain() {
            conn.channel.close();
        }
        self.upstream.close();
    }

    fn drop_downstream(&mut self, id: ChannelId, reason: &str) -> OdbResult<()> {
        let Some(conn) = self.connections.remove(&id) else {
            return Ok(());
        };
        conn.channel.close();
        self.registry.remove_channel(id);
        self.awaiting_identity.retain(|c| *c != id);
        self.schema_waiters.retain(|(c, _, _)| *c != id);
        self.inflight.retain(|i| i.channel != id);
        self.flushes.retain(|_, (c, _)| *c != id);
        for sub in self.subscriptions.values_mut() {
            if let UpstreamSubscription::Streaming { waiting, .. } = sub {
                waiting.retain(|(c, _, _)| *c != id);
            }
        }

        let Some(identity) = conn.identity else {
            tracing::debug!("downstream {} dropped before initializing: {}", id, reason);
            return Ok(());
        };
        tracing::info!("downstream {} ({}) dropped: {}", id, identity, reason);
        for conn_identity in conn.dependents.into_iter().chain(std::iter::once(identity)) {
            self.send_upstream(ClientToServer::DropDependentConnectionId { conn_identity })?;
        }
        self.report_view_horizon()
    }

    /// Report upstream the oldest view any downstream still holds, or the
    /// current tid when none does. Never moves back.
    fn report_view_horizon(&mut self) -> OdbResult<()> {
        let oldest = self
            .connections
            .values()
            .filter_map(|c| c.view_horizon)
            .min()
            .unwrap_or(self.current_tid);
        if self.view_horizon.map_or(false, |reported| oldest <= reported) {
            return Ok(());
        }
        self.view_horizon = Some(oldest);
        self.send_upstream(ClientToServer::ViewHorizon { tid: oldest })
    }

    /// Drop downstream channels that stayed silent too long
    pub fn check_heartbeats(&mut self, now: Instant) -> OdbResult<()> {
        let timeout = self.config.heartbeat.timeout();
        let expired: Vec<ChannelId> = self
            .connections
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            tracing::warn!("downstream {} missed its heartbeats", id);
            self.drop_downstream(id, "heartbeat timeout")?;
        }
        if self.identity.is_some() {
            self.report_view_horizon()?;
        }
        Ok(())
    }

    /// Handle one downstream message. An error means the upstream is gone.
    pub fn handle_downstream(&mut self, id: ChannelId, message: ClientToServer) -> OdbResult<()> {
        let Some(conn) = self.connections.get_mut(&id) else {
            return Ok(());
        };
        conn.last_seen = Instant::now();

        if !conn.authenticated {
            return match message {
                ClientToServer::Heartbeat => Ok(()),
                ClientToServer::Authenticate { token } => self.authenticate(id, token),
                other => {
                    tracing::warn!("downstream {} sent {} before authenticating", id, other.kind());
                    self.drop_downstream(id, "unauthenticated message")
                }
            };
        }
        if let ClientToServer::Heartbeat = message {
            return Ok(());
        }
        if conn.pending_subscriptions > 0 {
            conn.held.push_back(message);
            return Ok(());
        }
        self.dispatch(id, message)
    }

    fn release_held(&mut self, id: ChannelId) -> OdbResult<()> {
        loop {
            let Some(conn) = self.connections.get_mut(&id) else {
                return Ok(());
            };
            if conn.pending_subscriptions > 0 {
                return Ok(());
            }
            let Some(message) = conn.held.pop_front() else {
                return Ok(());
            };
            self.dispatch(id, message)?;
        }
    }

    fn dispatch(&mut self, id: ChannelId, message: ClientToServer) -> OdbResult<()> {
        match message {
            ClientToServer::Heartbeat => Ok(()),
            ClientToServer::Authenticate { .. } => {
                tracing::debug!("downstream {} authenticated twice; ignored", id);
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
                let ty = TypeKey::new(schema, typename);
                if self.catalog.has_type(&ty) {
                    self.subscribe_upstream(&ty)?;
                } else {
                    tracing::warn!("downstream {} pre-warmed undefined type {}", id, ty);
                }
                self.complete(id, &ty, None);
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
                let Some(conn) = self.connections.get_mut(&id) else {
                    return Ok(());
                };
                let (guid, pending) = conn
                    .building
                    .entry(transaction_guid)
                    .or_insert_with(|| (Guid::random(), Writes::new()));
                pending.extend(writes.iter().map(|(k, v)| (*k, v.clone())));
                let guid = *guid;
                self.send_upstream(ClientToServer::TransactionData {
                    writes,
                    set_adds,
                    set_removes,
                    key_versions,
                    index_versions,
                    transaction_guid: guid,
                })
            }
            ClientToServer::CompleteTransaction {
                as_of_version,
                transaction_guid,
            } => {
                let Some(conn) = self.connections.get_mut(&id) else {
                    return Ok(());
                };
                let (guid, writes) = conn
                    .building
                    .remove(&transaction_guid)
                    .unwrap_or_else(|| (Guid::random(), Writes::new()));
                self.inflight.push(Inflight {
                    guid,
                    channel: id,
                    downstream_guid: transaction_guid,
                    writes,
                    matched: false,
                });
                self.send_upstream(ClientToServer::CompleteTransaction {
                    as_of_version,
                    transaction_guid: guid,
                })
            }
            ClientToServer::LoadLazyObject {
                schema,
                typename,
                identity,
            } => {
                let fields = self.catalog.type_fields(&TypeKey::new(schema, typename));
                let (mut values, index_values) = self.mirror.object_values(&fields, &[identity], true);
                values.extend(index_values);
                self.send(id, ServerToClient::LazyLoadResponse { identity, values });
                Ok(())
            }
            ClientToServer::Flush { guid } => {
                let upstream_guid = Guid::random();
                self.flushes.insert(upstream_guid, (id, guid));
                self.send_upstream(ClientToServer::Flush {
                    guid: upstream_guid,
                })
            }
            ClientToServer::RequestDependentConnectionId { parent, guid } => {
                let owner = self.connections.get(&id).and_then(|c| c.identity);
                if owner != Some(parent) {
                    tracing::warn!(
                        "downstream {} asked for a dependent of {} it does not own",
                        id,
                        parent
                    );
                }
                self.request_identity(id, Some(guid))
            }
            ClientToServer::DropDependentConnectionId { conn_identity } => {
                let owned = self
                    .connections
                    .get_mut(&id)
                    .map_or(false, |c| c.dependents.remove(&conn_identity));
                if owned {
                    self.send_upstream(ClientToServer::DropDependentConnectionId { conn_identity })?;
                }
                Ok(())
            }
            ClientToServer::ViewHorizon { tid } => {
                let current = self.current_tid;
                if let Some(horizon) = self
                    .connections
                    .get_mut(&id)
                    .and_then(|c| c.view_horizon.as_mut())
                {
                    *horizon = (*horizon).max(tid.min(current));
                }
                self.report_view_horizon()
            }
        }
    }

    fn authenticate(&mut self, id: ChannelId, token: String) -> OdbResult<()> {
        if let Some(expected) = &self.config.auth_token {
            if &token != expected {
                tracing::warn!("downstream {} presented a bad token", id);
                return self.drop_downstream(id, "authentication failed");
            }
        }
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.authenticated = true;
        }
        if self.identity.is_some() {
            self.request_identity(id, None)
        } else {
            self.awaiting_identity.push(id);
            Ok(())
        }
    }

    /// Ask upstream for a connection id on behalf of `id`
    fn request_identity(&mut self, id: ChannelId, nested: Option<Guid>) -> OdbResult<()> {
        let parent = self
            .identity
            .ok_or_else(|| OdbError::InvalidState("proxy has no upstream identity".into()))?;
        let guid = Guid::random();
        self.identity_requests.insert(guid, (id, nested));
        self.send_upstream(ClientToServer::RequestDependentConnectionId { parent, guid })
    }

    /// The slice of schema `name`'s mapping covering `definition`
    fn mapping_for(&self, name: &str, definition: &SchemaDefinition) -> Option<FieldMapping> {
        let mut mapping = FieldMapping::new();
        for field in definition.field_definitions(name) {
            let id = self.catalog.field_id(&field)?;
            mapping.insert(field, id);
        }
        Some(mapping)
    }

    fn define_schema(&mut self, id: ChannelId, name: String, definition: SchemaDefinition) -> OdbResult<()> {
        let merged = self.definitions.entry(name.clone()).or_default();
        if merged.merge(&definition) {
            let merged = merged.clone();
            tracing::debug!("schema {} grew; redefining upstream", name);
            self.send_upstream(ClientToServer::DefineSchema {
                name: name.clone(),
                definition: merged,
            })?;
        }

        match self.mapping_for(&name, &definition) {
            Some(mapping) => self.send(
                id,
                ServerToClient::SchemaMapping {
                    schema: name,
                    mapping,
                },
            ),
            None => self.schema_waiters.push((id, name, definition)),
        }
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
            tracing::warn!("downstream {} subscribed to undefined type {}", id, ty);
            self.complete(id, &ty, key);
            return Ok(());
        }

        if let Some(UpstreamSubscription::Complete) = self.subscriptions.get(&ty) {
            return self.serve(id, ty, key, lazy);
        }
        self.subscribe_upstream(&ty)?;
        if let Some(UpstreamSubscription::Streaming { waiting, .. }) = self.subscriptions.get_mut(&ty) {
            waiting.push((id, key, lazy));
        }
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.pending_subscriptions += 1;
        }
        Ok(())
    }

    /// Start the full upstream subscription to `ty` unless one exists
    fn subscribe_upstream(&mut self, ty: &TypeKey) -> OdbResult<()> {
        if self.subscriptions.contains_key(ty) {
            return Ok(());
        }
        tracing::debug!("subscribing upstream to {}", ty);
        self.send_upstream(ClientToServer::Subscribe {
            schema: ty.schema.clone(),
            typename: ty.typename.clone(),
            fieldname_and_value: None,
            is_lazy: false,
        })?;
        self.subscriptions.insert(
            ty.clone(),
            UpstreamSubscription::Streaming {
                started: self.current_tid,
                values: Writes::new(),
                index_values: Writes::new(),
                waiting: Vec::new(),
            },
        );
        Ok(())
    }

    /// Answer a downstream subscription from the mirror
    fn serve(&mut self, id: ChannelId, ty: TypeKey, key: IndexKey, lazy: bool) -> OdbResult<()> {
        let Some(scope) = SubscriptionScope::resolve(&self.catalog, &ty, &key) else {
            tracing::warn!("downstream {} subscribed to non-index key {:?} of {}", id, key, ty);
            self.complete(id, &ty, key);
            return Ok(());
        };
        let members = match &scope {
            SubscriptionScope::Type => {
                let exists = self
                    .catalog
                    .exists_field(&ty)
                    .ok_or_else(|| OdbError::InvariantViolation(format!("{} has no exists field", ty)))?;
                self.mirror.members(&IndexId::exists(exists))
            }
            SubscriptionScope::Index(index) => self.mirror.members(index),
            SubscriptionScope::Object(oid) => vec![*oid],
        };

        tracing::debug!(
            "downstream {} subscribed to {} {:?} ({} objects, lazy={})",
            id,
            ty,
            scope,
            members.len(),
            lazy
        );
        self.registry
            .subscribe(id, ty.clone(), scope, lazy, members.iter().copied());

        let fields = self.catalog.type_fields(&ty);
        for chunk in members.chunks(self.config.subscription_chunk_size.max(1)) {
            let (values, index_values) = self.mirror.object_values(&fields, chunk, !lazy);
            let message = if lazy {
                ServerToClient::LazySubscriptionData {
                    schema: ty.schema.clone(),
                    typename: ty.typename.clone(),
                    fieldname_and_value: key.clone(),
                    identities: chunk.to_vec(),
                    index_values,
                }
            } else {
                ServerToClient::SubscriptionData {
                    schema: ty.schema.clone(),
                    typename: ty.typename.clone(),
                    fieldname_and_value: key.clone(),
                    values,
                    index_values,
                    identities: key.is_some().then(|| chunk.to_vec()),
                }
            };
            self.send(id, message);
        }
        self.complete(id, &ty, key);
        Ok(())
    }

    /// Handle one upstream message. An error means the upstream is gone.
    pub fn handle_upstream(&mut self, message: ServerToClient) -> OdbResult<()> {
        match message {
            ServerToClient::Initialize {
                transaction_num,
                conn_identity,
                identity_root,
            } => {
                tracing::info!(
                    "proxy connected upstream as {} (identity root {})",
                    conn_identity,
                    identity_root
                );
                self.identity = Some(conn_identity);
                self.current_tid = self.current_tid.max(transaction_num);
                // the authority pins a new connection at its current tid
                self.view_horizon = Some(transaction_num);
                for id in std::mem::take(&mut self.awaiting_identity) {
                    self.request_identity(id, None)?;
                }
                Ok(())
            }
            ServerToClient::DependentConnectionId {
                guid,
                conn_identity,
                identity_root,
            } => self.dependent_ready(guid, conn_identity, identity_root),
            ServerToClient::SchemaMapping { schema, mapping } => {
                let definition = self.definitions.get(&schema).cloned().unwrap_or_default();
                self.catalog.absorb_mapping(&schema, &definition, &mapping);

                let waiters = std::mem::take(&mut self.schema_waiters);
                for (id, name, definition) in waiters {
                    match self.mapping_for(&name, &definition) {
                        Some(mapping) => self.send(
                            id,
                            ServerToClient::SchemaMapping {
                                schema: name,
                                mapping,
                            },
                        ),
                        None => self.schema_waiters.push((id, name, definition)),
                    }
                }
                Ok(())
            }
            ServerToClient::TransactionResult {
                transaction_guid,
                success,
                bad_key,
            } => {
                let Some(pos) = self.inflight.iter().position(|i| i.guid == transaction_guid) else {
                    return Ok(());
                };
                let inflight = self.inflight.remove(pos);
                self.send(
                    inflight.channel,
                    ServerToClient::TransactionResult {
                        transaction_guid: inflight.downstream_guid,
                        success,
                        bad_key,
                    },
                );
                Ok(())
            }
            ServerToClient::FlushResponse { guid } => {
                if let Some((id, guid)) = self.flushes.remove(&guid) {
                    self.send(id, ServerToClient::FlushResponse { guid });
                }
                Ok(())
            }
            ServerToClient::SubscriptionData {
                schema,
                typename,
                values: data,
                index_values: index_data,
                ..
            } => {
                if let Some(UpstreamSubscription::Streaming {
                    values,
                    index_values,
                    ..
                }) = self.subscriptions.get_mut(&TypeKey::new(schema, typename))
                {
                    values.extend(data);
                    index_values.extend(index_data);
                }
                Ok(())
            }
            ServerToClient::SubscriptionComplete {
                schema,
                typename,
                tid,
                ..
            } => self.upstream_complete(TypeKey::new(schema, typename), tid),
            ServerToClient::Transaction {
                writes,
                set_adds,
                set_removes,
                transaction_id,
            } => self.replay(writes, set_adds, set_removes, transaction_id),
            ServerToClient::SubscriptionIncrease { .. }
            | ServerToClient::LazySubscriptionData { .. }
            | ServerToClient::LazyTransactionPriors { .. }
            | ServerToClient::LazyLoadResponse { .. } => {
                tracing::trace!("ignoring {} from upstream", message.kind());
                Ok(())
            }
            ServerToClient::Disconnected => {
                tracing::error!("proxy lost its upstream connection");
                self.upstream_lost = true;
                for (_, conn) in self.connections.drain() {
                    conn.channel.close();
                }
                Err(OdbError::Disconnected)
            }
        }
    }

    fn dependent_ready(&mut self, guid: Guid, conn_identity: ObjectId, identity_root: u32) -> OdbResult<()> {
        let Some((id, nested)) = self.identity_requests.remove(&guid) else {
            return Ok(());
        };
        let Some(conn) = self.connections.get_mut(&id) else {
            // the downstream left while we waited
            return self.send_upstream(ClientToServer::DropDependentConnectionId { conn_identity });
        };

        match nested {
            None => {
                conn.identity = Some(conn_identity);
                conn.view_horizon = Some(self.current_tid);
                tracing::info!("downstream {} initialized as {}", id, conn_identity);
                conn.channel.send_message(ServerToClient::Initialize {
                    transaction_num: self.current_tid,
                    conn_identity,
                    identity_root,
                });
            }
            Some(downstream_guid) => {
                conn.dependents.insert(conn_identity);
                conn.channel.send_message(ServerToClient::DependentConnectionId {
                    guid: downstream_guid,
                    conn_identity,
                    identity_root,
                });
            }
        }
        Ok(())
    }

    fn upstream_complete(&mut self, ty: TypeKey, tid: Tid) -> OdbResult<()> {
        if !matches!(self.subscriptions.get(&ty), Some(UpstreamSubscription::Streaming { .. })) {
            return Ok(());
        }
        let Some(UpstreamSubscription::Streaming {
            started,
            values,
            index_values,
            waiting,
        }) = self.subscriptions.insert(ty.clone(), UpstreamSubscription::Complete)
        else {
            return Ok(());
        };

        let applied = self.mirror.apply_snapshot(values, index_values, started, tid);
        tracing::debug!("mirroring {} ({} slots at {})", ty, applied, tid);

        let mut released = Vec::new();
        for (id, key, lazy) in waiting {
            if !self.connections.contains_key(&id) {
                continue;
            }
            self.serve(id, ty.clone(), key, lazy)?;
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.pending_subscriptions = conn.pending_subscriptions.saturating_sub(1);
            }
            released.push(id);
        }
        for id in released {
            self.release_held(id)?;
        }
        Ok(())
    }

    /// The downstream channel whose commit produced these writes
    fn committer_of(&mut self, writes: &Writes) -> Option<ChannelId> {
        let inflight = self.inflight.iter_mut().find(|i| {
            !i.matched
                && !i.writes.is_empty()
                && i.writes.iter().all(|(k, v)| writes.get(k) == Some(v))
        })?;
        inflight.matched = true;
        Some(inflight.channel)
    }

    /// Apply an upstream transaction and pass it on
    fn replay(&mut self, writes: Writes, set_adds: SetDeltas, set_removes: SetDeltas, tid: Tid) -> OdbResult<()> {
        let committer = self.committer_of(&writes);

        let prior_keys: Vec<ObjectFieldId> = writes
            .keys()
            .filter(|k| {
                self.catalog
                    .type_of(k.field)
                    .map_or(false, |t| self.registry.has_lazy_interest(&t))
            })
            .copied()
            .collect();
        let priors = self.mirror.priors(prior_keys);

        self.mirror.apply_transaction(&writes, &set_adds, &set_removes, tid);
        self.current_tid = self.current_tid.max(tid);

        let fanouts = self
            .registry
            .route(&self.catalog, committer, &writes, &set_adds, &set_removes);
        for fanout in fanouts {
            self.deliver(fanout, tid, &priors);
        }
        Ok(())
    }

    fn deliver(&self, fanout: Fanout, tid: Tid, priors: &Writes) {
        let Some(conn) = self.connections.get(&fanout.channel) else {
            return;
        };
        if conn.identity.is_none() {
            return;
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

            let fields = self.catalog.type_fields(&field.type_key());
            let (values, index_values) = self.mirror.object_values(&fields, oids, true);
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
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use parking_lot::Mutex;

    use odb_core::{FieldDefinition, FieldId, TypeDefinition};
    use odb_transport::{Handler, OnClosed};

    use super::*;

    #[derive(Default)]
    struct RecordingUpstream {
        sent: Mutex<Vec<ClientToServer>>,
    }

    impl RecordingUpstream {
        fn take(&self) -> Vec<ClientToServer> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl UpstreamChannel for RecordingUpstream {
        fn send_message(&self, message: ClientToServer) {
            self.sent.lock().push(message);
        }

        fn set_handler(&self, _handler: Handler<ServerToClient>) {}

        fn close(&self) {}
    }

    #[derive(Default)]
    struct RecordingDownstream {
        sent: Mutex<Vec<ServerToClient>>,
    }

    impl RecordingDownstream {
        fn take(&self) -> Vec<ServerToClient> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl DownstreamChannel for RecordingDownstream {
        fn send_message(&self, message: ServerToClient) {
            self.sent.lock().push(message);
        }

        fn set_handler(&self, _handler: Handler<ClientToServer>) {}

        fn set_on_closed(&self, _on_closed: OnClosed) {}

        fn close(&self) {}
    }

    const PROXY_ID: ObjectId = ObjectId(100);

    fn counter_schema() -> SchemaDefinition {
        SchemaDefinition::new().with_type("Counter", TypeDefinition::new().index("k").field("x"))
    }

    fn counter_mapping() -> FieldMapping {
        FieldMapping::from([
            (FieldDefinition::new("app", "Counter", " exists"), FieldId::new(10)),
            (FieldDefinition::new("app", "Counter", "k"), FieldId::new(11)),
            (FieldDefinition::new("app", "Counter", "x"), FieldId::new(12)),
        ])
    }

    fn proxy() -> (Proxy, Arc<RecordingUpstream>) {
        let upstream = Arc::new(RecordingUpstream::default());
        let mut proxy = Proxy::new(ProxyConfig::default(), upstream.clone());
        proxy
            .handle_upstream(ServerToClient::Initialize {
                transaction_num: Tid::new(3),
                conn_identity: PROXY_ID,
                identity_root: 1,
            })
            .unwrap();
        upstream.take();
        (proxy, upstream)
    }

    /// Attach, authenticate and initialize downstream `n`
    fn downstream(proxy: &mut Proxy, upstream: &RecordingUpstream, n: u64) -> Arc<RecordingDownstream> {
        let channel = Arc::new(RecordingDownstream::default());
        let id = ChannelId::new(n);
        proxy.attach(id, channel.clone());
        proxy
            .handle_downstream(id, ClientToServer::Authenticate { token: String::new() })
            .unwrap();

        let guid = match upstream.take().pop() {
            Some(ClientToServer::RequestDependentConnectionId { parent, guid }) => {
                assert_eq!(parent, PROXY_ID);
                guid
            }
            other => panic!("unexpected {:?}", other),
        };
        proxy
            .handle_upstream(ServerToClient::DependentConnectionId {
                guid,
                conn_identity: ObjectId(n * 1000),
                identity_root: n as u32 + 1,
            })
            .unwrap();
        match channel.take().pop() {
            Some(ServerToClient::Initialize { conn_identity, .. }) => {
                assert_eq!(conn_identity, ObjectId(n * 1000))
            }
            other => panic!("unexpected {:?}", other),
        }
        channel
    }

    fn define_counter(proxy: &mut Proxy, upstream: &RecordingUpstream, n: u64) {
        proxy
            .handle_downstream(
                ChannelId::new(n),
                ClientToServer::DefineSchema {
                    name: "app".into(),
                    definition: counter_schema(),
                },
            )
            .unwrap();
        if upstream
            .take()
            .iter()
            .any(|m| matches!(m, ClientToServer::DefineSchema { .. }))
        {
            proxy
                .handle_upstream(ServerToClient::SchemaMapping {
                    schema: "app".into(),
                    mapping: counter_mapping(),
                })
                .unwrap();
        }
    }

    fn subscribe(proxy: &mut Proxy, n: u64) {
        proxy
            .handle_downstream(
                ChannelId::new(n),
                ClientToServer::Subscribe {
                    schema: "app".into(),
                    typename: "Counter".into(),
                    fieldname_and_value: None,
                    is_lazy: false,
                },
            )
            .unwrap();
    }

    fn complete_upstream(proxy: &mut Proxy) {
        proxy
            .handle_upstream(ServerToClient::SubscriptionComplete {
                schema: "app".into(),
                typename: "Counter".into(),
                fieldname_and_value: None,
                tid: Tid::new(3),
            })
            .unwrap();
    }

    fn create(oid: ObjectId) -> (Writes, SetDeltas) {
        let marker = Bytes::from_static(&[1]);
        let writes = Writes::from([
            (ObjectFieldId::value(oid, FieldId::new(10)), Some(marker.clone())),
            (ObjectFieldId::index(oid, FieldId::new(10)), Some(marker)),
            (ObjectFieldId::value(oid, FieldId::new(12)), Some(Bytes::from_static(b"x"))),
        ]);
        let adds = SetDeltas::from([(IndexId::exists(FieldId::new(10)), vec![oid])]);
        (writes, adds)
    }

    #[test]
    fn test_schema_defined_upstream_once() {
        let (mut proxy, upstream) = proxy();
        let a = downstream(&mut proxy, &upstream, 1);
        let b = downstream(&mut proxy, &upstream, 2);

        define_counter(&mut proxy, &upstream, 1);
        assert!(matches!(a.take().pop(), Some(ServerToClient::SchemaMapping { .. })));

        proxy
            .handle_downstream(
                ChannelId::new(2),
                ClientToServer::DefineSchema {
                    name: "app".into(),
                    definition: counter_schema(),
                },
            )
            .unwrap();
        assert!(upstream.take().is_empty());
        match b.take().pop() {
            Some(ServerToClient::SchemaMapping { mapping, .. }) => {
                assert_eq!(mapping, counter_mapping())
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_one_upstream_subscription_per_type() {
        let (mut proxy, upstream) = proxy();
        let a = downstream(&mut proxy, &upstream, 1);
        let b = downstream(&mut proxy, &upstream, 2);
        define_counter(&mut proxy, &upstream, 1);
        a.take();

        subscribe(&mut proxy, 1);
        subscribe(&mut proxy, 2);
        let subscribes = upstream
            .take()
            .into_iter()
            .filter(|m| matches!(m, ClientToServer::Subscribe { .. }))
            .count();
        assert_eq!(subscribes, 1);
        assert_eq!(proxy.upstream_subscription_count(), 1);

        // nothing reaches downstream before the upstream completes
        assert!(a.take().is_empty());
        complete_upstream(&mut proxy);
        for channel in [&a, &b] {
            assert!(matches!(
                channel.take().pop(),
                Some(ServerToClient::SubscriptionComplete { .. })
            ));
        }

        // a write reaches each subscriber once
        let (writes, adds) = create(ObjectId(77));
        proxy
            .handle_upstream(ServerToClient::Transaction {
                writes,
                set_adds: adds,
                set_removes: SetDeltas::new(),
                transaction_id: Tid::new(4),
            })
            .unwrap();
        for channel in [&a, &b] {
            let sent = channel.take();
            assert_eq!(sent.len(), 1);
            assert!(matches!(sent[0], ServerToClient::Transaction { .. }));
        }
    }

    #[test]
    fn test_subscribe_none_prewarms_upstream() {
        let (mut proxy, upstream) = proxy();
        let a = downstream(&mut proxy, &upstream, 1);
        let b = downstream(&mut proxy, &upstream, 2);
        define_counter(&mut proxy, &upstream, 1);
        a.take();

        let prewarm = ClientToServer::SubscribeNone {
            schema: "app".into(),
            typename: "Counter".into(),
        };
        proxy.handle_downstream(ChannelId::new(1), prewarm.clone()).unwrap();
        proxy.handle_downstream(ChannelId::new(2), prewarm).unwrap();
        assert_eq!(
            upstream.take(),
            vec![ClientToServer::Subscribe {
                schema: "app".into(),
                typename: "Counter".into(),
                fieldname_and_value: None,
                is_lazy: false,
            }]
        );
        assert!(matches!(
            a.take().as_slice(),
            [ServerToClient::SubscriptionComplete { fieldname_and_value: None, .. }]
        ));
        b.take();

        // a real subscription rides on the pre-warmed one
        subscribe(&mut proxy, 2);
        assert!(upstream.take().is_empty());
        assert!(b.take().is_empty());
        complete_upstream(&mut proxy);
        assert!(matches!(
            b.take().pop(),
            Some(ServerToClient::SubscriptionComplete { .. })
        ));
        assert!(a.take().is_empty());
    }

    #[test]
    fn test_identity_subscription_served_from_mirror() {
        let (mut proxy, upstream) = proxy();
        let a = downstream(&mut proxy, &upstream, 1);
        let b = downstream(&mut proxy, &upstream, 2);
        define_counter(&mut proxy, &upstream, 1);
        subscribe(&mut proxy, 1);
        complete_upstream(&mut proxy);
        for oid in [ObjectId(77), ObjectId(78)] {
            let (writes, adds) = create(oid);
            proxy
                .handle_upstream(ServerToClient::Transaction {
                    writes,
                    set_adds: adds,
                    set_removes: SetDeltas::new(),
                    transaction_id: Tid::new(oid.0),
                })
                .unwrap();
        }
        a.take();
        upstream.take();

        let key = Some(odb_core::identity_key(ObjectId(77)));
        proxy
            .handle_downstream(
                ChannelId::new(2),
                ClientToServer::Subscribe {
                    schema: "app".into(),
                    typename: "Counter".into(),
                    fieldname_and_value: key.clone(),
                    is_lazy: false,
                },
            )
            .unwrap();
        assert!(upstream.take().is_empty());
        match b.take().as_slice() {
            [ServerToClient::SubscriptionData {
                values,
                identities,
                fieldname_and_value,
                ..
            }, ServerToClient::SubscriptionComplete { .. }] => {
                assert_eq!(fieldname_and_value, &key);
                assert_eq!(identities.as_deref(), Some(&[ObjectId(77)][..]));
                assert_eq!(
                    values[&ObjectFieldId::value(ObjectId(77), FieldId::new(12))],
                    Some(Bytes::from_static(b"x"))
                );
            }
            other => panic!("unexpected {:?}", other),
        }

        let touch = |oid| Writes::from([(ObjectFieldId::value(oid, FieldId::new(12)), None)]);
        for (oid, tid) in [(ObjectId(78), 80), (ObjectId(77), 81)] {
            proxy
                .handle_upstream(ServerToClient::Transaction {
                    writes: touch(oid),
                    set_adds: SetDeltas::new(),
                    set_removes: SetDeltas::new(),
                    transaction_id: Tid::new(tid),
                })
                .unwrap();
        }
        match b.take().as_slice() {
            [ServerToClient::Transaction { transaction_id, .. }] => {
                assert_eq!(*transaction_id, Tid::new(81))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_view_horizon_follows_oldest_downstream() {
        let (mut proxy, upstream) = proxy();
        downstream(&mut proxy, &upstream, 1);
        downstream(&mut proxy, &upstream, 2);
        proxy
            .handle_upstream(ServerToClient::Transaction {
                writes: Writes::new(),
                set_adds: SetDeltas::new(),
                set_removes: SetDeltas::new(),
                transaction_id: Tid::new(10),
            })
            .unwrap();

        let report = |proxy: &mut Proxy, n: u64, tid: u64| {
            proxy
                .handle_downstream(ChannelId::new(n), ClientToServer::ViewHorizon { tid: Tid::new(tid) })
                .unwrap();
        };
        let horizons = |upstream: &RecordingUpstream| -> Vec<Tid> {
            upstream
                .take()
                .into_iter()
                .filter_map(|m| match m {
                    ClientToServer::ViewHorizon { tid } => Some(tid),
                    _ => None,
                })
                .collect()
        };

        // both downstreams still hold views from tid 3
        report(&mut proxy, 1, 8);
        assert!(horizons(&upstream).is_empty());
        report(&mut proxy, 2, 6);
        assert_eq!(horizons(&upstream), vec![Tid::new(6)]);

        proxy.detach(ChannelId::new(2)).unwrap();
        assert_eq!(horizons(&upstream), vec![Tid::new(8)]);

        // clamped to what the proxy has seen
        report(&mut proxy, 1, 50);
        assert_eq!(horizons(&upstream), vec![Tid::new(10)]);
        report(&mut proxy, 1, 9);
        assert!(horizons(&upstream).is_empty());
    }

    #[test]
    fn test_transactions_held_while_subscribing() {
        let (mut proxy, upstream) = proxy();
        let a = downstream(&mut proxy, &upstream, 1);
        define_counter(&mut proxy, &upstream, 1);
        a.take();

        subscribe(&mut proxy, 1);
        upstream.take();
        proxy
            .handle_downstream(ChannelId::new(1), ClientToServer::Flush { guid: Guid::new(5) })
            .unwrap();
        assert!(upstream.take().is_empty());

        complete_upstream(&mut proxy);
        let flushed = match upstream.take().pop() {
            Some(ClientToServer::Flush { guid }) => guid,
            other => panic!("unexpected {:?}", other),
        };
        proxy
            .handle_upstream(ServerToClient::FlushResponse { guid: flushed })
            .unwrap();
        assert_eq!(
            a.take().pop(),
            Some(ServerToClient::FlushResponse { guid: Guid::new(5) })
        );
    }

    #[test]
    fn test_commit_guids_are_remapped() {
        let (mut proxy, upstream) = proxy();
        let a = downstream(&mut proxy, &upstream, 1);
        define_counter(&mut proxy, &upstream, 1);
        a.take();

        let (writes, adds) = create(ObjectId(5));
        proxy
            .handle_downstream(
                ChannelId::new(1),
                ClientToServer::TransactionData {
                    writes: writes.clone(),
                    set_adds: adds.clone(),
                    set_removes: SetDeltas::new(),
                    key_versions: Vec::new(),
                    index_versions: Vec::new(),
                    transaction_guid: Guid::new(1),
                },
            )
            .unwrap();
        proxy
            .handle_downstream(
                ChannelId::new(1),
                ClientToServer::CompleteTransaction {
                    as_of_version: Tid::new(3),
                    transaction_guid: Guid::new(1),
                },
            )
            .unwrap();

        let sent = upstream.take();
        let upstream_guid = match &sent[1] {
            ClientToServer::CompleteTransaction { transaction_guid, .. } => *transaction_guid,
            other => panic!("unexpected {:?}", other),
        };
        assert_ne!(upstream_guid, Guid::new(1));

        // the committer sees its own writes without subscribing
        proxy
            .handle_upstream(ServerToClient::Transaction {
                writes,
                set_adds: adds,
                set_removes: SetDeltas::new(),
                transaction_id: Tid::new(4),
            })
            .unwrap();
        proxy
            .handle_upstream(ServerToClient::TransactionResult {
                transaction_guid: upstream_guid,
                success: true,
                bad_key: None,
            })
            .unwrap();

        let sent = a.take();
        assert!(matches!(sent[0], ServerToClient::Transaction { .. }));
        assert_eq!(
            sent[1],
            ServerToClient::TransactionResult {
                transaction_guid: Guid::new(1),
                success: true,
                bad_key: None,
            }
        );
    }

    #[test]
    fn test_dropped_downstream_releases_its_id() {
        let (mut proxy, upstream) = proxy();
        downstream(&mut proxy, &upstream, 1);
        proxy.detach(ChannelId::new(1)).unwrap();
        assert_eq!(
            upstream.take(),
            vec![ClientToServer::DropDependentConnectionId {
                conn_identity: ObjectId(1000)
            }]
        );
        assert_eq!(proxy.connection_count(), 0);
    }

    #[test]
    fn test_bad_token_is_dropped() {
        let upstream = Arc::new(RecordingUpstream::default());
        let mut proxy = Proxy::new(ProxyConfig::default().with_auth_token("t"), upstream);
        proxy.attach(ChannelId::new(1), Arc::new(RecordingDownstream::default()));
        proxy
            .handle_downstream(ChannelId::new(1), ClientToServer::Authenticate { token: "x".into() })
            .unwrap();
        assert_eq!(proxy.connection_count(), 0);
    }

    #[test]
    fn test_upstream_loss_is_fatal() {
        let (mut proxy, upstream) = proxy();
        downstream(&mut proxy, &upstream, 1);
        assert!(matches!(
            proxy.handle_upstream(ServerToClient::Disconnected),
            Err(OdbError::Disconnected)
        ));
        assert!(proxy.is_upstream_lost());
        assert_eq!(proxy.connection_count(), 0);
    }
}
