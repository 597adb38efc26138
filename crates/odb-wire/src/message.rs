//! Protocol messages
//!
//! Both message sets are closed: each variant is encoded as one tag byte
//! followed by its fields in declaration order.

use bytes::{BufMut, Bytes, BytesMut};

use odb_core::{
    BadKey, FieldMapping, Guid, IndexId, IndexValue, ObjectFieldId, ObjectId, OdbError,
    OdbResult, SchemaDefinition, SetDeltas, Tid, Writes,
};

use crate::{from_bytes, to_bytes, Wire};

/// Optional (fieldname, value) key of an index subscription
pub type IndexKey = Option<(String, IndexValue)>;

/// Messages sent by clients (and proxies) to the authority
#[derive(Clone, Debug, PartialEq)]
pub enum ClientToServer {
    TransactionData {
        writes: Writes,
        set_adds: SetDeltas,
        set_removes: SetDeltas,
        key_versions: Vec<ObjectFieldId>,
        index_versions: Vec<IndexId>,
        transaction_guid: Guid,
    },
    CompleteTransaction {
        as_of_version: Tid,
        transaction_guid: Guid,
    },
    Heartbeat,
    DefineSchema {
        name: String,
        definition: SchemaDefinition,
    },
    LoadLazyObject {
        schema: String,
        typename: String,
        identity: ObjectId,
    },
    Subscribe {
        schema: String,
        typename: String,
        fieldname_and_value: IndexKey,
        is_lazy: bool,
    },
    Flush {
        guid: Guid,
    },
    Authenticate {
        token: String,
    },
    RequestDependentConnectionId {
        parent: ObjectId,
        guid: Guid,
    },
    DropDependentConnectionId {
        conn_identity: ObjectId,
    },
    SubscribeNone {
        schema: String,
        typename: String,
    },
    /// Every View the sender still holds, and every commit it will still
    /// send, is at or after `tid`
    ViewHorizon {
        tid: Tid,
    },
}

/// Messages sent by the authority (and proxies) to clients
#[derive(Clone, Debug, PartialEq)]
pub enum ServerToClient {
    Initialize {
        transaction_num: Tid,
        conn_identity: ObjectId,
        identity_root: u32,
    },
    TransactionResult {
        transaction_guid: Guid,
        success: bool,
        bad_key: Option<BadKey>,
    },
    SchemaMapping {
        schema: String,
        mapping: FieldMapping,
    },
    FlushResponse {
        guid: Guid,
    },
    SubscriptionData {
        schema: String,
        typename: String,
        fieldname_and_value: IndexKey,
        values: Writes,
        index_values: Writes,
        identities: Option<Vec<ObjectId>>,
    },
    LazyTransactionPriors {
        writes: Writes,
    },
    LazyLoadResponse {
        identity: ObjectId,
        values: Writes,
    },
    LazySubscriptionData {
        schema: String,
        typename: String,
        fieldname_and_value: IndexKey,
        identities: Vec<ObjectId>,
        index_values: Writes,
    },
    SubscriptionComplete {
        schema: String,
        typename: String,
        fieldname_and_value: IndexKey,
        tid: Tid,
    },
    SubscriptionIncrease {
        schema: String,
        typename: String,
        fieldname_and_value: IndexKey,
        identities: Vec<ObjectId>,
        transaction_id: Tid,
    },
    Disconnected,
    Transaction {
        writes: Writes,
        set_adds: SetDeltas,
        set_removes: SetDeltas,
        transaction_id: Tid,
    },
    DependentConnectionId {
        guid: Guid,
        conn_identity: ObjectId,
        identity_root: u32,
    },
}

/// A closed message set that travels in frames
pub trait WireMessage: Wire + Clone + std::fmt::Debug + Send + 'static {
    /// Short variant name for logs
    fn kind(&self) -> &'static str;

    fn to_payload(&self) -> Bytes {
        to_bytes(self)
    }

    fn from_payload(payload: Bytes) -> OdbResult<Self> {
        from_bytes(payload)
    }
}

mod tag {
    pub const TRANSACTION_DATA: u8 = 0x01;
    pub const COMPLETE_TRANSACTION: u8 = 0x02;
    pub const HEARTBEAT: u8 = 0x03;
    pub const DEFINE_SCHEMA: u8 = 0x04;
    pub const LOAD_LAZY_OBJECT: u8 = 0x05;
    pub const SUBSCRIBE: u8 = 0x06;
    pub const FLUSH: u8 = 0x07;
    pub const AUTHENTICATE: u8 = 0x08;
    pub const REQUEST_DEPENDENT: u8 = 0x09;
    pub const DROP_DEPENDENT: u8 = 0x0A;
    pub const SUBSCRIBE_NONE: u8 = 0x0B;
    pub const VIEW_HORIZON: u8 = 0x0C;

    pub const INITIALIZE: u8 = 0x81;
    pub const TRANSACTION_RESULT: u8 = 0x82;
    pub const SCHEMA_MAPPING: u8 = 0x83;
    pub const FLUSH_RESPONSE: u8 = 0x84;
    pub const SUBSCRIPTION_DATA: u8 = 0x85;
    pub const LAZY_PRIORS: u8 = 0x86;
    pub const LAZY_LOAD_RESPONSE: u8 = 0x87;
    pub const LAZY_SUBSCRIPTION_DATA: u8 = 0x88;
    pub const SUBSCRIPTION_COMPLETE: u8 = 0x89;
    pub const SUBSCRIPTION_INCREASE: u8 = 0x8A;
    pub const DISCONNECTED: u8 = 0x8B;
    pub const TRANSACTION: u8 = 0x8C;
    pub const DEPENDENT_CONNECTION_ID: u8 = 0x8D;
}

impl Wire for ClientToServer {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            ClientToServer::TransactionData {
                writes,
                set_adds,
                set_removes,
                key_versions,
                index_versions,
                transaction_guid,
            } => {
                buf.put_u8(tag::TRANSACTION_DATA);
                writes.encode(buf);
                set_adds.encode(buf);
                set_removes.encode(buf);
                key_versions.encode(buf);
                index_versions.encode(buf);
                transaction_guid.encode(buf);
            }
            ClientToServer::CompleteTransaction {
                as_of_version,
                transaction_guid,
            } => {
                buf.put_u8(tag::COMPLETE_TRANSACTION);
                as_of_version.encode(buf);
                transaction_guid.encode(buf);
            }
            ClientToServer::Heartbeat => buf.put_u8(tag::HEARTBEAT),
            ClientToServer::DefineSchema { name, definition } => {
                buf.put_u8(tag::DEFINE_SCHEMA);
                name.encode(buf);
                definition.encode(buf);
            }
            ClientToServer::LoadLazyObject {
                schema,
                typename,
                identity,
            } => {
                buf.put_u8(tag::LOAD_LAZY_OBJECT);
                schema.encode(buf);
                typename.encode(buf);
                identity.encode(buf);
            }
            ClientToServer::Subscribe {
                schema,
                typename,
                fieldname_and_value,
                is_lazy,
            } => {
                buf.put_u8(tag::SUBSCRIBE);
                schema.encode(buf);
                typename.encode(buf);
                fieldname_and_value.encode(buf);
                is_lazy.encode(buf);
            }
            ClientToServer::Flush { guid } => {
                buf.put_u8(tag::FLUSH);
                guid.encode(buf);
            }
            ClientToServer::Authenticate { token } => {
                buf.put_u8(tag::AUTHENTICATE);
                token.encode(buf);
            }
            ClientToServer::RequestDependentConnectionId { parent, guid } => {
                buf.put_u8(tag::REQUEST_DEPENDENT);
                parent.encode(buf);
                guid.encode(buf);
            }
            ClientToServer::DropDependentConnectionId { conn_identity } => {
                buf.put_u8(tag::DROP_DEPENDENT);
                conn_identity.encode(buf);
            }
            ClientToServer::SubscribeNone { schema, typename } => {
                buf.put_u8(tag::SUBSCRIBE_NONE);
                schema.encode(buf);
                typename.encode(buf);
            }
            ClientToServer::ViewHorizon { tid } => {
                buf.put_u8(tag::VIEW_HORIZON);
                tid.encode(buf);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        let msg = match u8::decode(buf)? {
            tag::TRANSACTION_DATA => ClientToServer::TransactionData {
                writes: Wire::decode(buf)?,
                set_adds: Wire::decode(buf)?,
                set_removes: Wire::decode(buf)?,
                key_versions: Wire::decode(buf)?,
                index_versions: Wire::decode(buf)?,
                transaction_guid: Wire::decode(buf)?,
            },
            tag::COMPLETE_TRANSACTION => ClientToServer::CompleteTransaction {
                as_of_version: Wire::decode(buf)?,
                transaction_guid: Wire::decode(buf)?,
            },
            tag::HEARTBEAT => ClientToServer::Heartbeat,
            tag::DEFINE_SCHEMA => ClientToServer::DefineSchema {
                name: Wire::decode(buf)?,
                definition: Wire::decode(buf)?,
            },
            tag::LOAD_LAZY_OBJECT => ClientToServer::LoadLazyObject {
                schema: Wire::decode(buf)?,
                typename: Wire::decode(buf)?,
                identity: Wire::decode(buf)?,
            },
            tag::SUBSCRIBE => ClientToServer::Subscribe {
                schema: Wire::decode(buf)?,
                typename: Wire::decode(buf)?,
                fieldname_and_value: Wire::decode(buf)?,
                is_lazy: Wire::decode(buf)?,
            },
            tag::FLUSH => ClientToServer::Flush {
                guid: Wire::decode(buf)?,
            },
            tag::AUTHENTICATE => ClientToServer::Authenticate {
                token: Wire::decode(buf)?,
            },
            tag::REQUEST_DEPENDENT => ClientToServer::RequestDependentConnectionId {
                parent: Wire::decode(buf)?,
                guid: Wire::decode(buf)?,
            },
            tag::DROP_DEPENDENT => ClientToServer::DropDependentConnectionId {
                conn_identity: Wire::decode(buf)?,
            },
            tag::SUBSCRIBE_NONE => ClientToServer::SubscribeNone {
                schema: Wire::decode(buf)?,
                typename: Wire::decode(buf)?,
            },
            tag::VIEW_HORIZON => ClientToServer::ViewHorizon {
                tid: Wire::decode(buf)?,
            },
            other => return Err(OdbError::UnknownMessageTag(other)),
        };
        Ok(msg)
    }
}

impl WireMessage for ClientToServer {
    fn kind(&self) -> &'static str {
        match self {
            ClientToServer::TransactionData { .. } => "TransactionData",
            ClientToServer::CompleteTransaction { .. } => "CompleteTransaction",
            ClientToServer::Heartbeat => "Heartbeat",
            ClientToServer::DefineSchema { .. } => "DefineSchema",
            ClientToServer::LoadLazyObject { .. } => "LoadLazyObject",
            ClientToServer::Subscribe { .. } => "Subscribe",
            ClientToServer::Flush { .. } => "Flush",
            ClientToServer::Authenticate { .. } => "Authenticate",
            ClientToServer::RequestDependentConnectionId { .. } => "RequestDependentConnectionId",
            ClientToServer::DropDependentConnectionId { .. } => "DropDependentConnectionId",
            ClientToServer::SubscribeNone { .. } => "SubscribeNone",
            ClientToServer::ViewHorizon { .. } => "ViewHorizon",
        }
    }
}

impl Wire for ServerToClient {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            ServerToClient::Initialize {
                transaction_num,
                conn_identity,
                identity_root,
            } => {
                buf.put_u8(tag::INITIALIZE);
                transaction_num.encode(buf);
                conn_identity.encode(buf);
                identity_root.encode(buf);
            }
            ServerToClient::TransactionResult {
                transaction_guid,
                success,
                bad_key,
            } => {
                buf.put_u8(tag::TRANSACTION_RESULT);
                transaction_guid.encode(buf);
                success.encode(buf);
                bad_key.encode(buf);
            }
            ServerToClient::SchemaMapping { schema, mapping } => {
                buf.put_u8(tag::SCHEMA_MAPPING);
                schema.encode(buf);
                mapping.encode(buf);
            }
            ServerToClient::FlushResponse { guid } => {
                buf.put_u8(tag::FLUSH_RESPONSE);
                guid.encode(buf);
            }
            ServerToClient::SubscriptionData {
                schema,
                typename,
                fieldname_and_value,
                values,
                index_values,
                identities,
            } => {
                buf.put_u8(tag::SUBSCRIPTION_DATA);
                schema.encode(buf);
                typename.encode(buf);
                fieldname_and_value.encode(buf);
                values.encode(buf);
                index_values.encode(buf);
                identities.encode(buf);
            }
            ServerToClient::LazyTransactionPriors { writes } => {
                buf.put_u8(tag::LAZY_PRIORS);
                writes.encode(buf);
            }
            ServerToClient::LazyLoadResponse { identity, values } => {
                buf.put_u8(tag::LAZY_LOAD_RESPONSE);
                identity.encode(buf);
                values.encode(buf);
            }
            ServerToClient::LazySubscriptionData {
                schema,
                typename,
                fieldname_and_value,
                identities,
                index_values,
            } => {
                buf.put_u8(tag::LAZY_SUBSCRIPTION_DATA);
                schema.encode(buf);
                typename.encode(buf);
                fieldname_and_value.encode(buf);
                identities.encode(buf);
                index_values.encode(buf);
            }
            ServerToClient::SubscriptionComplete {
                schema,
                typename,
                fieldname_and_value,
                tid,
            } => {
                buf.put_u8(tag::SUBSCRIPTION_COMPLETE);
                schema.encode(buf);
                typename.encode(buf);
                fieldname_and_value.encode(buf);
                tid.encode(buf);
            }
            ServerToClient::SubscriptionIncrease {
                schema,
                typename,
                fieldname_and_value,
                identities,
                transaction_id,
            } => {
                buf.put_u8(tag::SUBSCRIPTION_INCREASE);
                schema.encode(buf);
                typename.encode(buf);
                fieldname_and_value.encode(buf);
                identities.encode(buf);
                transaction_id.encode(buf);
            }
            ServerToClient::Disconnected => buf.put_u8(tag::DISCONNECTED),
            ServerToClient::Transaction {
                writes,
                set_adds,
                set_removes,
                transaction_id,
            } => {
                buf.put_u8(tag::TRANSACTION);
                writes.encode(buf);
                set_adds.encode(buf);
                set_removes.encode(buf);
                transaction_id.encode(buf);
            }
            ServerToClient::DependentConnectionId {
                guid,
                conn_identity,
                identity_root,
            } => {
                buf.put_u8(tag::DEPENDENT_CONNECTION_ID);
                guid.encode(buf);
                conn_identity.encode(buf);
                identity_root.encode(buf);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        let msg = match u8::decode(buf)? {
            tag::INITIALIZE => ServerToClient::Initialize {
                transaction_num: Wire::decode(buf)?,
                conn_identity: Wire::decode(buf)?,
                identity_root: Wire::decode(buf)?,
            },
            tag::TRANSACTION_RESULT => ServerToClient::TransactionResult {
                transaction_guid: Wire::decode(buf)?,
                success: Wire::decode(buf)?,
                bad_key: Wire::decode(buf)?,
            },
            tag::SCHEMA_MAPPING => ServerToClient::SchemaMapping {
                schema: Wire::decode(buf)?,
                mapping: Wire::decode(buf)?,
            },
            tag::FLUSH_RESPONSE => ServerToClient::FlushResponse {
                guid: Wire::decode(buf)?,
            },
            tag::SUBSCRIPTION_DATA => ServerToClient::SubscriptionData {
                schema: Wire::decode(buf)?,
                typename: Wire::decode(buf)?,
                fieldname_and_value: Wire::decode(buf)?,
                values: Wire::decode(buf)?,
                index_values: Wire::decode(buf)?,
                identities: Wire::decode(buf)?,
            },
            tag::LAZY_PRIORS => ServerToClient::LazyTransactionPriors {
                writes: Wire::decode(buf)?,
            },
            tag::LAZY_LOAD_RESPONSE => ServerToClient::LazyLoadResponse {
                identity: Wire::decode(buf)?,
                values: Wire::decode(buf)?,
            },
            tag::LAZY_SUBSCRIPTION_DATA => ServerToClient::LazySubscriptionData {
                schema: Wire::decode(buf)?,
                typename: Wire::decode(buf)?,
                fieldname_and_value: Wire::decode(buf)?,
                identities: Wire::decode(buf)?,
                index_values: Wire::decode(buf)?,
            },
            tag::SUBSCRIPTION_COMPLETE => ServerToClient::SubscriptionComplete {
                schema: Wire::decode(buf)?,
                typename: Wire::decode(buf)?,
                fieldname_and_value: Wire::decode(buf)?,
                tid: Wire::decode(buf)?,
            },
            tag::SUBSCRIPTION_INCREASE => ServerToClient::SubscriptionIncrease {
                schema: Wire::decode(buf)?,
                typename: Wire::decode(buf)?,
                fieldname_and_value: Wire::decode(buf)?,
                identities: Wire::decode(buf)?,
                transaction_id: Wire::decode(buf)?,
            },
            tag::DISCONNECTED => ServerToClient::Disconnected,
            tag::TRANSACTION => ServerToClient::Transaction {
                writes: Wire::decode(buf)?,
                set_adds: Wire::decode(buf)?,
                set_removes: Wire::decode(buf)?,
                transaction_id: Wire::decode(buf)?,
            },
            tag::DEPENDENT_CONNECTION_ID => ServerToClient::DependentConnectionId {
                guid: Wire::decode(buf)?,
                conn_identity: Wire::decode(buf)?,
                identity_root: Wire::decode(buf)?,
            },
            other => return Err(OdbError::UnknownMessageTag(other)),
        };
        Ok(msg)
    }
}

impl WireMessage for ServerToClient {
    fn kind(&self) -> &'static str {
        match self {
            ServerToClient::Initialize { .. } => "Initialize",
            ServerToClient::TransactionResult { .. } => "TransactionResult",
            ServerToClient::SchemaMapping { .. } => "SchemaMapping",
            ServerToClient::FlushResponse { .. } => "FlushResponse",
            ServerToClient::SubscriptionData { .. } => "SubscriptionData",
            ServerToClient::LazyTransactionPriors { .. } => "LazyTransactionPriors",
            ServerToClient::LazyLoadResponse { .. } => "LazyLoadResponse",
            ServerToClient::LazySubscriptionData { .. } => "LazySubscriptionData",
            ServerToClient::SubscriptionComplete { .. } => "SubscriptionComplete",
            ServerToClient::SubscriptionIncrease { .. } => "SubscriptionIncrease",
            ServerToClient::Disconnected => "Disconnected",
            ServerToClient::Transaction { .. } => "Transaction",
            ServerToClient::DependentConnectionId { .. } => "DependentConnectionId",
        }
    }
}
