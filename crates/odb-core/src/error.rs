//! Error types for ODB

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::{FieldId, IndexId, ObjectFieldId, ObjectId, Tid};

/// The key that made a commit fail validation
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum BadKey {
    Field(ObjectFieldId),
    Index(IndexId),
    Other(String),
}

impl fmt::Debug for BadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BadKey::Field(key) => write!(f, "{:?}", key),
            BadKey::Index(index) => write!(f, "{:?}", index),
            BadKey::Other(reason) => write!(f, "{}", reason),
        }
    }
}

/// Core ODB errors
#[derive(Error, Debug, Clone)]
pub enum OdbError {
    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Unknown message tag: {0}")]
    UnknownMessageTag(u8),

    #[error("Frame corrupted: length {declared} repeated as {repeated}")]
    Corruption { declared: u32, repeated: u32 },

    #[error("Frame too large: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Transaction errors
    #[error("Revision conflict on {0:?}")]
    RevisionConflict(Option<BadKey>),

    #[error("Version {requested} is older than the collection horizon {horizon}")]
    VersionTooOld { requested: Tid, horizon: Tid },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // Data errors
    #[error("Object {0} does not exist")]
    ObjectDoesntExist(ObjectId),

    #[error("Not subscribed to {schema}.{typename} ({detail})")]
    NotSubscribed {
        schema: String,
        typename: String,
        detail: String,
    },

    #[error("Unknown schema: {0}")]
    UnknownSchema(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Unknown field id: {0}")]
    UnknownFieldId(FieldId),

    // Connection errors
    #[error("Disconnected")]
    Disconnected,

    #[error("Authentication failed")]
    AuthenticationFailure,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Message bus is not running")]
    BusNotRunning,

    // Runtime errors
    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Reactor would block forever: no reads, no timeout and no wakeup")]
    Deadlock,

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl OdbError {
    /// Whether this error is a lost optimistic race worth retrying
    pub fn is_conflict(&self) -> bool {
        matches!(self, OdbError::RevisionConflict(_))
    }
}

/// Result type for ODB operations
pub type OdbResult<T> = Result<T, OdbError>;
