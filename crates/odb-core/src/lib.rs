//! ODB Core - Fundamental types and primitives
//!
//! This crate defines the types shared by every ODB component:
//! - Identifiers (ObjectId, FieldId, Tid, Guid, ChannelId)
//! - Schema and data-model types (FieldDefinition, ObjectFieldId, IndexId)
//! - The field catalog shared by the authority, proxies and clients
//! - The error taxonomy
//! - Shared configuration (heartbeats)

pub mod catalog;
pub mod config;
pub mod error;
pub mod id;
pub mod schema;

pub use catalog::*;
pub use config::*;
pub use error::*;
pub use id::*;
pub use schema::*;
