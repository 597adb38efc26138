//! ODB Server - Transaction authority
//!
//! This crate provides:
//! - `Authority`: tid allocation, conflict detection, persistence and
//!   fan-out of committed transactions to subscribers
//! - `AuthorityHandle`: the authority on its own thread, fed by channels
//! - `InMemServer` / `TcpServer`: in-process and networked front ends
//! - `StoredCatalog`: the catalog as kept in the store
//! - `VersionTable`, `SubscriptionRegistry`: the authority's bookkeeping;
//!   proxies reuse the registry

pub mod actor;
pub mod authority;
pub mod catalog;
pub mod config;
pub mod server;
pub mod subscriptions;
pub mod versions;
pub mod watcher;

pub use actor::*;
pub use authority::*;
pub use catalog::*;
pub use config::*;
pub use server::*;
pub use subscriptions::*;
pub use versions::*;
pub use watcher::*;
