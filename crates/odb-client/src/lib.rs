//! ODB Client - Database connections
//!
//! This crate provides:
//! - `DatabaseConnection`: handshake, schema definition, subscriptions and
//!   transaction submission over any upstream channel
//! - `VersionedCache`: the replicated objects with per-slot history
//! - `View` / `Transaction`: snapshot reads and buffered writes
//! - `retry_on_conflict`: rerun a block until it commits
//! - `Reactor`: rerun a function whenever what it read changes

pub mod cache;
pub mod config;
pub mod connection;
pub mod reactor;
pub mod retry;
pub mod view;

pub use cache::*;
pub use config::*;
pub use connection::*;
pub use reactor::*;
pub use retry::*;
pub use view::*;
