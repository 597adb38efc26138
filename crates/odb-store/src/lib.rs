//! ODB Store - Pluggable persistence
//!
//! This crate provides:
//! - The `Persistence` trait the authority writes through
//! - `MemoryPersistence`, a process-local backend
//! - `KvPersistence`, a write-through cache over a replicated key-value
//!   backend, with `RedisBackend` as the production backend

pub mod kv;
pub mod memory;
pub mod persistence;
pub mod redis_backend;

pub use kv::*;
pub use memory::*;
pub use persistence::*;
pub use redis_backend::*;
