//! ODB Transport Layer - Message bus and channels
//!
//! This crate provides:
//! - `MessageBus`: framed, token-authenticated TCP (optionally TLS) transport
//!   running exactly two threads (multiplexed I/O, serial event delivery)
//! - Write backpressure through a shared byte budget
//! - Typed channels binding one connection to a message pair:
//!   bus-backed (`tcp`) and in-process (`memory`)

pub mod budget;
pub mod bus;
pub mod channel;
pub mod config;
pub mod memory;
pub mod tcp;
pub mod tls;

pub use budget::*;
pub use bus::*;
pub use channel::*;
pub use config::*;
pub use memory::*;
pub use tcp::*;
