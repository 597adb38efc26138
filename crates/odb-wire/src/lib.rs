//! ODB Wire Protocol - Binary message format
//!
//! This crate implements the wire format shared by clients, proxies and the
//! authority:
//! - Little-endian codec for core types (`Wire`)
//! - The closed client->server and server->client message sets
//! - Length-prefixed frames with an optional repeated length check

pub mod codec;
pub mod frame;
pub mod message;

pub use codec::*;
pub use frame::*;
pub use message::*;
