//! ODB Proxy - Connection multiplexing
//!
//! This crate provides:
//! - `Proxy`: serves many downstream connections over one upstream
//!   connection, holding a single subscription per type and answering
//!   downstream subscriptions from its `Mirror`
//! - `ProxyHandle`: the proxy on its own thread
//! - `InMemProxy` / `TcpProxyServer`: in-process and networked front ends

pub mod actor;
pub mod config;
pub mod mirror;
pub mod proxy;
pub mod server;

pub use actor::*;
pub use config::*;
pub use mirror::*;
pub use proxy::*;
pub use server::*;
