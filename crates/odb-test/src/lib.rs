//! ODB Test Harness - Clusters, workloads and end-to-end scenarios
//!
//! This crate provides:
//! - `Cluster`: an authority plus proxies over in-memory channels
//! - `RecordingChannel`: upstream traffic capture for proxies
//! - `Worker`: seeded random write workloads
//! - End-to-end scenarios covering replication, conflicts, proxies,
//!   lazy loading, reactors and recovery

pub mod cluster;
pub mod integration;
pub mod workload;

pub use cluster::*;
pub use workload::*;
