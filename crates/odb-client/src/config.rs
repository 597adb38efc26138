//! Client configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use odb_core::{opt_duration_str, HeartbeatConfig};

/// Settings for one [`DatabaseConnection`](crate::DatabaseConnection)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Presented in `Authenticate`
    pub auth_token: String,
    pub heartbeat: HeartbeatConfig,
    /// How long to wait for `Initialize`; `None` waits forever
    #[serde(with = "opt_duration_str")]
    pub connect_timeout: Option<Duration>,
    /// Advisory bound on blocking requests (schemas, subscriptions,
    /// flushes, lazy loads, commits)
    #[serde(with = "opt_duration_str")]
    pub request_timeout: Option<Duration>,
    /// Attempts made by `transact` before a conflict is returned
    pub max_retries: usize,
    /// Writes per `TransactionData` message
    pub transaction_chunk_size: usize,
    /// Applied transactions between cache collections
    pub cache_gc_every: u64,
}

impl ConnectionConfig {
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = token.into();
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    pub fn with_transaction_chunk_size(mut self, size: usize) -> Self {
        self.transaction_chunk_size = size.max(1);
        self
    }

    pub fn with_cache_gc_every(mut self, transactions: u64) -> Self {
        self.cache_gc_every = transactions.max(1);
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            auth_token: String::new(),
            heartbeat: HeartbeatConfig::default(),
            connect_timeout: Some(Duration::from_secs(30)),
            request_timeout: Some(Duration::from_secs(60)),
            max_retries: 100,
            transaction_chunk_size: 10_000,
            cache_gc_every: 1000,
        }
    }
}
