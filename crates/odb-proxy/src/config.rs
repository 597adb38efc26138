//! Proxy configuration

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use odb_core::{HeartbeatConfig, OdbError, OdbResult};
use odb_transport::{BusConfig, Endpoint};

/// Settings of the proxy itself
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Token downstream clients must present; `None` accepts any
    pub auth_token: Option<String>,
    /// Token the proxy presents upstream
    pub upstream_token: String,
    /// Liveness of downstream connections, and of the upstream channel
    pub heartbeat: HeartbeatConfig,
    /// Objects per subscription message sent downstream
    pub subscription_chunk_size: usize,
}

impl ProxyConfig {
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_upstream_token(mut self, token: impl Into<String>) -> Self {
        self.upstream_token = token.into();
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_subscription_chunk_size(mut self, size: usize) -> Self {
        self.subscription_chunk_size = size.max(1);
        self
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            auth_token: None,
            upstream_token: String::new(),
            heartbeat: HeartbeatConfig::default(),
            subscription_chunk_size: 1000,
        }
    }
}

/// Everything the `odb-proxy` binary needs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyServerConfig {
    pub listen: Endpoint,
    pub upstream: Endpoint,
    /// Bus settings, shared by the listener and the upstream connection
    pub bus: BusConfig,
    pub proxy: ProxyConfig,
    pub log_json: bool,
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        ProxyServerConfig {
            listen: Endpoint::new("127.0.0.1", 8001),
            upstream: Endpoint::new("127.0.0.1", 8000),
            bus: BusConfig::default(),
            proxy: ProxyConfig::default(),
            log_json: false,
        }
    }
}

impl ProxyServerConfig {
    pub fn from_json(text: &str) -> OdbResult<Self> {
        serde_json::from_str(text).map_err(|e| OdbError::Config(e.to_string()))
    }

    /// Read `path` (if given) and apply environment overrides
    pub fn load(path: Option<&Path>) -> OdbResult<Self> {
        let mut config = match path {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .map_err(|e| OdbError::Config(format!("{}: {}", path.display(), e)))?;
                Self::from_json(&text)?
            }
            None => ProxyServerConfig::default(),
        };
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Apply `ODB_PROXY_*` overrides
    pub fn apply_env<I>(&mut self, vars: I) -> OdbResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "ODB_PROXY_LISTEN" => self.listen = value.parse()?,
                "ODB_PROXY_UPSTREAM" => self.upstream = value.parse()?,
                "ODB_PROXY_AUTH_TOKEN" => self.proxy.auth_token = Some(value),
                "ODB_PROXY_UPSTREAM_TOKEN" => self.proxy.upstream_token = value,
                "ODB_BUS_TOKEN" => self.bus.auth_token = Some(value),
                "ODB_PROXY_HEARTBEAT_INTERVAL" => {
                    self.proxy.heartbeat.interval = humantime::parse_duration(&value)
                        .map_err(|e| OdbError::Config(format!("{}: {}", key, e)))?
                }
                _ => {}
            }
        }
        Ok(())
    }
}
