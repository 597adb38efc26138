//! Server configuration
//!
//! `ServerConfig` is read from an optional JSON file, then individual
//! settings are overridden from `ODB_*` environment variables.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use odb_core::{duration_str, HeartbeatConfig, OdbError, OdbResult};
use odb_transport::{BusConfig, Endpoint};

/// Transaction authority settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Token clients must present in `Authenticate`; `None` accepts any
    pub auth_token: Option<String>,
    /// Liveness of attached connections
    pub heartbeat: HeartbeatConfig,
    /// Objects per streamed subscription message
    pub subscription_chunk_size: usize,
    /// Transactions of history kept for conflict checks
    pub version_retention: u64,
    /// How often the version table is pruned
    #[serde(with = "duration_str")]
    pub gc_interval: Duration,
    /// Directory receiving a replayable log of every transaction
    pub transaction_log_dir: Option<PathBuf>,
}

impl AuthorityConfig {
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
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

    pub fn with_version_retention(mut self, retention: u64) -> Self {
        self.version_retention = retention;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn with_transaction_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.transaction_log_dir = Some(dir.into());
        self
    }
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        AuthorityConfig {
            auth_token: None,
            heartbeat: HeartbeatConfig::default(),
            subscription_chunk_size: 1000,
            version_retention: 100_000,
            gc_interval: Duration::from_secs(10),
            transaction_log_dir: None,
        }
    }
}

/// Everything the `odb-server` binary needs
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: Endpoint,
    pub bus: BusConfig,
    pub authority: AuthorityConfig,
    /// `redis://` URL; in-memory storage when absent
    pub redis_url: Option<String>,
    /// Emit logs as JSON lines
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: Endpoint::new("127.0.0.1", 8000),
            bus: BusConfig::default(),
            authority: AuthorityConfig::default(),
            redis_url: None,
            log_json: false,
        }
    }
}

fn parse_bool(key: &str, value: &str) -> OdbResult<bool> {
    match value {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(OdbError::Config(format!("{}: expected a boolean, got {:?}", key, value))),
    }
}

impl ServerConfig {
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
            None => ServerConfig::default(),
        };
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    /// Apply `ODB_*` overrides; unrelated variables are ignored
    pub fn apply_env<I>(&mut self, vars: I) -> OdbResult<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "ODB_LISTEN" => self.listen = value.parse()?,
                "ODB_AUTH_TOKEN" => self.authority.auth_token = Some(value),
                "ODB_BUS_TOKEN" => self.bus.auth_token = Some(value),
                "ODB_REDIS_URL" => self.redis_url = Some(value),
                "ODB_TRANSACTION_LOG_DIR" => {
                    self.authority.transaction_log_dir = Some(PathBuf::from(value))
                }
                "ODB_TLS" => self.bus.tls.enabled = parse_bool(&key, &value)?,
                "ODB_LOG_JSON" => self.log_json = parse_bool(&key, &value)?,
                "ODB_HEARTBEAT_INTERVAL" => {
                    self.authority.heartbeat.interval = humantime_duration(&key, &value)?
                }
                "ODB_VERSION_RETENTION" => {
                    self.authority.version_retention = value.parse().map_err(|_| {
                        OdbError::Config(format!("{}: expected an integer, got {:?}", key, value))
                    })?
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn humantime_duration(key: &str, value: &str) -> OdbResult<Duration> {
    humantime::parse_duration(value).map_err(|e| OdbError::Config(format!("{}: {}", key, e)))
}
