//! Bus configuration

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use odb_core::{OdbError, OdbResult};
use odb_wire::DEFAULT_MAX_FRAME_SIZE;

/// Host and port of a listening bus
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    /// Loopback with an ephemeral port
    pub fn localhost() -> Self {
        Endpoint::new("127.0.0.1", 0)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = OdbError;

    fn from_str(s: &str) -> OdbResult<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| OdbError::Config(format!("endpoint without port: {}", s)))?;
        let port = port
            .parse()
            .map_err(|_| OdbError::Config(format!("bad port in endpoint: {}", s)))?;
        Ok(Endpoint::new(host, port))
    }
}

/// Where the listener's certificate comes from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateConfig {
    /// Generate a fresh self-signed certificate at startup
    SelfSigned { hostnames: Vec<String> },
    /// DER-encoded certificate chain and private key on disk
    DerFiles {
        cert_chain: Vec<PathBuf>,
        private_key: PathBuf,
    },
}

impl Default for CertificateConfig {
    fn default() -> Self {
        CertificateConfig::SelfSigned {
            hostnames: vec!["localhost".into()],
        }
    }
}

/// TLS settings. Clients encrypt but do not verify the server chain.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub certificate: CertificateConfig,
}

/// Message bus configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Token a connecting peer must send as its first frame
    pub auth_token: Option<String>,
    /// Repeat each frame's length after its payload
    pub extra_message_size_check: bool,
    /// Unflushed outbound bytes before senders block
    pub max_write_queue_bytes: usize,
    /// Largest accepted frame payload
    pub max_frame_size: usize,
    /// Socket read size
    pub read_buffer_size: usize,
    pub tls: TlsConfig,
}

impl BusConfig {
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_extra_message_size_check(mut self, enabled: bool) -> Self {
        self.extra_message_size_check = enabled;
        self
    }

    pub fn with_max_write_queue_bytes(mut self, bytes: usize) -> Self {
        self.max_write_queue_bytes = bytes;
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig {
            auth_token: None,
            extra_message_size_check: true,
            max_write_queue_bytes: 64 * 1024 * 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: 64 * 1024,
            tls: TlsConfig::default(),
        }
    }
}
