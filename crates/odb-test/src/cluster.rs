//! In-process clusters
//!
//! A [`Cluster`] is one authority plus any number of proxies, all joined by
//! in-memory channels. Clients connect to the authority directly or through
//! a proxy. Every proxy's upstream traffic is recorded so tests can check
//! what actually reached the authority.

use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use odb_client::{ConnectionConfig, DatabaseConnection};
use odb_core::{OdbError, OdbResult, SchemaDefinition, TypeDefinition, TypeKey};
use odb_proxy::{InMemProxy, ProxyConfig};
use odb_server::{AuthorityConfig, InMemServer};
use odb_store::{MemoryPersistence, Persistence};
use odb_transport::{Handler, UpstreamChannel};
use odb_wire::{ClientToServer, ServerToClient};

/// Schema most scenarios use
pub const APP_SCHEMA: &str = "app";

/// `app.Counter`: indexed `k`, plain `x`
pub fn counter_schema() -> SchemaDefinition {
    SchemaDefinition::new().with_type("Counter", TypeDefinition::new().index("k").field("x"))
}

pub fn counter_type() -> TypeKey {
    TypeKey::new(APP_SCHEMA, "Counter")
}

static LOGGING: Once = Once::new();

/// Route `tracing` output through the test writer. `RUST_LOG` overrides
/// the default `warn` filter.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .with_test_writer()
            .try_init();
    });
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Upstream channel that keeps a copy of everything sent through it
pub struct RecordingChannel {
    inner: Arc<dyn UpstreamChannel>,
    sent: Mutex<Vec<ClientToServer>>,
}

impl RecordingChannel {
    pub fn new(inner: Arc<dyn UpstreamChannel>) -> Arc<Self> {
        Arc::new(RecordingChannel {
            inner,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<ClientToServer> {
        self.sent.lock().clone()
    }

    /// `Subscribe` messages sent for `ty`
    pub fn subscriptions_to(&self, ty: &TypeKey) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|m| {
                matches!(m, ClientToServer::Subscribe { schema, typename, .. }
                    if *schema == ty.schema && *typename == ty.typename)
            })
            .count()
    }
}

impl UpstreamChannel for RecordingChannel {
    fn send_message(&self, message: ClientToServer) {
        self.sent.lock().push(message.clone());
        self.inner.send_message(message);
    }

    fn set_handler(&self, handler: Handler<ServerToClient>) {
        self.inner.set_handler(handler);
    }

    fn close(&self) {
        self.inner.close();
    }
}

struct ProxyNode {
    proxy: InMemProxy,
    upstream: Arc<RecordingChannel>,
}

pub struct Cluster {
    server: InMemServer,
    store: Arc<dyn Persistence>,
    proxies: Vec<ProxyNode>,
    client_config: ConnectionConfig,
}

impl Cluster {
    /// Authority over a fresh in-memory store
    pub fn start() -> OdbResult<Self> {
        Self::with_store(AuthorityConfig::default(), Arc::new(MemoryPersistence::new()))
    }

    pub fn with_store(config: AuthorityConfig, store: Arc<dyn Persistence>) -> OdbResult<Self> {
        init_test_logging();
        let server = InMemServer::start(config, store.clone())?;
        Ok(Cluster {
            server,
            store,
            proxies: Vec::new(),
            client_config: ConnectionConfig::default()
                .with_connect_timeout(Some(Duration::from_secs(10)))
                .with_request_timeout(Some(Duration::from_secs(10))),
        })
    }

    /// Settings for connections opened from now on
    pub fn with_client_config(mut self, config: ConnectionConfig) -> Self {
        self.client_config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    /// Connect straight to the authority
    pub fn connect(&self) -> OdbResult<DatabaseConnection> {
        DatabaseConnection::connect(self.server.connect(), self.client_config.clone())
    }

    /// Start a proxy in front of the authority; returns its index
    pub fn add_proxy(&mut self, config: ProxyConfig) -> OdbResult<usize> {
        let upstream = RecordingChannel::new(self.server.connect());
        let proxy = InMemProxy::start(upstream.clone(), config)?;
        self.proxies.push(ProxyNode { proxy, upstream });
        Ok(self.proxies.len() - 1)
    }

    fn proxy(&self, index: usize) -> OdbResult<&ProxyNode> {
        self.proxies
            .get(index)
            .ok_or_else(|| OdbError::InvalidState(format!("no proxy {}", index)))
    }

    /// Connect through proxy `index`
    pub fn connect_via_proxy(&self, index: usize) -> OdbResult<DatabaseConnection> {
        let channel = self.proxy(index)?.proxy.connect();
        DatabaseConnection::connect(channel, self.client_config.clone())
    }

    /// What proxy `index` sent to the authority
    pub fn proxy_upstream(&self, index: usize) -> OdbResult<Arc<RecordingChannel>> {
        Ok(self.proxy(index)?.upstream.clone())
    }

    /// Connect and define [`counter_schema`], optionally subscribing to
    /// the whole type
    pub fn counter_client(&self, subscribe: bool) -> OdbResult<DatabaseConnection> {
        let db = self.connect()?;
        db.define_schema(APP_SCHEMA, &counter_schema())?;
        if subscribe {
            db.subscribe_type(APP_SCHEMA, "Counter", false)?;
        }
        Ok(db)
    }

    pub fn stop(&self) {
        for node in &self.proxies {
            node.proxy.stop();
        }
        self.server.stop();
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.stop();
    }
}
