//! Proxy front ends
//!
//! [`InMemProxy`] hands out in-process channels over any upstream channel;
//! [`TcpProxyServer`] connects upstream over TCP and accepts downstream
//! connections through the message bus.

use std::sync::Arc;

use odb_core::{HeartbeatConfig, OdbResult};
use odb_transport::{in_memory_channel, Endpoint, TcpChannelListener, TcpUpstreamChannel, UpstreamChannel};

use crate::{ProxyConfig, ProxyHandle, ProxyServerConfig};

/// Proxy reachable through in-process channels
pub struct InMemProxy {
    proxy: Arc<ProxyHandle>,
    heartbeat: HeartbeatConfig,
}

impl InMemProxy {
    pub fn start(upstream: Arc<dyn UpstreamChannel>, config: ProxyConfig) -> OdbResult<Self> {
        let heartbeat = config.heartbeat.clone();
        Ok(InMemProxy {
            proxy: Arc::new(ProxyHandle::spawn(config, upstream)?),
            heartbeat,
        })
    }

    /// Open a new downstream channel
    pub fn connect(&self) -> Arc<dyn UpstreamChannel> {
        let (proxy_end, client_end) = in_memory_channel(&self.heartbeat);
        self.proxy.attach(proxy_end);
        client_end
    }

    pub fn is_running(&self) -> bool {
        self.proxy.is_running()
    }

    pub fn stop(&self) {
        self.proxy.stop();
    }
}

/// Proxy between a TCP listener and a TCP upstream
pub struct TcpProxyServer {
    proxy: Arc<ProxyHandle>,
    listener: TcpChannelListener,
}

impl TcpProxyServer {
    pub fn start(config: &ProxyServerConfig) -> OdbResult<Self> {
        let upstream = TcpUpstreamChannel::connect(
            config.bus.clone(),
            config.upstream.clone(),
            &config.proxy.heartbeat,
        )?;
        tracing::info!("odb proxy connecting upstream to {}", config.upstream);
        let proxy = Arc::new(ProxyHandle::spawn(config.proxy.clone(), upstream)?);

        let accepting = proxy.clone();
        let listener = TcpChannelListener::start(config.bus.clone(), config.listen.clone(), move |channel| {
            accepting.attach(channel);
        })?;
        if let Some(endpoint) = listener.local_endpoint() {
            tracing::info!("odb proxy listening on {}", endpoint);
        }

        Ok(TcpProxyServer { proxy, listener })
    }

    /// Address actually bound
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.listener.local_endpoint()
    }

    pub fn connection_count(&self) -> usize {
        self.listener.connection_count()
    }

    pub fn is_running(&self) -> bool {
        self.proxy.is_running()
    }

    pub fn stop(&self) {
        self.listener.stop();
        self.proxy.stop();
    }
}

impl Drop for TcpProxyServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use odb_core::{core_schema, Guid, CORE_SCHEMA};
    use odb_server::{AuthorityConfig, InMemServer, ServerConfig, TcpServer};
    use odb_store::MemoryPersistence;
    use odb_wire::{ClientToServer, ServerToClient};

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn listen(channel: &Arc<dyn UpstreamChannel>) -> mpsc::Receiver<ServerToClient> {
        let (tx, rx) = mpsc::channel();
        channel.set_handler(Box::new(move |m| {
            let _ = tx.send(m);
        }));
        rx
    }

    #[test]
    fn test_inmem_proxy_hands_out_dependent_ids() {
        let server =
            InMemServer::start(AuthorityConfig::default(), Arc::new(MemoryPersistence::new()))
                .unwrap();
        let proxy = InMemProxy::start(server.connect(), ProxyConfig::default()).unwrap();

        let mut identities = Vec::new();
        let mut channels = Vec::new();
        for _ in 0..2 {
            let channel = proxy.connect();
            let rx = listen(&channel);
            channel.send_message(ClientToServer::Authenticate {
                token: String::new(),
            });
            channel.send_message(ClientToServer::Flush { guid: Guid::new(9) });
            match rx.recv_timeout(WAIT).unwrap() {
                ServerToClient::Initialize { conn_identity, .. } => identities.push(conn_identity),
                other => panic!("unexpected {:?}", other),
            }
            assert_eq!(
                rx.recv_timeout(WAIT).unwrap(),
                ServerToClient::FlushResponse { guid: Guid::new(9) }
            );
            channels.push((channel, rx));
        }
        assert_ne!(identities[0], identities[1]);

        proxy.stop();
        server.stop();
    }

    #[test]
    fn test_inmem_proxy_rejects_bad_token() {
        let server =
            InMemServer::start(AuthorityConfig::default(), Arc::new(MemoryPersistence::new()))
                .unwrap();
        let proxy =
            InMemProxy::start(server.connect(), ProxyConfig::default().with_auth_token("secret"))
                .unwrap();

        let channel = proxy.connect();
        let rx = listen(&channel);
        channel.send_message(ClientToServer::Authenticate {
            token: "wrong".into(),
        });
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ServerToClient::Disconnected);

        proxy.stop();
        server.stop();
    }

    #[test]
    fn test_tcp_proxy_relays_schema_mapping() {
        let mut server_config = ServerConfig::default();
        server_config.listen = Endpoint::localhost();
        let server = TcpServer::start(&server_config, Arc::new(MemoryPersistence::new())).unwrap();

        let mut config = ProxyServerConfig::default();
        config.listen = Endpoint::localhost();
        config.upstream = server.local_endpoint().unwrap();
        let proxy = TcpProxyServer::start(&config).unwrap();

        let channel: Arc<dyn UpstreamChannel> = TcpUpstreamChannel::connect(
            config.bus.clone(),
            proxy.local_endpoint().unwrap(),
            &HeartbeatConfig::default(),
        )
        .unwrap();
        let rx = listen(&channel);
        channel.send_message(ClientToServer::Authenticate {
            token: String::new(),
        });
        channel.send_message(ClientToServer::DefineSchema {
            name: CORE_SCHEMA.into(),
            definition: core_schema(),
        });

        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            ServerToClient::Initialize { .. }
        ));
        match rx.recv_timeout(WAIT).unwrap() {
            ServerToClient::SchemaMapping { schema, mapping } => {
                assert_eq!(schema, CORE_SCHEMA);
                assert_eq!(mapping.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        proxy.stop();
        server.stop();
    }
}
