//! Server front ends
//!
//! [`InMemServer`] hands out in-process channels for tests and embedded
//! use; [`TcpServer`] accepts connections through the message bus.

use std::sync::Arc;

use odb_core::{HeartbeatConfig, OdbResult};
use odb_store::Persistence;
use odb_transport::{in_memory_channel, BusConfig, Endpoint, TcpChannelListener, UpstreamChannel};

use crate::{Authority, AuthorityConfig, AuthorityHandle, ServerConfig};

/// Authority reachable through in-process channels
pub struct InMemServer {
    authority: Arc<AuthorityHandle>,
    heartbeat: HeartbeatConfig,
}

impl InMemServer {
    pub fn start(config: AuthorityConfig, store: Arc<dyn Persistence>) -> OdbResult<Self> {
        let heartbeat = config.heartbeat.clone();
        let authority = Authority::open(config, store)?;
        Ok(InMemServer {
            authority: Arc::new(AuthorityHandle::spawn(authority)?),
            heartbeat,
        })
    }

    /// Open a new client channel
    pub fn connect(&self) -> Arc<dyn UpstreamChannel> {
        let (server_end, client_end) = in_memory_channel(&self.heartbeat);
        self.authority.attach(server_end);
        client_end
    }

    pub fn is_running(&self) -> bool {
        self.authority.is_running()
    }

    pub fn stop(&self) {
        self.authority.stop();
    }
}

/// Authority behind a TCP listener
pub struct TcpServer {
    authority: Arc<AuthorityHandle>,
    listener: TcpChannelListener,
}

impl TcpServer {
    pub fn start(config: &ServerConfig, store: Arc<dyn Persistence>) -> OdbResult<Self> {
        Self::start_with(
            config.bus.clone(),
            config.listen.clone(),
            config.authority.clone(),
            store,
        )
    }

    pub fn start_with(
        bus: BusConfig,
        listen: Endpoint,
        authority: AuthorityConfig,
        store: Arc<dyn Persistence>,
    ) -> OdbResult<Self> {
        let authority = Arc::new(AuthorityHandle::spawn(Authority::open(authority, store)?)?);

        let accepting = authority.clone();
        let listener = TcpChannelListener::start(bus, listen, move |channel| {
            accepting.attach(channel);
        })?;
        if let Some(endpoint) = listener.local_endpoint() {
            tracing::info!("odb server listening on {}", endpoint);
        }

        Ok(TcpServer {
            authority,
            listener,
        })
    }

    /// Address actually bound
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.listener.local_endpoint()
    }

    pub fn connection_count(&self) -> usize {
        self.listener.connection_count()
    }

    pub fn is_running(&self) -> bool {
        self.authority.is_running()
    }

    pub fn stop(&self) {
        self.listener.stop();
        self.authority.stop();
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use odb_core::Guid;
    use odb_store::MemoryPersistence;
    use odb_transport::TcpUpstreamChannel;
    use odb_wire::{ClientToServer, ServerToClient};

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_tcp_server_handshake() {
        let server = TcpServer::start_with(
            BusConfig::default(),
            Endpoint::localhost(),
            AuthorityConfig::default(),
            Arc::new(MemoryPersistence::new()),
        )
        .unwrap();
        let endpoint = server.local_endpoint().unwrap();

        let client =
            TcpUpstreamChannel::connect(BusConfig::default(), endpoint, &HeartbeatConfig::default())
                .unwrap();
        let (tx, rx) = mpsc::channel();
        client.set_handler(Box::new(move |m| {
            let _ = tx.send(m);
        }));
        client.send_message(ClientToServer::Authenticate {
            token: String::new(),
        });
        client.send_message(ClientToServer::Flush { guid: Guid::new(1) });

        match rx.recv_timeout(WAIT).unwrap() {
            ServerToClient::Initialize { identity_root, .. } => assert_eq!(identity_root, 1),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            ServerToClient::FlushResponse { guid: Guid::new(1) }
        );

        server.stop();
        assert!(!server.is_running());
    }

    #[test]
    fn test_inmem_server_connections_are_independent() {
        let server =
            InMemServer::start(AuthorityConfig::default(), Arc::new(MemoryPersistence::new()))
                .unwrap();

        let mut roots = Vec::new();
        let mut channels = Vec::new();
        for _ in 0..2 {
            let channel = server.connect();
            let (tx, rx) = mpsc::channel();
            channel.set_handler(Box::new(move |m| {
                let _ = tx.send(m);
            }));
            channel.send_message(ClientToServer::Authenticate {
                token: String::new(),
            });
            match rx.recv_timeout(WAIT).unwrap() {
                ServerToClient::Initialize { identity_root, .. } => roots.push(identity_root),
                other => panic!("unexpected {:?}", other),
            }
            channels.push(channel);
        }
        assert_ne!(roots[0], roots[1]);
        server.stop();
    }
}
