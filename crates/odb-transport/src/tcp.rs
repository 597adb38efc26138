//! Bus-backed channels
//!
//! [`TcpChannelListener`] turns each authenticated incoming connection into
//! a [`DownstreamChannel`]. [`TcpUpstreamChannel`] owns a client bus with a
//! single outgoing connection and keeps it alive with scheduled heartbeats.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use odb_core::{HeartbeatConfig, OdbResult};
use odb_wire::{ClientToServer, ServerToClient, WireMessage};

use crate::{
    BusConfig, BusEvent, CloseNotifier, ConnectionId, DownstreamChannel, Endpoint, Handler,
    HandlerSlot, MessageBus, OnClosed, UpstreamChannel, When,
};

/// Bus on the listening side
pub type ServerBus = MessageBus<ClientToServer, ServerToClient>;
/// Bus on the connecting side
pub type ClientBus = MessageBus<ServerToClient, ClientToServer>;

/// One incoming connection seen as a channel
pub struct BusDownstreamChannel {
    bus: ServerBus,
    id: ConnectionId,
    slot: HandlerSlot<ClientToServer>,
    on_closed: CloseNotifier,
}

impl BusDownstreamChannel {
    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn mark_closed(&self) {
        self.on_closed.fire();
    }
}

impl DownstreamChannel for BusDownstreamChannel {
    fn send_message(&self, message: ServerToClient) {
        if !self.bus.send_message(self.id, &message) {
            tracing::trace!("dropped {} for closed connection {}", message.kind(), self.id);
        }
    }

    fn set_handler(&self, handler: Handler<ClientToServer>) {
        self.slot.install(handler);
    }

    fn set_on_closed(&self, on_closed: OnClosed) {
        self.on_closed.set(on_closed);
    }

    fn close(&self) {
        self.bus.close_connection(self.id);
    }
}

type Channels = Arc<Mutex<HashMap<ConnectionId, Arc<BusDownstreamChannel>>>>;

/// Accepts connections and hands each one out as a channel
pub struct TcpChannelListener {
    bus: ServerBus,
    channels: Channels,
}

impl TcpChannelListener {
    /// Bind `endpoint` and call `on_channel` for every authenticated peer
    pub fn start<F>(config: BusConfig, endpoint: Endpoint, mut on_channel: F) -> OdbResult<Self>
    where
        F: FnMut(Arc<dyn DownstreamChannel>) + Send + 'static,
    {
        let bus = ServerBus::new(config, Some(endpoint));
        let channels: Channels = Arc::new(Mutex::new(HashMap::new()));

        let event_bus = bus.clone();
        let event_channels = channels.clone();
        bus.start(move |event| match event {
            BusEvent::NewIncomingConnection {
                connection_id,
                source,
            } => {
                tracing::debug!("accepted connection {} from {}", connection_id, source);
                let channel = Arc::new(BusDownstreamChannel {
                    bus: event_bus.clone(),
                    id: connection_id,
                    slot: HandlerSlot::new(),
                    on_closed: CloseNotifier::default(),
                });
                event_channels.lock().insert(connection_id, channel.clone());
                on_channel(channel);
            }
            BusEvent::IncomingMessage {
                connection_id,
                message,
            } => {
                let channel = event_channels.lock().get(&connection_id).cloned();
                if let Some(channel) = channel {
                    channel.slot.deliver(message);
                }
            }
            BusEvent::IncomingConnectionClosed {
                connection_id,
                reason,
            } => {
                tracing::debug!("connection {} closed: {}", connection_id, reason);
                let channel = event_channels.lock().remove(&connection_id);
                if let Some(channel) = channel {
                    channel.mark_closed();
                }
            }
            BusEvent::Stopped => {
                let closed: Vec<_> = event_channels.lock().drain().map(|(_, c)| c).collect();
                for channel in closed {
                    channel.mark_closed();
                }
            }
            _ => {}
        })?;

        Ok(TcpChannelListener { bus, channels })
    }

    /// Address actually bound (resolves port 0)
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.bus
            .listening_endpoint()
            .map(|addr| Endpoint::new(addr.ip().to_string(), addr.port()))
    }

    pub fn connection_count(&self) -> usize {
        self.channels.lock().len()
    }

    pub fn stop(&self) {
        self.bus.stop();
    }
}

impl Drop for TcpChannelListener {
    fn drop(&mut self) {
        self.bus.stop();
    }
}

/// Client connection to a remote server over the bus
pub struct TcpUpstreamChannel {
    bus: ClientBus,
    id: ConnectionId,
    slot: Arc<HandlerSlot<ServerToClient>>,
}

impl TcpUpstreamChannel {
    /// Start a client bus and connect. Returns immediately; a failed
    /// connection surfaces as `ServerToClient::Disconnected`.
    pub fn connect(
        config: BusConfig,
        endpoint: Endpoint,
        heartbeat: &HeartbeatConfig,
    ) -> OdbResult<Arc<Self>> {
        let bus = ClientBus::new(config, None);
        let slot = Arc::new(HandlerSlot::new());
        let disconnected = Arc::new(CloseNotifier::default());

        let event_bus = bus.clone();
        let event_slot = slot.clone();
        bus.start(move |event| match event {
            BusEvent::IncomingMessage { message, .. } => event_slot.deliver(message),
            BusEvent::OutgoingConnectionFailed { error, .. } => {
                tracing::warn!("upstream connection failed: {}", error);
                if disconnected.fire() {
                    event_slot.deliver(ServerToClient::Disconnected);
                }
                event_bus.stop();
            }
            BusEvent::OutgoingConnectionClosed { reason, .. } => {
                tracing::debug!("upstream connection closed: {}", reason);
                if disconnected.fire() {
                    event_slot.deliver(ServerToClient::Disconnected);
                }
                event_bus.stop();
            }
            BusEvent::Stopped => {
                if disconnected.fire() {
                    event_slot.deliver(ServerToClient::Disconnected);
                }
            }
            _ => {}
        })?;

        let id = bus.connect(endpoint)?;
        schedule_heartbeat(bus.clone(), id, heartbeat.interval);

        Ok(Arc::new(TcpUpstreamChannel { bus, id, slot }))
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }
}

fn schedule_heartbeat(bus: ClientBus, id: ConnectionId, interval: Duration) {
    let next = bus.clone();
    let scheduled = bus.schedule_callback(When::Delay(interval), move || {
        if next.send_message(id, &ClientToServer::Heartbeat) {
            schedule_heartbeat(next, id, interval);
        }
    });
    if scheduled.is_err() {
        tracing::trace!("heartbeats stopped for {}", id);
    }
}

impl UpstreamChannel for TcpUpstreamChannel {
    fn send_message(&self, message: ClientToServer) {
        self.bus.send_message(self.id, &message);
    }

    fn set_handler(&self, handler: Handler<ServerToClient>) {
        self.slot.install(handler);
    }

    /// Flush queued messages, then close; the bus stops once the socket is gone
    fn close(&self) {
        if !self.bus.close_connection(self.id) {
            self.bus.stop();
        }
    }
}

impl Drop for TcpUpstreamChannel {
    fn drop(&mut self) {
        self.close();
    }
}
