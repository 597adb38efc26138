//! In-process channel pair
//!
//! Each direction is a queue drained by its own pump thread, so handlers
//! never run on the sender's stack. The client-to-server pump stands in
//! for a heartbeat timer: when the client is idle for a full interval it
//! injects a `Heartbeat`, keeping in-process clients alive without one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use odb_core::HeartbeatConfig;
use odb_wire::{ClientToServer, ServerToClient};

use crate::{CloseNotifier, DownstreamChannel, Handler, HandlerSlot, OnClosed, UpstreamChannel};

/// Result of waiting on a [`Pump`]
#[derive(Debug, PartialEq, Eq)]
pub enum Popped<M> {
    Item(M),
    Timeout,
    /// Closed and fully drained
    Closed,
}

struct PumpState<M> {
    queue: VecDeque<M>,
    closed: bool,
}

/// Closable blocking queue
pub struct Pump<M> {
    state: Mutex<PumpState<M>>,
    ready: Condvar,
}

impl<M> Pump<M> {
    pub fn new() -> Self {
        Pump {
            state: Mutex::new(PumpState {
                queue: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Enqueue; false once closed
    pub fn push(&self, item: M) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.queue.push_back(item);
        self.ready.notify_one();
        true
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Next item, waiting up to `timeout`. Queued items drain before `Closed`.
    pub fn pop(&self, timeout: Duration) -> Popped<M> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Popped::Item(item);
            }
            if state.closed {
                return Popped::Closed;
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return match state.queue.pop_front() {
                    Some(item) => Popped::Item(item),
                    None if state.closed => Popped::Closed,
                    None => Popped::Timeout,
                };
            }
        }
    }
}

impl<M> Default for Pump<M> {
    fn default() -> Self {
        Self::new()
    }
}

struct Core {
    to_server: Pump<ClientToServer>,
    to_client: Pump<ServerToClient>,
    server_slot: HandlerSlot<ClientToServer>,
    client_slot: HandlerSlot<ServerToClient>,
    on_closed: CloseNotifier,
}

impl Core {
    fn close(&self) {
        self.to_server.close();
        self.to_client.close();
    }
}

/// Server end of an in-process connection
pub struct InMemoryServerEnd {
    core: Arc<Core>,
}

/// Client end of an in-process connection
pub struct InMemoryClientEnd {
    core: Arc<Core>,
}

/// Create a connected pair and start its pump threads
pub fn in_memory_channel(heartbeat: &HeartbeatConfig) -> (Arc<InMemoryServerEnd>, Arc<InMemoryClientEnd>) {
    let core = Arc::new(Core {
        to_server: Pump::new(),
        to_client: Pump::new(),
        server_slot: HandlerSlot::new(),
        client_slot: HandlerSlot::new(),
        on_closed: CloseNotifier::default(),
    });

    let interval = heartbeat.interval;
    let upward = core.clone();
    let spawned = thread::Builder::new()
        .name("odb-mem-c2s".into())
        .spawn(move || {
            loop {
                match upward.to_server.pop(interval) {
                    Popped::Item(message) => upward.server_slot.deliver(message),
                    Popped::Timeout => upward.server_slot.deliver(ClientToServer::Heartbeat),
                    Popped::Closed => break,
                }
            }
            upward.on_closed.fire();
        });

    let downward = core.clone();
    let spawned = spawned.and_then(|_| {
        thread::Builder::new()
            .name("odb-mem-s2c".into())
            .spawn(move || loop {
                match downward.to_client.pop(interval) {
                    Popped::Item(message) => downward.client_slot.deliver(message),
                    Popped::Timeout => {}
                    Popped::Closed => {
                        downward.client_slot.deliver(ServerToClient::Disconnected);
                        break;
                    }
                }
            })
    });

    if let Err(e) = spawned {
        tracing::error!("failed to start in-memory channel: {}", e);
        core.close();
        core.on_closed.fire();
    }

    (
        Arc::new(InMemoryServerEnd { core: core.clone() }),
        Arc::new(InMemoryClientEnd { core }),
    )
}

impl DownstreamChannel for InMemoryServerEnd {
    fn send_message(&self, message: ServerToClient) {
        self.core.to_client.push(message);
    }

    fn set_handler(&self, handler: Handler<ClientToServer>) {
        self.core.server_slot.install(handler);
    }

    fn set_on_closed(&self, on_closed: OnClosed) {
        self.core.on_closed.set(on_closed);
    }

    fn close(&self) {
        self.core.close();
    }
}

impl UpstreamChannel for InMemoryClientEnd {
    fn send_message(&self, message: ClientToServer) {
        self.core.to_server.push(message);
    }

    fn set_handler(&self, handler: Handler<ServerToClient>) {
        self.core.client_slot.install(handler);
    }

    fn close(&self) {
        self.core.close();
    }
}

impl Drop for InMemoryClientEnd {
    fn drop(&mut self) {
        self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_pump_drains_before_closed() {
        let pump = Pump::new();
        pump.push(1);
        pump.push(2);
        pump.close();
        assert!(!pump.push(3));

        assert_eq!(pump.pop(WAIT), Popped::Item(1));
        assert_eq!(pump.pop(WAIT), Popped::Item(2));
        assert_eq!(pump.pop(WAIT), Popped::Closed);
    }

    #[test]
    fn test_pump_timeout() {
        let pump: Pump<u8> = Pump::new();
        assert_eq!(pump.pop(Duration::from_millis(10)), Popped::Timeout);
    }

    #[test]
    fn test_messages_cross_both_ways() {
        let (server, client) = in_memory_channel(&HeartbeatConfig::default());

        let (srv_tx, srv_rx) = mpsc::channel();
        server.set_handler(Box::new(move |m| {
            let _ = srv_tx.send(m);
        }));
        let (cli_tx, cli_rx) = mpsc::channel();
        client.set_handler(Box::new(move |m| {
            let _ = cli_tx.send(m);
        }));

        client.send_message(ClientToServer::Flush {
            guid: odb_core::Guid::new(9),
        });
        assert_eq!(
            srv_rx.recv_timeout(WAIT).unwrap(),
            ClientToServer::Flush {
                guid: odb_core::Guid::new(9)
            }
        );

        server.send_message(ServerToClient::FlushResponse {
            guid: odb_core::Guid::new(9),
        });
        assert_eq!(
            cli_rx.recv_timeout(WAIT).unwrap(),
            ServerToClient::FlushResponse {
                guid: odb_core::Guid::new(9)
            }
        );
    }

    #[test]
    fn test_idle_client_gets_heartbeats() {
        let heartbeat = HeartbeatConfig::default().with_interval(Duration::from_millis(20));
        let (server, _client) = in_memory_channel(&heartbeat);

        let (tx, rx) = mpsc::channel();
        server.set_handler(Box::new(move |m| {
            let _ = tx.send(m);
        }));
        assert_eq!(rx.recv_timeout(WAIT).unwrap(), ClientToServer::Heartbeat);
    }

    #[test]
    fn test_close_notifies_both_sides() {
        let (server, client) = in_memory_channel(&HeartbeatConfig::default());

        let (closed_tx, closed_rx) = mpsc::channel();
        server.set_on_closed(Box::new(move || {
            let _ = closed_tx.send(());
        }));
        let (cli_tx, cli_rx) = mpsc::channel();
        client.set_handler(Box::new(move |m| {
            let _ = cli_tx.send(m);
        }));

        client.close();
        closed_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(cli_rx.recv_timeout(WAIT).unwrap(), ServerToClient::Disconnected);
    }
}
