//! Message bus
//!
//! Each bus runs two threads: an I/O thread driving a current-thread tokio
//! runtime that multiplexes the listener and every socket, and an event
//! thread that hands events and scheduled callbacks to the application one
//! at a time. Application threads only enqueue: commands wake the I/O
//! thread through its command queue, frames go straight onto the
//! connection's writer queue.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use odb_core::{OdbError, OdbResult};
use odb_wire::{encode_frame, FrameDecoder, WireMessage};

use crate::{tls, BusConfig, ByteBudget, Endpoint};

/// Bus-local connection handle
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ConnectionId(pub u64);

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Connection lifecycle as seen by the bus
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Outgoing, TCP/TLS handshake in progress; sends are held
    Connecting,
    /// Incoming, waiting for the auth token frame
    Unauthenticated,
    Established,
    /// Closed locally, queued frames still flushing
    Closing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Incoming,
    Outgoing,
}

/// When a scheduled callback should run
#[derive(Clone, Copy, Debug)]
pub enum When {
    Now,
    Delay(Duration),
    At(SystemTime),
}

impl When {
    fn delay(self) -> Duration {
        match self {
            When::Now => Duration::ZERO,
            When::Delay(d) => d,
            When::At(t) => t.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO),
        }
    }
}

/// Events delivered on the event thread, in order per connection
#[derive(Debug)]
pub enum BusEvent<M> {
    NewIncomingConnection {
        connection_id: ConnectionId,
        source: SocketAddr,
    },
    IncomingConnectionClosed {
        connection_id: ConnectionId,
        reason: String,
    },
    IncomingMessage {
        connection_id: ConnectionId,
        message: M,
    },
    OutgoingConnectionEstablished {
        connection_id: ConnectionId,
    },
    OutgoingConnectionFailed {
        connection_id: ConnectionId,
        error: String,
    },
    OutgoingConnectionClosed {
        connection_id: ConnectionId,
        reason: String,
    },
    /// Always the last event
    Stopped,
}

/// Scheduled work run on the event thread
pub type Callback = Box<dyn FnOnce() + Send>;

/// Transfer counters
#[derive(Debug, Default)]
pub struct BusStats {
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

enum Command {
    Connect {
        id: ConnectionId,
        endpoint: Endpoint,
        outbound: mpsc::UnboundedReceiver<Bytes>,
    },
    Schedule {
        when: When,
        callback: Callback,
    },
    Stop,
}

enum Delivery<M> {
    Event(BusEvent<M>),
    Callback(Callback),
}

struct ConnEntry {
    state: ConnectionState,
    direction: Direction,
    /// Whether the peer presented the token; outgoing connections are
    /// trusted. Kept apart from `state` since a local close can overtake
    /// the token frame.
    authenticated: bool,
    peer: Option<SocketAddr>,
    /// Dropped on close so the writer drains and exits
    outbound: Option<mpsc::UnboundedSender<Bytes>>,
}

struct Shared {
    config: BusConfig,
    connections: Mutex<HashMap<ConnectionId, ConnEntry>>,
    next_id: AtomicU64,
    budget: ByteBudget,
    stats: BusStats,
}

impl Shared {
    fn allocate_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn state(&self, id: ConnectionId) -> ConnectionState {
        self.connections
            .lock()
            .get(&id)
            .map_or(ConnectionState::Closed, |e| e.state)
    }

    fn set_state(&self, id: ConnectionId, state: ConnectionState) -> bool {
        match self.connections.lock().get_mut(&id) {
            Some(entry) if entry.state != ConnectionState::Closing => {
                entry.state = state;
                true
            }
            _ => false,
        }
    }

    fn remove(&self, id: ConnectionId) -> Option<ConnEntry> {
        self.connections.lock().remove(&id)
    }

    /// Pass one received frame through the token check
    fn gate(&self, id: ConnectionId, frame: &[u8]) -> Gate {
        let mut connections = self.connections.lock();
        let Some(entry) = connections.get_mut(&id) else {
            return Gate::Rejected("closed");
        };
        if entry.authenticated {
            return Gate::Message;
        }
        let expected = self.config.auth_token.as_deref().unwrap_or_default();
        if frame != expected.as_bytes() {
            return Gate::Rejected("authentication failed");
        }
        entry.authenticated = true;
        if entry.state != ConnectionState::Unauthenticated {
            // closed locally meanwhile; the application never saw it
            return Gate::Authenticated(None);
        }
        entry.state = ConnectionState::Established;
        Gate::Authenticated(entry.peer)
    }
}

#[derive(Debug, PartialEq)]
enum Gate {
    /// Decode and deliver
    Message,
    /// The frame was the token; announce the peer if given
    Authenticated(Option<SocketAddr>),
    Rejected(&'static str),
}

struct Control {
    commands: mpsc::UnboundedSender<Command>,
    io_thread: Option<JoinHandle<()>>,
    event_thread: Option<JoinHandle<()>>,
    event_thread_id: ThreadId,
}

struct BusInner {
    shared: Arc<Shared>,
    listen: Option<Endpoint>,
    control: Mutex<Option<Control>>,
    listening: Mutex<Option<SocketAddr>>,
}

/// Framed, authenticated, multiplexed transport.
///
/// `In` is the message type decoded from peers, `Out` the type sent to them.
pub struct MessageBus<In, Out> {
    inner: Arc<BusInner>,
    _marker: PhantomData<fn(Out) -> In>,
}

impl<In, Out> Clone for MessageBus<In, Out> {
    fn clone(&self) -> Self {
        MessageBus {
            inner: self.inner.clone(),
            _marker: PhantomData,
        }
    }
}

impl<In: WireMessage, Out: WireMessage> MessageBus<In, Out> {
    /// Create a bus; `listen` makes it accept incoming connections
    pub fn new(config: BusConfig, listen: Option<Endpoint>) -> Self {
        let budget = ByteBudget::new(config.max_write_queue_bytes);
        MessageBus {
            inner: Arc::new(BusInner {
                shared: Arc::new(Shared {
                    config,
                    connections: Mutex::new(HashMap::new()),
                    next_id: AtomicU64::new(1),
                    budget,
                    stats: BusStats::default(),
                }),
                listen,
                control: Mutex::new(None),
                listening: Mutex::new(None),
            }),
            _marker: PhantomData,
        }
    }

    /// Start both threads. Returns once the listener (if any) is bound.
    pub fn start<F>(&self, mut on_event: F) -> OdbResult<()>
    where
        F: FnMut(BusEvent<In>) + Send + 'static,
    {
        let mut control = self.inner.control.lock();
        if control.is_some() {
            return Err(OdbError::InvalidState("bus already started".into()));
        }

        let shared = self.inner.shared.clone();
        let tls_enabled = shared.config.tls.enabled;
        let acceptor = match (&self.inner.listen, tls_enabled) {
            (Some(_), true) => Some(tls::acceptor(&shared.config.tls.certificate)?),
            _ => None,
        };
        let connector = if tls_enabled {
            Some(tls::connector()?)
        } else {
            None
        };

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ev_tx, mut ev_rx) = mpsc::unbounded_channel::<Delivery<In>>();
        let (ready_tx, ready_rx) = oneshot::channel();

        let listen = self.inner.listen.clone();
        let io_thread = thread::Builder::new()
            .name("odb-bus-io".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(OdbError::Transport(e.to_string())));
                        let _ = ev_tx.send(Delivery::Event(BusEvent::Stopped));
                        return;
                    }
                };
                runtime.block_on(io_loop::<In>(
                    shared, listen, acceptor, connector, cmd_rx, ev_tx, ready_tx,
                ));
            })
            .map_err(|e| OdbError::Transport(e.to_string()))?;

        let event_thread = thread::Builder::new()
            .name("odb-bus-events".into())
            .spawn(move || {
                while let Some(delivery) = ev_rx.blocking_recv() {
                    match delivery {
                        Delivery::Callback(callback) => callback(),
                        Delivery::Event(BusEvent::Stopped) => {
                            on_event(BusEvent::Stopped);
                            break;
                        }
                        Delivery::Event(event) => on_event(event),
                    }
                }
            })
            .map_err(|e| OdbError::Transport(e.to_string()))?;

        let bound = ready_rx
            .blocking_recv()
            .map_err(|_| OdbError::Transport("bus i/o thread exited during startup".into()))?;

        *control = Some(Control {
            commands: cmd_tx,
            event_thread_id: event_thread.thread().id(),
            io_thread: Some(io_thread),
            event_thread: Some(event_thread),
        });

        match bound {
            Ok(addr) => {
                *self.inner.listening.lock() = addr;
                if let Some(addr) = addr {
                    tracing::info!("message bus listening on {}", addr);
                }
                Ok(())
            }
            Err(e) => {
                drop(control);
                self.stop();
                Err(e)
            }
        }
    }

    /// Stop both threads; exactly one `Stopped` event is delivered.
    /// Safe to call from the event thread.
    pub fn stop(&self) {
        let control = self.inner.control.lock().take();
        let Some(mut control) = control else {
            return;
        };

        let _ = control.commands.send(Command::Stop);
        if let Some(handle) = control.io_thread.take() {
            let _ = handle.join();
        }
        if thread::current().id() != control.event_thread_id {
            if let Some(handle) = control.event_thread.take() {
                let _ = handle.join();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.control.lock().is_some()
    }

    /// Address the listener bound to
    pub fn listening_endpoint(&self) -> Option<SocketAddr> {
        *self.inner.listening.lock()
    }

    /// Open an outgoing connection. The id is usable immediately; messages
    /// sent before the connection is established are held.
    pub fn connect(&self, endpoint: Endpoint) -> OdbResult<ConnectionId> {
        // not held across the budget wait, or stop() could never run
        let commands = match self.inner.control.lock().as_ref() {
            Some(control) => control.commands.clone(),
            None => return Err(OdbError::BusNotRunning),
        };

        let shared = &self.inner.shared;
        let id = shared.allocate_id();
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some(token) = &shared.config.auth_token {
            let frame = encode_frame(token.as_bytes(), shared.config.extra_message_size_check);
            if !shared.budget.acquire(frame.len()) {
                return Err(OdbError::BusNotRunning);
            }
            let _ = tx.send(frame);
        }

        shared.connections.lock().insert(
            id,
            ConnEntry {
                state: ConnectionState::Connecting,
                direction: Direction::Outgoing,
                authenticated: true,
                peer: None,
                outbound: Some(tx),
            },
        );

        commands
            .send(Command::Connect {
                id,
                endpoint,
                outbound: rx,
            })
            .map_err(|_| OdbError::BusNotRunning)?;

        Ok(id)
    }

    /// Queue a message. Blocks while the write budget is exhausted.
    /// Returns false if the connection is unknown or closing.
    pub fn send_message(&self, id: ConnectionId, message: &Out) -> bool {
        let shared = &self.inner.shared;
        if !matches!(
            shared.state(id),
            ConnectionState::Connecting
                | ConnectionState::Established
                | ConnectionState::Unauthenticated
        ) {
            return false;
        }

        let frame = encode_frame(&message.to_payload(), shared.config.extra_message_size_check);
        let len = frame.len();
        if !shared.budget.acquire(len) {
            return false;
        }

        let sent = shared
            .connections
            .lock()
            .get(&id)
            .and_then(|e| e.outbound.as_ref())
            .map_or(false, |tx| tx.send(frame).is_ok());
        if !sent {
            shared.budget.release(len);
        }
        sent
    }

    /// Close a connection: no further sends are accepted, queued frames are
    /// flushed, then the socket closes and a closed event follows.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        match self.inner.shared.connections.lock().get_mut(&id) {
            Some(entry) if entry.state != ConnectionState::Closing => {
                entry.state = ConnectionState::Closing;
                entry.outbound = None;
                true
            }
            _ => false,
        }
    }

    /// Run `callback` on the event thread
    pub fn schedule_callback<F>(&self, when: When, callback: F) -> OdbResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let control = self.inner.control.lock();
        let control = control.as_ref().ok_or(OdbError::BusNotRunning)?;
        control
            .commands
            .send(Command::Schedule {
                when,
                callback: Box::new(callback),
            })
            .map_err(|_| OdbError::BusNotRunning)
    }

    pub fn connection_state(&self, id: ConnectionId) -> ConnectionState {
        self.inner.shared.state(id)
    }

    /// Whether an incoming connection has yet to present the token
    pub fn is_unauthenticated(&self, id: ConnectionId) -> bool {
        self.inner
            .shared
            .connections
            .lock()
            .get(&id)
            .map_or(false, |e| !e.authenticated)
    }

    pub fn set_max_write_queue_bytes(&self, bytes: usize) {
        self.inner.shared.budget.set_max(bytes);
    }

    pub fn is_write_queue_blocked(&self) -> bool {
        self.inner.shared.budget.is_blocked()
    }

    /// Bytes queued but not yet written to any socket
    pub fn total_bytes_pending(&self) -> usize {
        self.inner.shared.budget.pending()
    }

    pub fn stats(&self) -> &BusStats {
        &self.inner.shared.stats
    }
}

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

type BoxedStream = Box<dyn Stream>;

async fn accept(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

async fn io_loop<In: WireMessage>(
    shared: Arc<Shared>,
    listen: Option<Endpoint>,
    acceptor: Option<TlsAcceptor>,
    connector: Option<TlsConnector>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Delivery<In>>,
    ready: oneshot::Sender<OdbResult<Option<SocketAddr>>>,
) {
    let listener = match listen {
        Some(endpoint) => match TcpListener::bind((endpoint.host.as_str(), endpoint.port)).await {
            Ok(listener) => Some(listener),
            Err(e) => {
                let _ = ready.send(Err(OdbError::Transport(format!(
                    "bind {}: {}",
                    endpoint, e
                ))));
                let _ = events.send(Delivery::Event(BusEvent::Stopped));
                return;
            }
        },
        None => None,
    };
    let local = listener.as_ref().and_then(|l| l.local_addr().ok());
    let _ = ready.send(Ok(local));

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Connect { id, endpoint, outbound }) => {
                    tokio::spawn(run_outgoing(
                        shared.clone(),
                        events.clone(),
                        id,
                        endpoint,
                        outbound,
                        connector.clone(),
                    ));
                }
                Some(Command::Schedule { when, callback }) => {
                    let events = events.clone();
                    let delay = when.delay();
                    tokio::spawn(async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        let _ = events.send(Delivery::Callback(callback));
                    });
                }
                Some(Command::Stop) | None => break,
            },
            accepted = accept(listener.as_ref()) => match accepted {
                Ok((stream, peer)) => {
                    tokio::spawn(run_incoming(
                        shared.clone(),
                        events.clone(),
                        stream,
                        peer,
                        acceptor.clone(),
                    ));
                }
                Err(e) => tracing::warn!("accept failed: {}", e),
            },
        }
    }

    shared.connections.lock().clear();
    shared.budget.close();
    let _ = events.send(Delivery::Event(BusEvent::Stopped));
}

async fn run_incoming<In: WireMessage>(
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<Delivery<In>>,
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) {
    let _ = stream.set_nodelay(true);
    let stream: BoxedStream = match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => Box::new(tls),
            Err(e) => {
                tracing::warn!("tls handshake with {} failed: {}", peer, e);
                return;
            }
        },
        None => Box::new(stream),
    };

    let id = shared.allocate_id();
    let (tx, rx) = mpsc::unbounded_channel();
    let needs_auth = shared.config.auth_token.is_some();
    shared.connections.lock().insert(
        id,
        ConnEntry {
            state: if needs_auth {
                ConnectionState::Unauthenticated
            } else {
                ConnectionState::Established
            },
            direction: Direction::Incoming,
            authenticated: !needs_auth,
            peer: Some(peer),
            outbound: Some(tx),
        },
    );

    if !needs_auth {
        let _ = events.send(Delivery::Event(BusEvent::NewIncomingConnection {
            connection_id: id,
            source: peer,
        }));
    }

    run_connection(shared, events, id, stream, rx).await;
}

async fn run_outgoing<In: WireMessage>(
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<Delivery<In>>,
    id: ConnectionId,
    endpoint: Endpoint,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    connector: Option<TlsConnector>,
) {
    match open_stream(&endpoint, connector).await {
        Ok(stream) => {
            if !shared.set_state(id, ConnectionState::Established) {
                // closed while connecting
                drain(&shared, &mut outbound);
                if shared.remove(id).is_some() {
                    let _ = events.send(Delivery::Event(BusEvent::OutgoingConnectionClosed {
                        connection_id: id,
                        reason: "closed while connecting".into(),
                    }));
                }
                return;
            }
            tracing::debug!("connected to {} as {}", endpoint, id);
            let _ = events.send(Delivery::Event(BusEvent::OutgoingConnectionEstablished {
                connection_id: id,
            }));
            run_connection(shared, events, id, stream, outbound).await;
        }
        Err(e) => {
            tracing::warn!("connection to {} failed: {}", endpoint, e);
            drain(&shared, &mut outbound);
            if shared.remove(id).is_some() {
                let _ = events.send(Delivery::Event(BusEvent::OutgoingConnectionFailed {
                    connection_id: id,
                    error: e.to_string(),
                }));
            }
        }
    }
}

async fn open_stream(endpoint: &Endpoint, connector: Option<TlsConnector>) -> OdbResult<BoxedStream> {
    let tcp = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| OdbError::Transport(e.to_string()))?;
    let _ = tcp.set_nodelay(true);
    match connector {
        Some(connector) => {
            let tls = connector
                .connect(tls::server_name(&endpoint.host)?, tcp)
                .await
                .map_err(|e| OdbError::Transport(e.to_string()))?;
            Ok(Box::new(tls))
        }
        None => Ok(Box::new(tcp)),
    }
}

fn drain(shared: &Shared, outbound: &mut mpsc::UnboundedReceiver<Bytes>) {
    outbound.close();
    while let Ok(frame) = outbound.try_recv() {
        shared.budget.release(frame.len());
    }
}

async fn run_connection<In: WireMessage>(
    shared: Arc<Shared>,
    events: mpsc::UnboundedSender<Delivery<In>>,
    id: ConnectionId,
    stream: BoxedStream,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);

    let reason = tokio::select! {
        reason = read_loop(&shared, &events, id, &mut reader) => reason,
        reason = write_loop(&shared, &mut writer, &mut outbound) => reason,
    };

    drain(&shared, &mut outbound);
    let _ = writer.shutdown().await;

    let Some(entry) = shared.remove(id) else {
        return;
    };
    tracing::debug!("connection {} closed: {}", id, reason);

    let event = match entry.direction {
        Direction::Incoming if !entry.authenticated => {
            if let Some(peer) = entry.peer {
                tracing::warn!("dropped unauthenticated connection from {}: {}", peer, reason);
            }
            return;
        }
        Direction::Incoming => BusEvent::IncomingConnectionClosed {
            connection_id: id,
            reason,
        },
        Direction::Outgoing => BusEvent::OutgoingConnectionClosed {
            connection_id: id,
            reason,
        },
    };
    let _ = events.send(Delivery::Event(event));
}

async fn read_loop<In: WireMessage>(
    shared: &Shared,
    events: &mpsc::UnboundedSender<Delivery<In>>,
    id: ConnectionId,
    reader: &mut ReadHalf<BoxedStream>,
) -> String {
    let config = &shared.config;
    let mut decoder =
        FrameDecoder::new(config.extra_message_size_check).with_max_frame_size(config.max_frame_size);
    let mut buf = vec![0u8; config.read_buffer_size.max(1)];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return "peer closed".into(),
            Ok(n) => n,
            Err(e) => return e.to_string(),
        };
        shared.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        decoder.push(&buf[..n]);

        loop {
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("connection {}: {}", id, e);
                    return e.to_string();
                }
            };

            match shared.gate(id, &frame) {
                Gate::Message => {}
                Gate::Authenticated(peer) => {
                    if let Some(source) = peer {
                        let _ = events.send(Delivery::Event(BusEvent::NewIncomingConnection {
                            connection_id: id,
                            source,
                        }));
                    }
                    continue;
                }
                Gate::Rejected(reason) => return reason.into(),
            }

            match In::from_payload(frame) {
                Ok(message) => {
                    let _ = events.send(Delivery::Event(BusEvent::IncomingMessage {
                        connection_id: id,
                        message,
                    }));
                }
                Err(e) => return format!("undecodable message: {}", e),
            }
        }
    }
}

async fn write_loop(
    shared: &Shared,
    writer: &mut WriteHalf<BoxedStream>,
    outbound: &mut mpsc::UnboundedReceiver<Bytes>,
) -> String {
    while let Some(frame) = outbound.recv().await {
        let len = frame.len();
        let written = writer.write_all(&frame).await;
        shared.budget.release(len);
        if let Err(e) = written {
            return e.to_string();
        }
        if let Err(e) = writer.flush().await {
            return e.to_string();
        }
        shared.stats.bytes_written.fetch_add(len as u64, Ordering::Relaxed);
    }
    "closed locally".into()
}
