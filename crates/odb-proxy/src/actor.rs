//! The proxy on its own thread
//!
//! Downstream and upstream callbacks enqueue commands; one thread owns the
//! [`Proxy`] and applies them in arrival order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use odb_core::{ChannelId, OdbError, OdbResult};
use odb_transport::{DownstreamChannel, UpstreamChannel};
use odb_wire::{ClientToServer, ServerToClient};

use crate::{Proxy, ProxyConfig};

const MIN_TICK: Duration = Duration::from_millis(1);

enum Command {
    Attach {
        id: ChannelId,
        channel: Arc<dyn DownstreamChannel>,
    },
    Downstream {
        id: ChannelId,
        message: ClientToServer,
    },
    Detached {
        id: ChannelId,
    },
    Upstream(ServerToClient),
    Stop,
}

/// Handle to a running proxy
pub struct ProxyHandle {
    commands: mpsc::UnboundedSender<Command>,
    next_channel: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyHandle {
    /// Start a proxy speaking to the authority over `upstream`
    pub fn spawn(config: ProxyConfig, upstream: Arc<dyn UpstreamChannel>) -> OdbResult<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();

        // installed before the handshake so no reply is missed
        let replies = commands.clone();
        upstream.set_handler(Box::new(move |message| {
            let _ = replies.send(Command::Upstream(message));
        }));
        let proxy = Proxy::new(config, upstream);

        let thread = thread::Builder::new()
            .name("odb-proxy".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!("failed to start proxy runtime: {}", e);
                        return;
                    }
                };
                runtime.block_on(run(proxy, receiver));
            })
            .map_err(|e| OdbError::InvalidState(format!("failed to spawn proxy: {}", e)))?;

        Ok(ProxyHandle {
            commands,
            next_channel: AtomicU64::new(1),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Hand a freshly accepted downstream channel to the proxy
    pub fn attach(&self, channel: Arc<dyn DownstreamChannel>) -> ChannelId {
        let id = ChannelId::new(self.next_channel.fetch_add(1, Ordering::Relaxed));

        if self
            .commands
            .send(Command::Attach {
                id,
                channel: channel.clone(),
            })
            .is_err()
        {
            tracing::warn!("proxy stopped; closing channel {}", id);
            channel.close();
            return id;
        }

        let messages = self.commands.clone();
        channel.set_handler(Box::new(move |message| {
            let _ = messages.send(Command::Downstream { id, message });
        }));
        let closed = self.commands.clone();
        channel.set_on_closed(Box::new(move || {
            let _ = closed.send(Command::Detached { id });
        }));
        id
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Stop the proxy and wait for its thread
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!("proxy thread panicked");
            }
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(mut proxy: Proxy, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut heartbeats = tokio::time::interval(proxy.config().heartbeat.interval.max(MIN_TICK));
    heartbeats.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let step = tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Attach { id, channel }) => {
                    proxy.attach(id, channel);
                    Ok(())
                }
                Some(Command::Downstream { id, message }) => proxy.handle_downstream(id, message),
                Some(Command::Detached { id }) => proxy.detach(id),
                Some(Command::Upstream(message)) => proxy.handle_upstream(message),
                Some(Command::Stop) | None => break,
            },
            _ = heartbeats.tick() => proxy.check_heartbeats(Instant::now()),
        };

        if let Err(e) = step {
            tracing::error!("proxy stopping after fatal error: {}", e);
            break;
        }
    }

    commands.close();
    proxy.shutdown();
    tracing::info!("proxy stopped at tid {}", proxy.current_tid());
}
