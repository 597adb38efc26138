//! The authority on its own thread
//!
//! Channel callbacks only enqueue commands; one thread owns the
//! [`Authority`] and applies them in arrival order, interleaved with
//! heartbeat checks, version pruning and subscription streaming.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use odb_core::{ChannelId, OdbError, OdbResult};
use odb_transport::DownstreamChannel;
use odb_wire::ClientToServer;

use crate::Authority;

const MIN_TICK: Duration = Duration::from_millis(1);

enum Command {
    Attach {
        id: ChannelId,
        channel: Arc<dyn DownstreamChannel>,
    },
    Message {
        id: ChannelId,
        message: ClientToServer,
    },
    Detached {
        id: ChannelId,
    },
    Stop,
}

/// Handle to a running authority
pub struct AuthorityHandle {
    commands: mpsc::UnboundedSender<Command>,
    next_channel: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AuthorityHandle {
    /// Move `authority` onto a new thread
    pub fn spawn(authority: Authority) -> OdbResult<Self> {
        let (commands, receiver) = mpsc::unbounded_channel();
        let thread = thread::Builder::new()
            .name("odb-authority".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        tracing::error!("failed to start authority runtime: {}", e);
                        return;
                    }
                };
                runtime.block_on(run(authority, receiver));
            })
            .map_err(|e| OdbError::InvalidState(format!("failed to spawn authority: {}", e)))?;

        Ok(AuthorityHandle {
            commands,
            next_channel: AtomicU64::new(1),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Hand a freshly accepted channel to the authority
    pub fn attach(&self, channel: Arc<dyn DownstreamChannel>) -> ChannelId {
        let id = ChannelId::new(self.next_channel.fetch_add(1, Ordering::Relaxed));

        // queued before any message the handler can produce
        if self
            .commands
            .send(Command::Attach {
                id,
                channel: channel.clone(),
            })
            .is_err()
        {
            tracing::warn!("authority stopped; closing channel {}", id);
            channel.close();
            return id;
        }

        let messages = self.commands.clone();
        channel.set_handler(Box::new(move |message| {
            let _ = messages.send(Command::Message { id, message });
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

    /// Stop the authority and wait for its thread
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!("authority thread panicked");
            }
        }
    }
}

impl Drop for AuthorityHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(mut authority: Authority, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut heartbeats = tokio::time::interval(authority.config().heartbeat.interval.max(MIN_TICK));
    heartbeats.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut gc = tokio::time::interval(authority.config().gc_interval.max(MIN_TICK));
    gc.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let step = tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Attach { id, channel }) => {
                    authority.attach(id, channel);
                    Ok(())
                }
                Some(Command::Message { id, message }) => authority.handle_message(id, message),
                Some(Command::Detached { id }) => authority.detach(id),
                Some(Command::Stop) | None => break,
            },
            _ = heartbeats.tick() => authority.check_heartbeats(Instant::now()),
            _ = gc.tick() => {
                authority.collect_garbage();
                authority.flush_watcher();
                Ok(())
            }
            _ = std::future::ready(()), if authority.is_streaming() => authority.stream_step(),
        };

        if let Err(e) = step {
            tracing::error!("authority stopping after fatal error: {}", e);
            break;
        }
    }

    commands.close();
    authority.shutdown();
    tracing::info!("authority stopped at tid {}", authority.current_tid());
}
