//! Typed channels
//!
//! A channel binds one peer to a message pair. The server side speaks
//! `ServerToClient` and hears `ClientToServer`; the client side the reverse.
//! Messages that arrive before a handler is installed are buffered and
//! replayed on install, so nothing is lost during setup.

use std::collections::VecDeque;

use parking_lot::Mutex;

use odb_wire::{ClientToServer, ServerToClient};

/// Callback invoked for every incoming message, one at a time
pub type Handler<M> = Box<dyn FnMut(M) + Send>;

/// Callback fired once when a channel closes
pub type OnClosed = Box<dyn FnOnce() + Send>;

struct SlotState<M> {
    handler: Option<Handler<M>>,
    pending: VecDeque<M>,
}

/// Ordered, non-reentrant delivery point for one channel direction
pub struct HandlerSlot<M> {
    state: Mutex<SlotState<M>>,
}

impl<M> HandlerSlot<M> {
    pub fn new() -> Self {
        HandlerSlot {
            state: Mutex::new(SlotState {
                handler: None,
                pending: VecDeque::new(),
            }),
        }
    }

    /// Deliver to the handler, or buffer until one is installed
    pub fn deliver(&self, message: M) {
        let mut state = self.state.lock();
        match state.handler.as_mut() {
            Some(handler) => handler(message),
            None => state.pending.push_back(message),
        }
    }

    /// Install the handler and replay anything buffered
    pub fn install(&self, mut handler: Handler<M>) {
        let mut state = self.state.lock();
        while let Some(message) = state.pending.pop_front() {
            handler(message);
        }
        state.handler = Some(handler);
    }

    pub fn has_handler(&self) -> bool {
        self.state.lock().handler.is_some()
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().pending.len()
    }
}

impl<M> Default for HandlerSlot<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Fires a close callback at most once
#[derive(Default)]
pub struct CloseNotifier {
    state: Mutex<(bool, Option<OnClosed>)>,
}

impl CloseNotifier {
    /// Register the callback; runs immediately if already closed
    pub fn set(&self, on_closed: OnClosed) {
        let mut state = self.state.lock();
        if state.0 {
            drop(state);
            on_closed();
        } else {
            state.1 = Some(on_closed);
        }
    }

    /// Mark closed; returns true the first time
    pub fn fire(&self) -> bool {
        let callback = {
            let mut state = self.state.lock();
            if state.0 {
                return false;
            }
            state.0 = true;
            state.1.take()
        };
        if let Some(callback) = callback {
            callback();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().0
    }
}

/// Server-side end of a client connection
pub trait DownstreamChannel: Send + Sync {
    fn send_message(&self, message: ServerToClient);
    fn set_handler(&self, handler: Handler<ClientToServer>);
    fn set_on_closed(&self, on_closed: OnClosed);
    fn close(&self);
}

/// Client-side end of a connection to a server
pub trait UpstreamChannel: Send + Sync {
    fn send_message(&self, message: ClientToServer);
    fn set_handler(&self, handler: Handler<ServerToClient>);
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_slot_buffers_until_install() {
        let slot = HandlerSlot::new();
        slot.deliver(1);
        slot.deliver(2);
        assert_eq!(slot.buffered(), 2);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        slot.install(Box::new(move |m| sink.lock().push(m)));
        slot.deliver(3);

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(slot.buffered(), 0);
        assert!(slot.has_handler());
    }

    #[test]
    fn test_close_notifier_fires_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let notifier = CloseNotifier::default();
        let c = count.clone();
        notifier.set(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(notifier.fire());
        assert!(!notifier.fire());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let c = count.clone();
        notifier.set(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
