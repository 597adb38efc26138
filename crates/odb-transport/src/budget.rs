//! Byte-count backpressure for outbound frames

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct BudgetState {
    pending: usize,
    max: usize,
    closed: bool,
}

/// Bounded count of queued-but-unflushed bytes.
///
/// `acquire` blocks while the budget is exhausted. A single frame larger
/// than the whole budget is admitted once nothing else is pending.
#[derive(Debug)]
pub struct ByteBudget {
    state: Mutex<BudgetState>,
    released: Condvar,
}

impl ByteBudget {
    pub fn new(max: usize) -> Self {
        ByteBudget {
            state: Mutex::new(BudgetState {
                pending: 0,
                max,
                closed: false,
            }),
            released: Condvar::new(),
        }
    }

    /// Reserve `bytes`; returns false if the budget was closed
    pub fn acquire(&self, bytes: usize) -> bool {
        let mut state = self.state.lock();
        while !state.closed && state.pending > 0 && state.pending + bytes > state.max {
            self.released.wait(&mut state);
        }
        if state.closed {
            return false;
        }
        state.pending += bytes;
        true
    }

    pub fn release(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(bytes);
        self.released.notify_all();
    }

    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    pub fn is_blocked(&self) -> bool {
        let state = self.state.lock();
        state.pending >= state.max
    }

    pub fn set_max(&self, max: usize) {
        self.state.lock().max = max;
        self.released.notify_all();
    }

    /// Wake every waiter and refuse further reservations
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.pending = 0;
        self.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_oversized_frame_admitted_when_idle() {
        let budget = ByteBudget::new(10);
        assert!(budget.acquire(100));
        assert!(budget.is_blocked());
        budget.release(100);
        assert_eq!(budget.pending(), 0);
    }

    #[test]
    fn test_acquire_blocks_until_release() {
        let budget = Arc::new(ByteBudget::new(10));
        assert!(budget.acquire(8));

        let waiter = {
            let budget = budget.clone();
            thread::spawn(move || budget.acquire(8))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        budget.release(8);
        assert!(waiter.join().unwrap());
        assert_eq!(budget.pending(), 8);
    }

    #[test]
    fn test_close_wakes_waiters() {
        let budget = Arc::new(ByteBudget::new(4));
        assert!(budget.acquire(4));

        let waiter = {
            let budget = budget.clone();
            thread::spawn(move || budget.acquire(4))
        };

        thread::sleep(Duration::from_millis(20));
        budget.close();
        assert!(!waiter.join().unwrap());
    }
}
