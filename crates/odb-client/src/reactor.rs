//! Reactors
//!
//! A reactor runs a function inside a transaction, committing and rerunning
//! until a pass writes nothing. It then sleeps on that pass's read set: a
//! transaction touching any slot or index it read wakes it, as do its
//! `max_sleep` and any wake time the function asked for through
//! [`ReactorContext::timestamp_is_after`].
//!
//! A reactor is driven either by its own thread ([`Reactor::start`]) or by
//! the caller ([`Reactor::next`], [`Reactor::block_until_true`]).

use std::collections::HashSet;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use odb_core::{IndexId, ObjectFieldId, OdbError, OdbResult};

use crate::connection::{HandlerId, TransactionNotice};
use crate::view::{Touched, ViewWatcher};
use crate::{DatabaseConnection, Transaction};

const MIN_ERROR_BACKOFF: Duration = Duration::from_millis(50);
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// The transaction a reactor pass runs in
pub struct ReactorContext {
    txn: Transaction,
    now: Instant,
    wake_at: Option<Instant>,
}

impl ReactorContext {
    /// When this pass started
    pub fn timestamp(&self) -> Instant {
        self.now
    }

    /// Whether `when` has passed; if not, the reactor wakes at `when`
    pub fn timestamp_is_after(&mut self, when: Instant) -> bool {
        if self.now >= when {
            return true;
        }
        self.wake_at = Some(self.wake_at.map_or(when, |at| at.min(when)));
        false
    }
}

impl Deref for ReactorContext {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        &self.txn
    }
}

impl DerefMut for ReactorContext {
    fn deref_mut(&mut self) -> &mut Transaction {
        &mut self.txn
    }
}

type ReactorFn<T> = Box<dyn FnMut(&mut ReactorContext) -> OdbResult<T> + Send>;

/// What the last quiet pass depends on
#[derive(Debug)]
struct Watch {
    reads: HashSet<ObjectFieldId>,
    index_reads: HashSet<IndexId>,
    fire_at: Option<Instant>,
}

impl Watch {
    fn is_triggered_by(&self, notice: &TransactionNotice<'_>) -> bool {
        notice.writes.keys().any(|k| self.reads.contains(k))
            || notice
                .set_adds
                .keys()
                .chain(notice.set_removes.keys())
                .any(|i| self.index_reads.contains(i))
    }
}

#[derive(Default)]
struct Inbox {
    /// `None` until the first pass; a reactor with no watch is due
    watch: Option<Watch>,
    dirty: bool,
    stop: bool,
    /// Keys changed while a pass was running
    recording: bool,
    changed_slots: HashSet<ObjectFieldId>,
    changed_indices: HashSet<IndexId>,
}

enum Wait {
    Due,
    TimedOut,
    Stopped,
}

struct ReactorInner<T> {
    db: DatabaseConnection,
    function: Mutex<ReactorFn<T>>,
    max_sleep: Mutex<Option<Duration>>,
    inbox: Mutex<Inbox>,
    wake: Condvar,
    running_on: Mutex<Option<ThreadId>>,
}

impl<T> ReactorInner<T> {
    fn on_transaction(&self, notice: &TransactionNotice<'_>) {
        let mut inbox = self.inbox.lock();
        if inbox.recording {
            inbox.changed_slots.extend(notice.writes.keys().copied());
            inbox.changed_indices.extend(
                notice
                    .set_adds
                    .keys()
                    .chain(notice.set_removes.keys())
                    .cloned(),
            );
        }
        let triggered = inbox
            .watch
            .as_ref()
            .map_or(false, |w| w.is_triggered_by(notice));
        if triggered {
            inbox.dirty = true;
            self.wake.notify_all();
        }
    }

    fn wait_until_due(&self, deadline: Option<Instant>) -> Wait {
        let mut inbox = self.inbox.lock();
        loop {
            if inbox.stop {
                return Wait::Stopped;
            }
            let fire_at = match &inbox.watch {
                None => return Wait::Due,
                Some(_) if inbox.dirty => return Wait::Due,
                Some(watch) => watch.fire_at,
            };

            let now = Instant::now();
            if fire_at.map_or(false, |at| now >= at) {
                return Wait::Due;
            }
            if deadline.map_or(false, |at| now >= at) {
                return Wait::TimedOut;
            }
            let until = match (fire_at, deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match until {
                Some(until) => {
                    self.wake.wait_until(&mut inbox, until);
                }
                None => self.wake.wait(&mut inbox),
            }
        }
    }

    fn begin_recording(&self) {
        let mut inbox = self.inbox.lock();
        inbox.recording = true;
        inbox.dirty = false;
        inbox.changed_slots.clear();
        inbox.changed_indices.clear();
    }

    fn finish(&self, watch: Watch) {
        let mut inbox = self.inbox.lock();
        inbox.recording = false;
        inbox.dirty = watch.reads.iter().any(|k| inbox.changed_slots.contains(k))
            || watch.index_reads.iter().any(|i| inbox.changed_indices.contains(i));
        inbox.changed_slots.clear();
        inbox.changed_indices.clear();
        inbox.watch = Some(watch);
    }

    /// Sleep `delay` before the next pass, whatever changes meanwhile
    fn back_off(&self, delay: Duration) {
        let mut inbox = self.inbox.lock();
        inbox.recording = false;
        inbox.dirty = false;
        inbox.watch = Some(Watch {
            reads: HashSet::new(),
            index_reads: HashSet::new(),
            fire_at: Some(Instant::now() + delay),
        });
    }

    /// Run passes until one commits without writing
    fn run(&self) -> OdbResult<T> {
        *self.running_on.lock() = Some(thread::current().id());
        let result = self.run_passes();
        *self.running_on.lock() = None;
        result
    }

    fn run_passes(&self) -> OdbResult<T> {
        let max_sleep = *self.max_sleep.lock();
        let mut function = self.function.lock();
        loop {
            self.begin_recording();
            let watcher = ViewWatcher::default();
            let mut ctx = ReactorContext {
                txn: Transaction::new(self.db.view().watched_by(watcher.clone())),
                now: Instant::now(),
                wake_at: None,
            };

            let value = match function(&mut ctx) {
                Ok(value) => value,
                Err(e) if e.is_conflict() => {
                    tracing::debug!("reactor pass conflicted; rerunning");
                    continue;
                }
                Err(e) => {
                    self.inbox.lock().recording = false;
                    return Err(e);
                }
            };

            let ReactorContext { txn, now, wake_at } = ctx;
            let wrote = !txn.writes().is_empty();
            match txn.commit() {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {
                    tracing::debug!("reactor commit conflicted; rerunning");
                    continue;
                }
                Err(e) => {
                    self.inbox.lock().recording = false;
                    return Err(e);
                }
            }
            if wrote {
                continue;
            }

            let touched: Touched = std::mem::take(&mut *watcher.lock());
            let fire_at = match (wake_at, max_sleep.map(|d| now + d)) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            if touched.reads.is_empty() && touched.index_reads.is_empty() && fire_at.is_none() {
                self.inbox.lock().recording = false;
                return Err(OdbError::Deadlock);
            }

            tracing::trace!(
                "reactor quiet with {} reads and {} index reads",
                touched.reads.len(),
                touched.index_reads.len()
            );
            self.finish(Watch {
                reads: touched.reads,
                index_reads: touched.index_reads,
                fire_at,
            });
            return Ok(value);
        }
    }
}

/// Reruns a function whenever what it read changes
pub struct Reactor<T> {
    inner: Arc<ReactorInner<T>>,
    handler: HandlerId,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: 'static> Reactor<T> {
    pub fn new<F>(db: &DatabaseConnection, function: F) -> Self
    where
        F: FnMut(&mut ReactorContext) -> OdbResult<T> + Send + 'static,
    {
        let inner = Arc::new(ReactorInner {
            db: db.clone(),
            function: Mutex::new(Box::new(function)),
            max_sleep: Mutex::new(None),
            inbox: Mutex::new(Inbox::default()),
            wake: Condvar::new(),
            running_on: Mutex::new(None),
        });

        let weak: Weak<ReactorInner<T>> = Arc::downgrade(&inner);
        let handler = db.register_transaction_handler(move |notice| {
            if let Some(inner) = weak.upgrade() {
                inner.on_transaction(notice);
            }
        });

        Reactor {
            inner,
            handler,
            thread: Mutex::new(None),
        }
    }

    /// Rerun at least this often even if nothing changed
    pub fn with_max_sleep(self, max_sleep: Duration) -> Self {
        *self.inner.max_sleep.lock() = Some(max_sleep);
        self
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .as_ref()
            .map_or(false, |t| !t.is_finished())
    }

    fn check_reentry(&self) -> OdbResult<()> {
        if *self.inner.running_on.lock() == Some(thread::current().id()) {
            return Err(OdbError::InvalidState(
                "reactor driven from inside its own function".into(),
            ));
        }
        Ok(())
    }

    /// Wait until the reactor is due, then run it. `Ok(None)` when
    /// `timeout` passes first.
    pub fn next(&self, timeout: Option<Duration>) -> OdbResult<Option<T>> {
        if self.is_running() {
            return Err(OdbError::InvalidState(
                "reactor is running on its own thread".into(),
            ));
        }
        self.check_reentry()?;
        if !self.inner.db.is_connected() {
            return Err(OdbError::Disconnected);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        match self.inner.wait_until_due(deadline) {
            Wait::Due => self.inner.run().map(Some),
            Wait::TimedOut | Wait::Stopped => Ok(None),
        }
    }

    /// Stop the background thread, if any, and wait for it
    pub fn stop(&self) {
        {
            let mut inbox = self.inner.inbox.lock();
            inbox.stop = true;
            self.inner.wake.notify_all();
        }
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() == thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                tracing::error!("reactor thread panicked");
            }
        }
    }
}

impl<T: Send + 'static> Reactor<T> {
    /// Run on a background thread until [`Reactor::stop`]
    pub fn start(&self) -> OdbResult<()> {
        let mut slot = self.thread.lock();
        if slot.as_ref().map_or(false, |t| !t.is_finished()) {
            return Err(OdbError::InvalidState("reactor already running".into()));
        }
        self.inner.inbox.lock().stop = false;

        let inner = self.inner.clone();
        let thread = thread::Builder::new()
            .name("odb-reactor".into())
            .spawn(move || run_thread(inner))
            .map_err(|e| OdbError::InvalidState(format!("failed to spawn reactor: {}", e)))?;
        *slot = Some(thread);
        Ok(())
    }
}

impl Reactor<bool> {
    /// Run until the function returns `true`. `Ok(false)` on timeout.
    pub fn block_until_true(&self, timeout: Option<Duration>) -> OdbResult<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = deadline.map(|at| at.saturating_duration_since(Instant::now()));
            match self.next(remaining)? {
                Some(true) => return Ok(true),
                Some(false) => {
                    if deadline.map_or(false, |at| Instant::now() >= at) {
                        return Ok(false);
                    }
                }
                None => return Ok(false),
            }
        }
    }
}

impl<T> Drop for Reactor<T> {
    fn drop(&mut self) {
        {
            let mut inbox = self.inner.inbox.lock();
            inbox.stop = true;
            self.inner.wake.notify_all();
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                tracing::error!("reactor thread panicked");
            }
        }
        self.inner.db.drop_transaction_handler(self.handler);
    }
}

fn run_thread<T>(inner: Arc<ReactorInner<T>>) {
    let mut backoff = MIN_ERROR_BACKOFF;
    loop {
        if let Wait::Stopped = inner.wait_until_due(None) {
            break;
        }
        match inner.run() {
            Ok(_) => backoff = MIN_ERROR_BACKOFF,
            Err(OdbError::Disconnected) => {
                tracing::info!("reactor stopping: connection closed");
                break;
            }
            Err(OdbError::Deadlock) => {
                tracing::error!("reactor stopping: {}", OdbError::Deadlock);
                break;
            }
            Err(e) => {
                if backoff == MIN_ERROR_BACKOFF {
                    tracing::error!("reactor pass failed: {}", e);
                } else {
                    tracing::debug!("reactor pass failed again: {}", e);
                }
                inner.back_off(backoff);
                backoff = (backoff * 2).min(MAX_ERROR_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;

    use odb_core::{SchemaDefinition, TypeDefinition, TypeKey};
    use odb_server::{AuthorityConfig, InMemServer};
    use odb_store::MemoryPersistence;

    use super::*;
    use crate::ConnectionConfig;

    const WAIT: Duration = Duration::from_secs(5);

    fn setup() -> (InMemServer, DatabaseConnection, TypeKey) {
        let server =
            InMemServer::start(AuthorityConfig::default(), Arc::new(MemoryPersistence::new()))
                .unwrap();
        let db = DatabaseConnection::connect(server.connect(), ConnectionConfig::default()).unwrap();
        db.define_schema(
            "app",
            &SchemaDefinition::new().with_type("Flag", TypeDefinition::new().index("on")),
        )
        .unwrap();
        db.subscribe_type("app", "Flag", false).unwrap();
        (server, db, TypeKey::new("app", "Flag"))
    }

    #[test]
    fn test_block_until_true_wakes_on_write() {
        let (_server, db, ty) = setup();
        let watched = ty.clone();
        let reactor = Reactor::new(&db, move |ctx| {
            Ok(!ctx.lookup_all(&watched, "on", b"yes")?.is_empty())
        });

        assert!(!reactor.block_until_true(Some(Duration::from_millis(50))).unwrap());

        let writer = db.clone();
        let flag = ty.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer
                .transact(|t| t.create(&flag, &[("on", Bytes::from_static(b"yes"))]))
                .unwrap();
        });
        assert!(reactor.block_until_true(Some(WAIT)).unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn test_writes_rerun_until_quiet() {
        let (_server, db, ty) = setup();
        let passes = Arc::new(AtomicUsize::new(0));
        let counted = passes.clone();
        let flag = ty.clone();
        let reactor = Reactor::new(&db, move |ctx| {
            counted.fetch_add(1, Ordering::SeqCst);
            if ctx.lookup_type(&flag)?.is_empty() {
                ctx.create(&flag, &[])?;
            }
            Ok(())
        });

        reactor.next(Some(WAIT)).unwrap().unwrap();
        // one pass writes, the second sees the object and stays quiet
        assert_eq!(passes.load(Ordering::SeqCst), 2);
        assert_eq!(db.view().lookup_type(&ty).unwrap().len(), 1);

        // nothing it read has changed
        assert!(reactor.next(Some(Duration::from_millis(50))).unwrap().is_none());
    }

    #[test]
    fn test_no_reads_and_no_wakeup_is_a_deadlock() {
        let (_server, db, _ty) = setup();
        let reactor = Reactor::new(&db, |_ctx| Ok(()));
        assert!(matches!(reactor.next(Some(WAIT)), Err(OdbError::Deadlock)));

        let sleepy = Reactor::new(&db, |_ctx| Ok(())).with_max_sleep(Duration::from_millis(10));
        sleepy.next(Some(WAIT)).unwrap().unwrap();
        assert!(sleepy.next(Some(WAIT)).unwrap().is_some());
    }

    #[test]
    fn test_timestamp_wakeup() {
        let (_server, db, _ty) = setup();
        let wake = Instant::now() + Duration::from_millis(30);
        let reactor = Reactor::new(&db, move |ctx| Ok(ctx.timestamp_is_after(wake)));
        assert!(reactor.block_until_true(Some(WAIT)).unwrap());
        assert!(Instant::now() >= wake);
    }

    #[test]
    fn test_background_thread_reacts_and_stops() {
        let (_server, db, ty) = setup();
        let seen = Arc::new(AtomicUsize::new(0));
        let counted = seen.clone();
        let flag = ty.clone();
        let reactor = Reactor::new(&db, move |ctx| {
            counted.store(ctx.lookup_type(&flag)?.len(), Ordering::SeqCst);
            Ok(())
        });
        reactor.start().unwrap();
        assert!(reactor.is_running());
        assert!(matches!(reactor.next(None), Err(OdbError::InvalidState(_))));

        db.transact(|t| t.create(&ty, &[])).unwrap();
        let deadline = Instant::now() + WAIT;
        while seen.load(Ordering::SeqCst) != 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        reactor.stop();
        assert!(!reactor.is_running());
    }
}
