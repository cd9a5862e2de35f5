//! Host runtime seam
//!
//! The runner needs a handful of things from the application hosting it:
//! how many cores it may use, whether it runs headless, read access to
//! shared state, and a notification when an exclusive write phase is about
//! to begin. [`Host`] captures those; [`LocalHost`] is an in-process
//! implementation backed by a `parking_lot` read-write lock.

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::debug;

/// Callback invoked right before an exclusive write phase starts
pub type WritePhaseListener = Arc<dyn Fn() + Send + Sync>;

/// Registration handle for a write-phase listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Services the runner consumes from its host application
pub trait Host: Send + Sync {
    /// Number of cores available to the process
    fn available_parallelism(&self) -> usize;

    /// True for command-line/batch hosts where no interactive work competes
    /// for cores
    fn is_headless(&self) -> bool;

    /// True if the calling thread is inside an exclusive write phase
    fn holds_exclusive_access(&self) -> bool;

    /// Register a listener fired at the start of every write phase
    fn add_write_phase_listener(&self, listener: WritePhaseListener) -> ListenerId;

    /// Remove a previously registered listener
    fn remove_write_phase_listener(&self, id: ListenerId);

    /// Run `action` with read access to shared state
    ///
    /// Returns false without running the action if access cannot be granted
    /// right now (write phase pending or active, host disposed).
    fn try_run_read(&self, action: &mut dyn FnMut()) -> bool;

    /// True once the host is shutting down
    fn is_disposed(&self) -> bool;
}

/// In-process host backed by a read-write lock over shared state
pub struct LocalHost {
    /// Shared application state lock
    state: RwLock<()>,

    /// Registered write-phase listeners
    listeners: Mutex<Vec<(ListenerId, WritePhaseListener)>>,

    /// Next listener ID
    next_listener: AtomicU64,

    /// Write phases announced but not yet finished
    pending_writes: AtomicUsize,

    /// Thread currently inside a write phase
    writer: Mutex<Option<ThreadId>>,

    /// Disposal flag
    disposed: AtomicBool,

    /// Headless mode (no core reserved for interactive work)
    headless: bool,

    /// Reported core count
    parallelism: usize,
}

impl LocalHost {
    /// Create a host reporting the machine's core count
    pub fn new() -> Self {
        Self::with_parallelism(num_cpus::get())
    }

    /// Create a host reporting a fixed core count
    pub fn with_parallelism(parallelism: usize) -> Self {
        Self {
            state: RwLock::new(()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            pending_writes: AtomicUsize::new(0),
            writer: Mutex::new(None),
            disposed: AtomicBool::new(false),
            headless: false,
            parallelism: parallelism.max(1),
        }
    }

    /// Set headless mode
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Begin an exclusive write phase
    ///
    /// Listeners fire first, then the call blocks until in-progress readers
    /// leave. The phase lasts until the returned guard is dropped.
    pub fn begin_write(&self) -> WritePhase<'_> {
        self.pending_writes.fetch_add(1, Ordering::SeqCst);

        // Snapshot so listeners can unregister themselves without deadlock
        let listeners: Vec<WritePhaseListener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        debug!(listeners = listeners.len(), "Write phase starting");
        for listener in listeners {
            listener();
        }

        let guard = self.state.write();
        *self.writer.lock() = Some(thread::current().id());

        WritePhase {
            host: self,
            _guard: guard,
        }
    }

    /// Mark the host as disposed
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    /// Number of registered write-phase listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for LocalHost {
    fn available_parallelism(&self) -> usize {
        self.parallelism
    }

    fn is_headless(&self) -> bool {
        self.headless
    }

    fn holds_exclusive_access(&self) -> bool {
        *self.writer.lock() == Some(thread::current().id())
    }

    fn add_write_phase_listener(&self, listener: WritePhaseListener) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    fn remove_write_phase_listener(&self, id: ListenerId) {
        self.listeners.lock().retain(|(lid, _)| *lid != id);
    }

    fn try_run_read(&self, action: &mut dyn FnMut()) -> bool {
        if self.is_disposed() {
            return false;
        }

        // Write access implies read access
        if self.holds_exclusive_access() {
            action();
            return true;
        }

        if self.pending_writes.load(Ordering::SeqCst) > 0 {
            return false;
        }

        match self.state.try_read() {
            Some(_guard) => {
                action();
                true
            }
            None => false,
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// RAII guard for an exclusive write phase
pub struct WritePhase<'a> {
    host: &'a LocalHost,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl Drop for WritePhase<'_> {
    fn drop(&mut self) {
        *self.host.writer.lock() = None;
        self.host.pending_writes.fetch_sub(1, Ordering::SeqCst);
    }
}
