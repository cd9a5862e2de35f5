//! Work queue with bounded loading
//!
//! [`WorkQueue`] is the contract the workers consume: take one item, push
//! one back, release one slot. [`ContentQueue`] implements it with a
//! dedicated loader thread that turns source entries into loaded items,
//! never holding more than `capacity` loaded-but-unreleased items at once.
//!
//! Every successful `take` must be paired with exactly one `release`,
//! whether the item was completed or pushed back. [`QueueStats`] counts
//! both sides so the pairing can be checked.

use crate::cancel::CancelToken;
use crate::error::Cancelled;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::fmt::Debug;
use std::hash::Hash;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How often a blocked `take` re-checks its cancel token
const TAKE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How often the loader re-checks for close while waiting for a slot
const SLOT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A unit of work handed to the content processor
pub trait WorkItem: Send {
    /// Identity of the item within a session
    type Key: Eq + Hash + Clone + Debug + Send + Sync;

    /// Identity used for in-flight tracking and sticky failures
    fn key(&self) -> Self::Key;

    /// Location shown in the progress status line
    fn container_label(&self) -> Option<String> {
        None
    }

    /// Containers (directories) are retired without being processed
    fn is_container(&self) -> bool {
        false
    }
}

/// Blocking queue of work items shared by all workers of a session
pub trait WorkQueue: Send + Sync {
    /// Item type handed out by `take`
    type Item: WorkItem;

    /// Start producing items; calling it again has no effect
    ///
    /// Fails if the queue cannot load at all, so an unloaded queue is never
    /// mistaken for an exhausted one.
    fn start_loading(&self) -> io::Result<()>;

    /// Take the next item, blocking until one is available
    ///
    /// Returns `Ok(None)` once the queue is exhausted and `Err(Cancelled)`
    /// if `cancel` fires while waiting.
    fn take(&self, cancel: &CancelToken) -> Result<Option<Self::Item>, Cancelled>;

    /// Return an unfinished item so a later `take` hands it out again
    fn push_back(&self, item: Self::Item);

    /// Release the slot acquired by the `take` that produced `item`
    fn release(&self, item: &Self::Item);

    /// Stop loading; items already loaded stay available
    fn close(&self);
}

/// Statistics for a content queue
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Items produced by the loader
    pub loaded: AtomicU64,

    /// Successful takes
    pub taken: AtomicU64,

    /// Slot releases
    pub released: AtomicU64,

    /// Items returned via push-back
    pub pushed_back: AtomicU64,
}

impl QueueStats {
    /// Takes not yet matched by a release
    pub fn unreleased(&self) -> u64 {
        self.taken
            .load(Ordering::SeqCst)
            .saturating_sub(self.released.load(Ordering::SeqCst))
    }
}

/// Counting semaphore over loaded-but-unreleased items
struct Slots {
    outstanding: Mutex<usize>,
    freed: Condvar,
    capacity: usize,
}

impl Slots {
    fn new(capacity: usize) -> Self {
        Self {
            outstanding: Mutex::new(0),
            freed: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Wait for a free slot; returns false if `closed` was set first
    fn acquire(&self, closed: &AtomicBool) -> bool {
        let mut outstanding = self.outstanding.lock();
        while *outstanding >= self.capacity {
            if closed.load(Ordering::SeqCst) {
                return false;
            }
            self.freed.wait_for(&mut outstanding, SLOT_POLL_INTERVAL);
        }
        *outstanding += 1;
        true
    }

    /// Account for a pushed-back item without waiting
    fn reacquire(&self) {
        *self.outstanding.lock() += 1;
    }

    fn release(&self) -> bool {
        let mut outstanding = self.outstanding.lock();
        if *outstanding == 0 {
            return false;
        }
        *outstanding -= 1;
        self.freed.notify_one();
        true
    }

    fn outstanding(&self) -> usize {
        *self.outstanding.lock()
    }
}

type Loader<S, T> = Arc<dyn Fn(S) -> T + Send + Sync>;

/// Bounded queue that loads items on a background thread
pub struct ContentQueue<S, T> {
    /// Source entries, moved into the loader thread on start
    sources: Mutex<Option<Vec<S>>>,

    /// Turns a source entry into a loaded item
    loader: Loader<S, T>,

    /// Sender handed to the loader thread
    ready_tx: Mutex<Option<Sender<T>>>,

    /// Loaded items waiting to be taken
    ready_rx: Receiver<T>,

    /// Items pushed back, served before fresh ones
    pushed_back: Mutex<Vec<T>>,

    /// Slot accounting
    slots: Arc<Slots>,

    /// Set by `close`
    closed: Arc<AtomicBool>,

    /// Loader thread handle
    loader_handle: Mutex<Option<JoinHandle<()>>>,

    /// Set when the loader thread could not be started
    loader_failed: AtomicBool,

    /// Queue statistics
    stats: Arc<QueueStats>,
}

impl<S, T> ContentQueue<S, T>
where
    S: Send + 'static,
    T: WorkItem + 'static,
{
    /// Create a queue over `sources`, loading at most `capacity` ahead
    pub fn new<F>(sources: Vec<S>, capacity: usize, loader: F) -> Self
    where
        F: Fn(S) -> T + Send + Sync + 'static,
    {
        let (ready_tx, ready_rx) = unbounded();

        Self {
            sources: Mutex::new(Some(sources)),
            loader: Arc::new(loader),
            ready_tx: Mutex::new(Some(ready_tx)),
            ready_rx,
            pushed_back: Mutex::new(Vec::new()),
            slots: Arc::new(Slots::new(capacity)),
            closed: Arc::new(AtomicBool::new(false)),
            loader_handle: Mutex::new(None),
            loader_failed: AtomicBool::new(false),
            stats: Arc::new(QueueStats::default()),
        }
    }

    /// Get queue statistics
    pub fn stats(&self) -> Arc<QueueStats> {
        Arc::clone(&self.stats)
    }

    /// Loaded items currently holding a slot
    pub fn outstanding(&self) -> usize {
        self.slots.outstanding()
    }

    /// Get slot capacity
    pub fn capacity(&self) -> usize {
        self.slots.capacity
    }

    fn pop_pushed_back(&self) -> Option<T> {
        let item = self.pushed_back.lock().pop()?;
        self.stats.taken.fetch_add(1, Ordering::SeqCst);
        Some(item)
    }
}

impl<T> ContentQueue<T, T>
where
    T: WorkItem + 'static,
{
    /// Queue over items that need no loading
    pub fn preloaded(items: Vec<T>, capacity: usize) -> Self {
        Self::new(items, capacity, |item| item)
    }
}

impl<S, T> WorkQueue for ContentQueue<S, T>
where
    S: Send + 'static,
    T: WorkItem + 'static,
{
    type Item = T;

    fn start_loading(&self) -> io::Result<()> {
        let Some(ready_tx) = self.ready_tx.lock().take() else {
            if self.loader_failed.load(Ordering::SeqCst) {
                return Err(io::Error::other("content loader failed to start"));
            }
            return Ok(());
        };
        let sources = self.sources.lock().take().unwrap_or_default();
        let loader = Arc::clone(&self.loader);
        let slots = Arc::clone(&self.slots);
        let closed = Arc::clone(&self.closed);
        let stats = Arc::clone(&self.stats);

        debug!(items = sources.len(), capacity = slots.capacity, "Starting content loader");

        let spawned = thread::Builder::new()
            .name("content-loader".into())
            .spawn(move || load_loop(sources, loader, ready_tx, slots, closed, stats));

        match spawned {
            Ok(handle) => {
                *self.loader_handle.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to spawn content loader");
                self.loader_failed.store(true, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn take(&self, cancel: &CancelToken) -> Result<Option<T>, Cancelled> {
        loop {
            // A cancelled taker must not pick up pushed-back work
            cancel.check()?;

            if let Some(item) = self.pop_pushed_back() {
                return Ok(Some(item));
            }

            match self.ready_rx.recv_timeout(TAKE_POLL_INTERVAL) {
                Ok(item) => {
                    self.stats.taken.fetch_add(1, Ordering::SeqCst);
                    return Ok(Some(item));
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    if let Some(item) = self.pop_pushed_back() {
                        return Ok(Some(item));
                    }
                    return Ok(None);
                }
            }
        }
    }

    fn push_back(&self, item: T) {
        trace!(item = ?item.key(), "Item pushed back");
        self.slots.reacquire();
        self.stats.pushed_back.fetch_add(1, Ordering::SeqCst);
        self.pushed_back.lock().push(item);
    }

    fn release(&self, item: &T) {
        if !self.slots.release() {
            warn!(item = ?item.key(), "Released more slots than were taken");
        }
        self.stats.released.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Never started: drop the sender so takers see exhaustion
        self.ready_tx.lock().take();
    }
}

impl<S, T> Drop for ContentQueue<S, T> {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.loader_handle.lock().take() {
            if handle.join().is_err() {
                warn!("Content loader panicked");
            }
        }
    }
}

fn load_loop<S, T>(
    sources: Vec<S>,
    loader: Loader<S, T>,
    ready_tx: Sender<T>,
    slots: Arc<Slots>,
    closed: Arc<AtomicBool>,
    stats: Arc<QueueStats>,
) {
    for source in sources {
        if !slots.acquire(&closed) {
            debug!("Content queue closed, loader stopping");
            return;
        }

        let item = loader(source);
        stats.loaded.fetch_add(1, Ordering::SeqCst);

        if ready_tx.send(item).is_err() {
            return;
        }
    }

    debug!(loaded = stats.loaded.load(Ordering::SeqCst), "Content loader finished");
}
