//! Session state for one indexing pass
//!
//! A session owns everything that must survive from one batch to the next:
//! the work queue, progress, items that failed permanently and the running
//! totals. It is dropped when the pass ends, which closes its queue.

use crate::cancel::CancelToken;
use crate::progress::{NullSink, ProgressAggregator, ProgressSink};
use crate::runner::queue::{WorkItem, WorkQueue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier carried into worker thread names and log fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Items that must never be processed again in this session
pub struct StickyFailureMap<K> {
    failures: Mutex<HashMap<K, String>>,
}

impl<K: Eq + Hash + Clone> StickyFailureMap<K> {
    pub fn new() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Flag an item; returns false if it was already flagged
    pub fn flag(&self, key: K, reason: impl Into<String>) -> bool {
        let mut failures = self.failures.lock();
        if failures.contains_key(&key) {
            return false;
        }
        failures.insert(key, reason.into());
        true
    }

    pub fn contains(&self, key: &K) -> bool {
        self.failures.lock().contains_key(key)
    }

    pub fn reason(&self, key: &K) -> Option<String> {
        self.failures.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.failures.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all flagged items
    pub fn entries(&self) -> Vec<(K, String)> {
        self.failures
            .lock()
            .iter()
            .map(|(k, r)| (k.clone(), r.clone()))
            .collect()
    }
}

impl<K: Eq + Hash + Clone> Default for StickyFailureMap<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Running totals across every batch of a session
#[derive(Debug, Default)]
pub struct SessionTotals {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
    pub requeued: AtomicU64,
    pub batches: AtomicU64,
}

/// Cloneable handle for disposing a session from another thread
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    disposed: CancelToken,
}

impl SessionHandle {
    /// Dispose the session; running batches stop at their next check
    pub fn dispose(&self) {
        debug!(session = %self.id, "Session disposed");
        self.disposed.cancel();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }
}

type KeyOf<Q> = <<Q as WorkQueue>::Item as WorkItem>::Key;

/// One indexing pass over a fixed item collection
pub struct Session<Q: WorkQueue> {
    id: SessionId,
    queue: Q,
    progress: ProgressAggregator<KeyOf<Q>>,
    sticky: StickyFailureMap<KeyOf<Q>>,
    requeues: Mutex<HashMap<KeyOf<Q>, u32>>,
    panics: Mutex<HashMap<KeyOf<Q>, u32>>,
    totals: SessionTotals,
    disposed: CancelToken,
}

impl<Q: WorkQueue> Session<Q> {
    /// Create a session over `total` items without progress display
    pub fn new(queue: Q, total: usize) -> Self {
        Self::with_sink(queue, total, Box::new(NullSink))
    }

    /// Create a session publishing progress to `sink`
    pub fn with_sink(queue: Q, total: usize, sink: Box<dyn ProgressSink>) -> Self {
        Self {
            id: SessionId::next(),
            queue,
            progress: ProgressAggregator::new(total, sink),
            sticky: StickyFailureMap::new(),
            requeues: Mutex::new(HashMap::new()),
            panics: Mutex::new(HashMap::new()),
            totals: SessionTotals::default(),
            disposed: CancelToken::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn progress(&self) -> &ProgressAggregator<KeyOf<Q>> {
        &self.progress
    }

    pub fn sticky_failures(&self) -> &StickyFailureMap<KeyOf<Q>> {
        &self.sticky
    }

    pub fn totals(&self) -> &SessionTotals {
        &self.totals
    }

    /// Handle that can dispose this session from elsewhere
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id,
            disposed: self.disposed.clone(),
        }
    }

    pub fn dispose(&self) {
        self.handle().dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }

    /// Token cancelled on disposal, linked into every batch scope
    pub(crate) fn disposed_token(&self) -> &CancelToken {
        &self.disposed
    }

    /// Count a requeue of `key`, returning how often it has been requeued
    pub(crate) fn note_requeue(&self, key: &KeyOf<Q>) -> u32 {
        let mut requeues = self.requeues.lock();
        let count = requeues.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    /// Count a worker panic while handling `key`
    pub(crate) fn note_panic(&self, key: &KeyOf<Q>) -> u32 {
        let mut panics = self.panics.lock();
        let count = panics.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }
}

impl<Q: WorkQueue> Drop for Session<Q> {
    fn drop(&mut self) {
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::queue::ContentQueue;

    #[derive(Debug)]
    struct Num(u32);

    impl WorkItem for Num {
        type Key = u32;

        fn key(&self) -> u32 {
            self.0
        }
    }

    #[test]
    fn test_sticky_flag_once() {
        let sticky = StickyFailureMap::new();
        assert!(sticky.flag(5u32, "corrupt"));
        assert!(!sticky.flag(5u32, "again"));
        assert!(sticky.contains(&5));
        assert_eq!(sticky.reason(&5).as_deref(), Some("corrupt"));
        assert_eq!(sticky.len(), 1);
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = Session::new(ContentQueue::preloaded(vec![Num(1)], 1), 1);
        let b = Session::new(ContentQueue::preloaded(vec![Num(1)], 1), 1);
        assert_ne!(a.id(), b.id());
        assert!(a.id().to_string().starts_with('s'));
    }

    #[test]
    fn test_handle_disposes_session() {
        let session = Session::new(ContentQueue::preloaded(vec![Num(1)], 1), 1);
        let handle = session.handle();
        assert!(!session.is_disposed());

        handle.dispose();
        assert!(session.is_disposed());
        assert!(session.disposed_token().is_cancelled());
    }

    #[test]
    fn test_requeue_counts_per_item() {
        let session = Session::new(ContentQueue::preloaded(vec![Num(1), Num(2)], 2), 2);
        assert_eq!(session.note_requeue(&1), 1);
        assert_eq!(session.note_requeue(&1), 2);
        assert_eq!(session.note_requeue(&2), 1);
        assert_eq!(session.note_panic(&1), 1);
        assert_eq!(session.note_requeue(&1), 3);
    }
}
