//! Worker pull loop
//!
//! Each worker:
//! - Takes items from the session's work queue until it is exhausted
//! - Registers the item as in flight and updates the status label
//! - Runs the content processor under read access to host state
//! - Retires the item, flags it as a sticky failure, or pushes it back
//! - Releases the item's queue slot on every path
//!
//! A worker stops as soon as its batch scope is cancelled. Only a worker
//! that saw the queue run dry reports [`WorkerExit::Drained`].

use crate::cancel::CancelToken;
use crate::error::ProcessError;
use crate::host::Host;
use crate::runner::queue::{WorkItem, WorkQueue};
use crate::runner::session::{Session, SessionId};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, trace, warn};

/// Extracts content from one item
///
/// Implementations should poll `cancel` during long work and return
/// `ProcessError::Cancelled` when it fires; the item is then requeued.
pub trait ContentProcessor<T>: Sync {
    fn process(&self, item: &T, cancel: &CancelToken) -> Result<(), ProcessError>;
}

impl<T, F> ContentProcessor<T> for F
where
    F: Fn(&T, &CancelToken) -> Result<(), ProcessError> + Sync,
{
    fn process(&self, item: &T, cancel: &CancelToken) -> Result<(), ProcessError> {
        self(item, cancel)
    }
}

/// What happened to one taken item in this batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Processed (or a container, retired without processing)
    Done,

    /// Flagged as permanently failed for this session
    StickyFailed(String),

    /// Already flagged earlier; not processed again
    Skipped,

    /// Returned to the queue for a later batch
    Requeued,
}

/// Why a worker left its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The queue reported exhaustion
    Drained,

    /// The batch scope, the session or the caller was cancelled
    Cancelled,
}

/// Statistics collected by a worker
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Items processed successfully
    pub processed: AtomicU64,

    /// Items that became sticky failures
    pub failed: AtomicU64,

    /// Items skipped because they had already failed
    pub skipped: AtomicU64,

    /// Items pushed back to the queue
    pub requeued: AtomicU64,
}

impl WorkerStats {
    fn record(&self, outcome: &ItemOutcome) {
        let counter = match outcome {
            ItemOutcome::Done => &self.processed,
            ItemOutcome::StickyFailed(_) => &self.failed,
            ItemOutcome::Skipped => &self.skipped,
            ItemOutcome::Requeued => &self.requeued,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything a worker borrows for the duration of one batch
pub struct BatchContext<'a, Q: WorkQueue, P> {
    pub session: &'a Session<Q>,
    pub host: &'a dyn Host,
    pub scope: &'a CancelToken,
    pub processor: &'a P,
    pub max_requeues: Option<u32>,
    pub batch: u64,
}

/// One worker of a batch
pub struct Worker<'a, Q: WorkQueue, P> {
    /// Worker ID within the batch
    id: usize,

    /// Session the worker belongs to
    session_id: SessionId,

    /// Shared batch state
    ctx: &'a BatchContext<'a, Q, P>,

    /// Worker statistics, readable by the scheduler even if the thread dies
    stats: Arc<WorkerStats>,
}

impl<'a, Q, P> Worker<'a, Q, P>
where
    Q: WorkQueue,
    P: ContentProcessor<Q::Item>,
{
    pub fn new(id: usize, ctx: &'a BatchContext<'a, Q, P>) -> Self {
        Self::with_stats(id, ctx, Arc::default())
    }

    /// Create a worker that records into `stats`
    pub fn with_stats(id: usize, ctx: &'a BatchContext<'a, Q, P>, stats: Arc<WorkerStats>) -> Self {
        Self {
            id,
            session_id: ctx.session.id(),
            ctx,
            stats,
        }
    }

    /// Get worker statistics
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Run until the queue is drained or the scope is cancelled
    pub fn run(&self) -> WorkerExit {
        trace!(session = %self.session_id, batch = self.ctx.batch, worker = self.id, "Worker starting");

        let exit = self.pull_loop();

        debug!(
            session = %self.session_id,
            batch = self.ctx.batch,
            worker = self.id,
            exit = ?exit,
            processed = self.stats.processed.load(Ordering::Relaxed),
            requeued = self.stats.requeued.load(Ordering::Relaxed),
            "Worker finished"
        );
        exit
    }

    fn pull_loop(&self) -> WorkerExit {
        let queue = self.ctx.session.queue();

        loop {
            if self.ctx.scope.is_cancelled() || self.ctx.session.is_disposed() {
                return WorkerExit::Cancelled;
            }

            let item = match queue.take(self.ctx.scope) {
                Ok(Some(item)) => item,
                Ok(None) => return WorkerExit::Drained,
                Err(_) => return WorkerExit::Cancelled,
            };
            let mut taken = Taken {
                queue,
                item: Some(item),
            };

            let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.handle_item(&mut taken))) {
                Ok(outcome) => outcome,
                Err(payload) => self.recover_from_panic(&mut taken, payload.as_ref()),
            };
            self.stats.record(&outcome);

            if outcome == ItemOutcome::Requeued {
                return WorkerExit::Cancelled;
            }
        }
    }

    fn handle_item(&self, taken: &mut Taken<'_, Q>) -> ItemOutcome {
        let session = self.ctx.session;
        let item = taken.item();
        let key = item.key();

        if session.sticky_failures().contains(&key) {
            trace!(worker = self.id, item = ?key, "Skipping previously failed item");
            session.progress().mark_retired();
            return ItemOutcome::Skipped;
        }

        let label = item.container_label();
        let in_flight = InFlight::enter(session, &key, label.as_deref());

        let outcome = if item.is_container() {
            ItemOutcome::Done
        } else {
            self.process_under_read(item)
        };

        drop(in_flight);

        match outcome {
            ItemOutcome::Requeued => self.requeue(taken, key),
            ItemOutcome::StickyFailed(reason) => {
                self.flag_failure(key, &reason);
                ItemOutcome::StickyFailed(reason)
            }
            other => {
                session.progress().mark_retired();
                other
            }
        }
    }

    /// Put an item back after a panic outside the processor
    ///
    /// The first panic on an item requeues it; a second one flags it.
    fn recover_from_panic(&self, taken: &mut Taken<'_, Q>, payload: &(dyn Any + Send)) -> ItemOutcome {
        let message = panic_message(payload);
        let Some(key) = taken.item.as_ref().map(WorkItem::key) else {
            // Already pushed back before the panic
            error!(session = %self.session_id, worker = self.id, error = %message, "Worker panicked after requeue");
            return ItemOutcome::Requeued;
        };

        error!(
            session = %self.session_id,
            worker = self.id,
            item = ?key,
            error = %message,
            "Worker panicked while handling item"
        );

        if self.ctx.session.note_panic(&key) > 1 {
            let reason = format!("panicked twice while indexing: {}", message);
            self.flag_failure(key, &reason);
            return ItemOutcome::StickyFailed(reason);
        }
        self.requeue(taken, key)
    }

    fn process_under_read(&self, item: &Q::Item) -> ItemOutcome {
        let mut result = None;
        let granted = !self.ctx.host.is_disposed()
            && self.ctx.host.try_run_read(&mut || {
                if self.ctx.scope.is_cancelled() || self.ctx.session.is_disposed() {
                    result = Some(Err(ProcessError::Cancelled));
                    return;
                }
                result = Some(invoke(self.ctx.processor, item, self.ctx.scope));
            });

        if !granted {
            trace!(worker = self.id, "Read access denied, yielding");
            return ItemOutcome::Requeued;
        }

        match result {
            Some(Ok(())) => ItemOutcome::Done,
            Some(Err(ProcessError::Cancelled)) | None => ItemOutcome::Requeued,
            Some(Err(ProcessError::Failed { reason })) => ItemOutcome::StickyFailed(reason),
        }
    }

    fn requeue(&self, taken: &mut Taken<'_, Q>, key: <Q::Item as WorkItem>::Key) -> ItemOutcome {
        let session = self.ctx.session;
        let count = session.note_requeue(&key);

        if let Some(max) = self.ctx.max_requeues {
            if count > max {
                let reason = format!("requeued {} times, limit is {}", count - 1, max);
                self.flag_failure(key, &reason);
                return ItemOutcome::StickyFailed(reason);
            }
        }

        trace!(worker = self.id, item = ?key, requeues = count, "Requeueing item");
        taken.push_back();
        ItemOutcome::Requeued
    }

    fn flag_failure(&self, key: <Q::Item as WorkItem>::Key, reason: &str) {
        let session = self.ctx.session;
        error!(
            session = %self.session_id,
            worker = self.id,
            item = ?key,
            error = %reason,
            "Error while indexing item; it will not be retried until restart"
        );
        if !session.sticky_failures().flag(key, reason) {
            warn!(worker = self.id, "Item was already flagged as failed");
        }
        session.progress().mark_retired();
    }
}

/// In-flight registration, removed on drop only if this worker added it
struct InFlight<'s, Q: WorkQueue> {
    session: &'s Session<Q>,
    key: Option<<Q::Item as WorkItem>::Key>,
}

impl<'s, Q: WorkQueue> InFlight<'s, Q> {
    fn enter(session: &'s Session<Q>, key: &<Q::Item as WorkItem>::Key, label: Option<&str>) -> Self {
        let added = session.progress().mark_started(key, label);
        Self {
            session,
            key: added.then(|| key.clone()),
        }
    }
}

impl<Q: WorkQueue> Drop for InFlight<'_, Q> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.session.progress().mark_finished(&key);
        }
    }
}

/// A taken item whose slot is released exactly once, however it leaves
struct Taken<'q, Q: WorkQueue> {
    queue: &'q Q,
    item: Option<Q::Item>,
}

impl<Q: WorkQueue> Taken<'_, Q> {
    fn item(&self) -> &Q::Item {
        // Only `push_back` takes the item, and nothing reads it afterwards
        self.item.as_ref().expect("taken item already handed back")
    }

    fn push_back(&mut self) {
        if let Some(item) = self.item.take() {
            self.queue.release(&item);
            self.queue.push_back(item);
        }
    }
}

impl<Q: WorkQueue> Drop for Taken<'_, Q> {
    fn drop(&mut self) {
        if thread::panicking() {
            // Never lose an item to an unwinding worker
            self.push_back();
            return;
        }
        if let Some(item) = self.item.take() {
            self.queue.release(&item);
        }
    }
}

/// Run the processor, turning a panic into an item failure
fn invoke<T, P>(processor: &P, item: &T, cancel: &CancelToken) -> Result<(), ProcessError>
where
    P: ContentProcessor<T>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| processor.process(item, cancel))) {
        Ok(result) => result,
        Err(payload) => Err(ProcessError::failed(format!(
            "processor panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Sum per-worker statistics into session totals
pub fn aggregate_stats<'w, I>(stats: I) -> (u64, u64, u64, u64)
where
    I: IntoIterator<Item = &'w WorkerStats>,
{
    let mut processed = 0u64;
    let mut failed = 0u64;
    let mut skipped = 0u64;
    let mut requeued = 0u64;

    for s in stats {
        processed += s.processed.load(Ordering::Relaxed);
        failed += s.failed.load(Ordering::Relaxed);
        skipped += s.skipped.load(Ordering::Relaxed);
        requeued += s.requeued.load(Ordering::Relaxed);
    }

    (processed, failed, skipped, requeued)
}
