//! Scheduler - drives a session to completion in batches
//!
//! The scheduler is responsible for:
//! - Sizing the worker pool for each batch
//! - Entering a cancellation scope tied to the host's write phases
//! - Running workers (inline or on scoped threads) and waiting for them
//! - Retrying interrupted batches until the queue is fully drained
//! - Surfacing caller cancellation and session disposal as errors

use crate::cancel::{CancelToken, CancellationScope};
use crate::config::RunnerConfig;
use crate::error::{CancelReason, Result, RunnerError, WorkerError};
use crate::host::Host;
use crate::runner::queue::{ContentQueue, WorkItem, WorkQueue};
use crate::runner::session::Session;
use crate::runner::worker::{aggregate_stats, BatchContext, ContentProcessor, Worker, WorkerExit, WorkerStats};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Result of a fully drained session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexResult {
    /// Items processed successfully
    pub processed: u64,

    /// Items flagged as sticky failures
    pub failed: u64,

    /// Items skipped because they had failed before
    pub skipped: u64,

    /// Push-backs across all batches
    pub requeued: u64,

    /// Batches attempted
    pub batches: u64,

    /// Time taken
    pub duration: Duration,
}

/// Outcome of one batch attempt
#[derive(Debug, Clone, Copy)]
struct BatchReport {
    /// Every worker drained the queue without being cancelled
    fully_finished: bool,

    /// Workers that took part
    workers: usize,
}

/// Drives sessions to completion on a host
pub struct Scheduler {
    /// Host services
    host: Arc<dyn Host>,

    /// Configuration
    config: RunnerConfig,
}

impl Scheduler {
    /// Create a scheduler with default configuration
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self::with_config(host, RunnerConfig::default())
    }

    /// Create a scheduler with the given configuration
    pub fn with_config(host: Arc<dyn Host>, config: RunnerConfig) -> Self {
        Self { host, config }
    }

    /// Get the configuration
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Worker count the next batch would use
    pub fn thread_budget(&self) -> usize {
        self.config.thread_budget(self.host.as_ref())
    }

    /// Process every item, blocking until all are done or flagged
    ///
    /// Builds a session over a preloaded queue; use
    /// [`Scheduler::process_session`] for custom queues, progress sinks or
    /// disposal from another thread.
    pub fn process<T, P>(&self, cancel: &CancelToken, items: Vec<T>, processor: &P) -> Result<IndexResult>
    where
        T: WorkItem + 'static,
        P: ContentProcessor<T>,
    {
        cancel.check().map_err(|_| RunnerError::Cancelled(CancelReason::Caller))?;

        let total = items.len();
        let session = Session::new(ContentQueue::preloaded(items, self.config.queue_size), total);
        self.process_session(cancel, &session, processor)
    }

    /// Drive `session` until its queue is fully drained
    ///
    /// Returns `RunnerError::Cancelled` if the caller's token fires, the
    /// session is disposed, or the host shuts down. Queue state survives
    /// interrupted batches; nothing is restarted from scratch.
    pub fn process_session<Q, P>(&self, cancel: &CancelToken, session: &Session<Q>, processor: &P) -> Result<IndexResult>
    where
        Q: WorkQueue,
        P: ContentProcessor<Q::Item>,
    {
        self.check_outer(cancel, session)?;

        let start = Instant::now();
        session.queue().start_loading()?;

        info!(
            session = %session.id(),
            items = session.progress().total(),
            threads = self.thread_budget(),
            "Starting indexing"
        );

        loop {
            self.check_outer(cancel, session)?;

            let batch = session.totals().batches.fetch_add(1, Ordering::SeqCst) + 1;
            let report = self.run_batch(batch, cancel, session, processor)?;

            if report.fully_finished {
                debug!(session = %session.id(), batch, workers = report.workers, "Batch drained the queue");
                break;
            }

            debug!(session = %session.id(), batch, workers = report.workers, "Batch interrupted, retrying");
            if !self.config.retry_pause.is_zero() {
                thread::sleep(self.config.retry_pause);
            }
        }

        // A fully drained pass is a completion even if the caller cancelled
        // during its last item
        self.check_disposed(session)?;

        let totals = session.totals();
        let result = IndexResult {
            processed: totals.processed.load(Ordering::SeqCst),
            failed: totals.failed.load(Ordering::SeqCst),
            skipped: totals.skipped.load(Ordering::SeqCst),
            requeued: totals.requeued.load(Ordering::SeqCst),
            batches: totals.batches.load(Ordering::SeqCst),
            duration: start.elapsed(),
        };

        if result.failed > 0 {
            warn!(
                session = %session.id(),
                failed = result.failed,
                "Some items failed to index; restart to retry them"
            );
        }

        info!(
            session = %session.id(),
            processed = result.processed,
            failed = result.failed,
            batches = result.batches,
            duration_ms = result.duration.as_millis() as u64,
            "Indexing completed"
        );

        Ok(result)
    }

    fn check_outer<Q: WorkQueue>(&self, cancel: &CancelToken, session: &Session<Q>) -> Result<()> {
        self.check_disposed(session)?;
        if cancel.is_cancelled() {
            return Err(CancelReason::Caller.into());
        }
        Ok(())
    }

    fn check_disposed<Q: WorkQueue>(&self, session: &Session<Q>) -> Result<()> {
        if session.is_disposed() {
            return Err(CancelReason::SessionDisposed.into());
        }
        if self.host.is_disposed() {
            return Err(CancelReason::HostDisposed.into());
        }
        Ok(())
    }

    /// Run one batch attempt
    fn run_batch<Q, P>(&self, batch: u64, cancel: &CancelToken, session: &Session<Q>, processor: &P) -> Result<BatchReport>
    where
        Q: WorkQueue,
        P: ContentProcessor<Q::Item>,
    {
        let host = self.host.as_ref();
        let scope = CancellationScope::enter(host, [cancel.clone(), session.disposed_token().clone()]);
        let budget = self.config.thread_budget(host);

        let ctx = BatchContext {
            session,
            host,
            scope: scope.token(),
            processor,
            max_requeues: self.config.max_requeues,
            batch,
        };

        let report = if budget == 1 || host.holds_exclusive_access() {
            debug!(session = %session.id(), batch, "Running batch on calling thread");
            let worker = Worker::new(0, &ctx);
            let exit = worker.run();
            absorb(session, [worker.stats()]);
            BatchReport {
                fully_finished: exit == WorkerExit::Drained,
                workers: 1,
            }
        } else {
            self.run_pool(&ctx, &scope, budget)?
        };

        Ok(report)
    }

    /// Run `budget` workers on scoped threads and wait for all of them
    fn run_pool<Q, P>(&self, ctx: &BatchContext<'_, Q, P>, scope: &CancellationScope<'_>, budget: usize) -> Result<BatchReport>
    where
        Q: WorkQueue,
        P: ContentProcessor<Q::Item>,
    {
        let session = ctx.session;

        let stats: Vec<Arc<WorkerStats>> = (0..budget).map(|_| Arc::default()).collect();

        let report = thread::scope(|s| {
            let mut handles = Vec::with_capacity(budget);

            for (id, worker_stats) in stats.iter().enumerate() {
                let worker_stats = Arc::clone(worker_stats);
                let spawned = thread::Builder::new()
                    .name(format!("indexer-{}-{}", session.id(), id))
                    .spawn_scoped(s, move || Worker::with_stats(id, ctx, worker_stats).run());

                match spawned {
                    Ok(handle) => handles.push((id, handle)),
                    Err(e) => {
                        error!(session = %session.id(), worker = id, error = %e, "Failed to spawn worker");
                        // Stop the workers already running before bailing out
                        scope.cancel();
                        for (_, handle) in handles {
                            let _ = handle.join();
                        }
                        return Err(RunnerError::Worker(WorkerError::SpawnFailed {
                            id,
                            reason: e.to_string(),
                        }));
                    }
                }
            }

            let mut all_finished = true;

            for (id, handle) in handles {
                match handle.join() {
                    Ok(exit) => all_finished &= exit == WorkerExit::Drained,
                    Err(_) => {
                        let err = WorkerError::Panicked {
                            id,
                            message: "worker thread panicked".into(),
                        };
                        error!(session = %session.id(), error = %err, "Worker did not finish cleanly");
                        all_finished = false;
                    }
                }
            }

            Ok(BatchReport {
                fully_finished: all_finished,
                workers: budget,
            })
        });

        // Counted even for workers that died or were never joined
        absorb(session, stats.iter().map(|s| &**s));
        report
    }
}

/// Add per-worker statistics to the session totals
fn absorb<'w, Q, I>(session: &Session<Q>, stats: I)
where
    Q: WorkQueue,
    I: IntoIterator<Item = &'w WorkerStats>,
{
    let (processed, failed, skipped, requeued) = aggregate_stats(stats);
    let totals = session.totals();
    totals.processed.fetch_add(processed, Ordering::SeqCst);
    totals.failed.fetch_add(failed, Ordering::SeqCst);
    totals.skipped.fetch_add(skipped, Ordering::SeqCst);
    totals.requeued.fetch_add(requeued, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Cancelled, ProcessError};
    use crate::host::LocalHost;
    use std::io;

    #[derive(Debug)]
    struct Item(u32);

    impl WorkItem for Item {
        type Key = u32;

        fn key(&self) -> u32 {
            self.0
        }
    }

    fn items(n: u32) -> Vec<Item> {
        (0..n).map(Item).collect()
    }

    fn ok(_: &Item, _: &CancelToken) -> std::result::Result<(), ProcessError> {
        Ok(())
    }

    #[test]
    fn test_process_all_items() {
        let host: Arc<dyn Host> = Arc::new(LocalHost::with_parallelism(8));
        let scheduler = Scheduler::with_config(host, RunnerConfig::default().with_thread_count(4));

        let result = scheduler.process(&CancelToken::new(), items(20), &ok).unwrap();
        assert_eq!(result.processed, 20);
        assert_eq!(result.failed, 0);
        assert_eq!(result.batches, 1);
    }

    #[test]
    fn test_precancelled_token_fails_fast() {
        let host: Arc<dyn Host> = Arc::new(LocalHost::with_parallelism(2));
        let scheduler = Scheduler::new(host);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = scheduler.process(&cancel, items(3), &ok).unwrap_err();
        assert!(matches!(err, RunnerError::Cancelled(CancelReason::Caller)));
    }

    #[test]
    fn test_empty_input_completes() {
        let host: Arc<dyn Host> = Arc::new(LocalHost::with_parallelism(4));
        let scheduler = Scheduler::new(host);

        let result = scheduler.process(&CancelToken::new(), Vec::<Item>::new(), &ok).unwrap();
        assert_eq!(result.processed, 0);
        assert_eq!(result.batches, 1);
    }

    #[test]
    fn test_disposed_host_is_cancellation() {
        let local = Arc::new(LocalHost::with_parallelism(2));
        local.dispose();
        let scheduler = Scheduler::new(local);

        let err = scheduler.process(&CancelToken::new(), items(3), &ok).unwrap_err();
        assert!(matches!(err, RunnerError::Cancelled(CancelReason::HostDisposed)));
    }

    #[test]
    fn test_thread_budget_uses_host() {
        let host: Arc<dyn Host> = Arc::new(LocalHost::with_parallelism(16));
        assert_eq!(Scheduler::new(Arc::clone(&host)).thread_budget(), 4);

        let scheduler = Scheduler::with_config(host, RunnerConfig::default().with_thread_count(1));
        assert_eq!(scheduler.thread_budget(), 1);
    }

    /// Queue that cancels the caller's token the moment it runs dry
    struct CancelOnDrain {
        inner: ContentQueue<Item, Item>,
        caller: CancelToken,
    }

    impl WorkQueue for CancelOnDrain {
        type Item = Item;

        fn start_loading(&self) -> io::Result<()> {
            self.inner.start_loading()
        }

        fn take(&self, cancel: &CancelToken) -> std::result::Result<Option<Item>, Cancelled> {
            let next = self.inner.take(cancel)?;
            if next.is_none() {
                self.caller.cancel();
            }
            Ok(next)
        }

        fn push_back(&self, item: Item) {
            self.inner.push_back(item);
        }

        fn release(&self, item: &Item) {
            self.inner.release(item);
        }

        fn close(&self) {
            self.inner.close();
        }
    }

    #[test]
    fn test_drained_pass_completes_despite_late_cancel() {
        let host: Arc<dyn Host> = Arc::new(LocalHost::with_parallelism(4));
        let scheduler = Scheduler::with_config(host, RunnerConfig::default().with_thread_count(1));
        let cancel = CancelToken::new();
        let queue = CancelOnDrain {
            inner: ContentQueue::preloaded(items(3), 2),
            caller: cancel.clone(),
        };
        let session = Session::new(queue, 3);

        let result = scheduler.process_session(&cancel, &session, &ok).unwrap();
        assert!(cancel.is_cancelled());
        assert_eq!(result.processed, 3);
        assert_eq!(result.batches, 1);
    }

    /// Queue whose loader can never start
    struct Unstartable;

    impl WorkQueue for Unstartable {
        type Item = Item;

        fn start_loading(&self) -> io::Result<()> {
            Err(io::Error::other("loader thread unavailable"))
        }

        fn take(&self, _cancel: &CancelToken) -> std::result::Result<Option<Item>, Cancelled> {
            Ok(None)
        }

        fn push_back(&self, _item: Item) {}

        fn release(&self, _item: &Item) {}

        fn close(&self) {}
    }

    #[test]
    fn test_loader_start_failure_is_an_error() {
        let host: Arc<dyn Host> = Arc::new(LocalHost::with_parallelism(4));
        let scheduler = Scheduler::new(host);
        let session = Session::new(Unstartable, 5);

        let err = scheduler.process_session(&CancelToken::new(), &session, &ok).unwrap_err();
        assert!(matches!(err, RunnerError::Io(_)));
        assert_eq!(session.totals().batches.load(Ordering::SeqCst), 0);
    }
}
