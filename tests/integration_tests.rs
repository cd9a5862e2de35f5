//! Integration tests for indexing-runner
//!
//! These drive the scheduler end to end against a `LocalHost`, including
//! write phases started from other threads.

use indexing_runner::cancel::CancelToken;
use indexing_runner::config::RunnerConfig;
use indexing_runner::content::{ContentExtractor, FileContent};
use indexing_runner::error::{CancelReason, ProcessError, RunnerError};
use indexing_runner::host::{Host, LocalHost};
use indexing_runner::progress::ProgressSink;
use indexing_runner::runner::{ContentQueue, Scheduler, Session, WorkItem};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tempfile::tempdir;

#[derive(Debug)]
struct Doc(u32);

impl WorkItem for Doc {
    type Key = u32;

    fn key(&self) -> u32 {
        self.0
    }

    fn container_label(&self) -> Option<String> {
        Some(format!("/docs/{}", self.0 % 3))
    }
}

fn docs(n: u32) -> Vec<Doc> {
    (0..n).map(Doc).collect()
}

fn scheduler(host: &Arc<LocalHost>, threads: i64) -> Scheduler {
    let config = RunnerConfig::default()
        .with_thread_count(threads)
        .with_retry_pause(Duration::from_millis(1));
    Scheduler::with_config(Arc::clone(host) as Arc<dyn Host>, config)
}

fn preloaded_session(items: Vec<Doc>) -> Session<ContentQueue<Doc, Doc>> {
    let total = items.len();
    Session::new(ContentQueue::preloaded(items, 4), total)
}

#[derive(Default)]
struct RecordingSink {
    fractions: Mutex<Vec<f64>>,
}

impl ProgressSink for RecordingSink {
    fn set_fraction(&self, fraction: f64) {
        self.fractions.lock().push(fraction);
    }

    fn set_status(&self, _status: &str) {}
}

#[test]
fn test_all_items_processed_once() {
    let host = Arc::new(LocalHost::with_parallelism(8));
    let scheduler = scheduler(&host, 4);
    let session = preloaded_session(docs(10));
    let seen = Mutex::new(Vec::new());

    let processor = |doc: &Doc, _: &CancelToken| -> Result<(), ProcessError> {
        seen.lock().push(doc.0);
        Ok(())
    };

    let result = scheduler
        .process_session(&CancelToken::new(), &session, &processor)
        .unwrap();

    let mut seen = seen.into_inner();
    seen.sort_unstable();
    assert_eq!(seen, (0..10).collect::<Vec<_>>());
    assert_eq!(result.processed, 10);
    assert_eq!(result.batches, 1);
    assert_eq!(session.progress().fraction(), 1.0);
    assert_eq!(session.progress().in_flight_len(), 0);
    assert_eq!(session.queue().stats().unreleased(), 0);
    assert_eq!(host.listener_count(), 0);
}

#[test]
fn test_failing_item_is_sticky() {
    let host = Arc::new(LocalHost::with_parallelism(8));
    let scheduler = scheduler(&host, 4);
    let session = preloaded_session(docs(10));

    let processor = |doc: &Doc, _: &CancelToken| -> Result<(), ProcessError> {
        if doc.0 == 5 {
            return Err(ProcessError::failed("corrupt document"));
        }
        Ok(())
    };

    let result = scheduler
        .process_session(&CancelToken::new(), &session, &processor)
        .unwrap();

    assert_eq!(result.processed, 9);
    assert_eq!(result.failed, 1);
    assert_eq!(result.batches, 1);
    assert!(session.sticky_failures().contains(&5));
    assert_eq!(session.progress().fraction(), 1.0);
}

#[test]
fn test_write_phase_requeues_without_loss() {
    let host = Arc::new(LocalHost::with_parallelism(8));
    let scheduler = scheduler(&host, 4);
    let session = preloaded_session(docs(10));

    let dispatched = AtomicUsize::new(0);
    let done = Mutex::new(Vec::new());
    let writer: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);

    let processor = |doc: &Doc, cancel: &CancelToken| -> Result<(), ProcessError> {
        if dispatched.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
            let host = Arc::clone(&host);
            *writer.lock() = Some(thread::spawn(move || {
                let _phase = host.begin_write();
                thread::sleep(Duration::from_millis(30));
            }));

            // Hold the read until the write phase interrupts this batch
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
            return Err(ProcessError::Cancelled);
        }
        done.lock().push(doc.0);
        Ok(())
    };

    let result = scheduler
        .process_session(&CancelToken::new(), &session, &processor)
        .unwrap();

    if let Some(handle) = writer.lock().take() {
        handle.join().unwrap();
    }

    let done = done.into_inner();
    let unique: HashSet<u32> = done.iter().copied().collect();
    assert_eq!(done.len(), 10, "an item was processed twice: {:?}", done);
    assert_eq!(unique.len(), 10);
    assert!(result.batches > 1);
    assert!(result.requeued >= 1);
    assert_eq!(result.failed, 0);
    assert_eq!(session.queue().stats().unreleased(), 0);
    assert_eq!(host.listener_count(), 0);
}

#[test]
fn test_single_thread_override() {
    let host = Arc::new(LocalHost::with_parallelism(16));
    let scheduler = scheduler(&host, 1);
    let session = preloaded_session(docs(8));

    let processor = |_: &Doc, _: &CancelToken| -> Result<(), ProcessError> {
        thread::sleep(Duration::from_millis(2));
        Ok(())
    };

    scheduler
        .process_session(&CancelToken::new(), &session, &processor)
        .unwrap();
    assert_eq!(session.progress().peak_in_flight(), 1);
}

#[test]
fn test_in_flight_bounded_by_workers() {
    let host = Arc::new(LocalHost::with_parallelism(16));
    let scheduler = scheduler(&host, 0);
    assert_eq!(scheduler.thread_budget(), 4);
    let session = preloaded_session(docs(40));

    let processor = |_: &Doc, _: &CancelToken| -> Result<(), ProcessError> {
        thread::sleep(Duration::from_millis(2));
        Ok(())
    };

    scheduler
        .process_session(&CancelToken::new(), &session, &processor)
        .unwrap();
    let peak = session.progress().peak_in_flight();
    assert!(peak >= 1 && peak <= 4, "peak in flight was {}", peak);
}

#[test]
fn test_fraction_is_monotonic() {
    let host = Arc::new(LocalHost::with_parallelism(8));
    let scheduler = scheduler(&host, 4);
    let sink = Arc::new(RecordingSink::default());
    let items = docs(25);
    let session = Session::with_sink(ContentQueue::preloaded(items, 4), 25, Box::new(Arc::clone(&sink)));

    let processor = |doc: &Doc, _: &CancelToken| -> Result<(), ProcessError> {
        if doc.0 % 7 == 0 {
            return Err(ProcessError::failed("unlucky"));
        }
        Ok(())
    };

    scheduler
        .process_session(&CancelToken::new(), &session, &processor)
        .unwrap();

    let fractions = sink.fractions.lock();
    assert!(!fractions.is_empty());
    assert!(fractions.windows(2).all(|w| w[0] <= w[1]), "{:?}", fractions);
    assert_eq!(*fractions.last().unwrap(), 1.0);
}

#[test]
fn test_caller_cancellation_mid_run() {
    let host = Arc::new(LocalHost::with_parallelism(8));
    let scheduler = scheduler(&host, 2);
    let session = preloaded_session(docs(50));
    let cancel = CancelToken::new();

    let processor = |doc: &Doc, _: &CancelToken| -> Result<(), ProcessError> {
        if doc.0 == 3 {
            cancel.cancel();
        }
        Ok(())
    };

    let err = scheduler.process_session(&cancel, &session, &processor).unwrap_err();
    assert!(matches!(err, RunnerError::Cancelled(CancelReason::Caller)));
    assert!(session.progress().processed() < 50);
    assert_eq!(host.listener_count(), 0);
}

#[test]
fn test_session_disposal_mid_run() {
    let host = Arc::new(LocalHost::with_parallelism(8));
    let scheduler = scheduler(&host, 2);
    let session = preloaded_session(docs(50));
    let handle = session.handle();

    let processor = |doc: &Doc, _: &CancelToken| -> Result<(), ProcessError> {
        if doc.0 == 3 {
            handle.dispose();
        }
        Ok(())
    };

    let err = scheduler
        .process_session(&CancelToken::new(), &session, &processor)
        .unwrap_err();
    assert!(matches!(err, RunnerError::Cancelled(CancelReason::SessionDisposed)));
    assert!(err.is_cancelled());
}

#[test]
fn test_requeue_cap_flags_item() {
    let host = Arc::new(LocalHost::with_parallelism(8));
    let config = RunnerConfig::default()
        .with_thread_count(2)
        .with_max_requeues(Some(2))
        .with_retry_pause(Duration::ZERO);
    let scheduler = Scheduler::with_config(Arc::clone(&host) as Arc<dyn Host>, config);
    let session = preloaded_session(docs(6));

    let processor = |doc: &Doc, _: &CancelToken| -> Result<(), ProcessError> {
        if doc.0 == 2 {
            return Err(ProcessError::Cancelled);
        }
        Ok(())
    };

    let result = scheduler
        .process_session(&CancelToken::new(), &session, &processor)
        .unwrap();

    assert_eq!(result.processed, 5);
    assert_eq!(result.failed, 1);
    assert_eq!(result.requeued, 2);
    assert!(session.sticky_failures().contains(&2));
    assert_eq!(session.progress().fraction(), 1.0);
}

#[test]
fn test_runs_inline_under_exclusive_access() {
    let host = Arc::new(LocalHost::with_parallelism(8));
    let scheduler = scheduler(&host, 4);

    let _phase = host.begin_write();
    assert!(host.holds_exclusive_access());

    let processor = |_: &Doc, _: &CancelToken| -> Result<(), ProcessError> { Ok(()) };
    let result = scheduler.process(&CancelToken::new(), docs(5), &processor).unwrap();
    assert_eq!(result.processed, 5);
    assert_eq!(result.batches, 1);
}

#[test]
fn test_index_directory_tree() {
    let dir = tempdir().unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
    std::fs::write(dir.path().join("sub/b.txt"), "three\n").unwrap();
    std::fs::write(dir.path().join("sub/c.bin"), [0u8, 1, 2, 3]).unwrap();

    let paths: Vec<PathBuf> = walkdir::WalkDir::new(dir.path())
        .min_depth(1)
        .into_iter()
        .map(|e| e.unwrap().into_path())
        .collect();
    assert_eq!(paths.len(), 4);

    let total = paths.len();
    let queue = ContentQueue::new(paths, 2, |path: PathBuf| FileContent::load(path, 1024));
    let session = Session::new(queue, total);

    let host = Arc::new(LocalHost::with_parallelism(4));
    let extractor = ContentExtractor::new();
    let result = scheduler(&host, 2)
        .process_session(&CancelToken::new(), &session, &extractor)
        .unwrap();

    // The directory is retired without reaching the extractor
    assert_eq!(result.processed, 4);
    assert_eq!(extractor.stats().files.load(Ordering::Relaxed), 3);
    assert_eq!(extractor.stats().lines.load(Ordering::Relaxed), 3);
    assert_eq!(extractor.stats().bytes.load(Ordering::Relaxed), 18);
    assert_eq!(session.progress().fraction(), 1.0);
}

#[test]
fn test_three_in_flight_items_pushed_back_on_write_phase() {
    let host = Arc::new(LocalHost::with_parallelism(8));
    let scheduler = scheduler(&host, 3);
    let session = preloaded_session(docs(10));

    let dispatched = AtomicUsize::new(0);
    let held = Mutex::new(Vec::new());
    let done = Mutex::new(Vec::new());
    let writer: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);

    let processor = |doc: &Doc, cancel: &CancelToken| -> Result<(), ProcessError> {
        let n = dispatched.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= 3 {
            held.lock().push(doc.0);
            if n == 3 {
                let host = Arc::clone(&host);
                *writer.lock() = Some(thread::spawn(move || {
                    let _phase = host.begin_write();
                    thread::sleep(Duration::from_millis(30));
                }));
            }

            // All three workers sit on their item until the write phase begins
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
            return Err(ProcessError::Cancelled);
        }
        done.lock().push(doc.0);
        Ok(())
    };

    let result = scheduler
        .process_session(&CancelToken::new(), &session, &processor)
        .unwrap();

    if let Some(handle) = writer.lock().take() {
        handle.join().unwrap();
    }

    let held = held.into_inner();
    let done = done.into_inner();
    let unique: HashSet<u32> = done.iter().copied().collect();

    assert_eq!(held.len(), 3);
    assert!(held.iter().all(|id| unique.contains(id)), "held {:?} done {:?}", held, done);
    assert_eq!(done.len(), 10, "an item was processed twice: {:?}", done);
    assert_eq!(unique.len(), 10);
    assert!(result.batches > 1);
    assert!(result.requeued >= 3);
    assert!(session.queue().stats().pushed_back.load(Ordering::SeqCst) >= 3);
    assert_eq!(result.processed, 10);
    assert_eq!(session.progress().in_flight_len(), 0);
    assert_eq!(session.queue().stats().unreleased(), 0);
}

/// Sink whose status update panics once, on the given call
struct FlakySink {
    calls: AtomicUsize,
    panic_on: usize,
}

impl ProgressSink for FlakySink {
    fn set_fraction(&self, _fraction: f64) {}

    fn set_status(&self, _status: &str) {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.panic_on {
            panic!("status line unavailable");
        }
    }
}

#[test]
fn test_panicking_sink_loses_no_items() {
    let host = Arc::new(LocalHost::with_parallelism(8));
    let scheduler = scheduler(&host, 2);
    let sink = FlakySink {
        calls: AtomicUsize::new(0),
        panic_on: 5,
    };
    let session = Session::with_sink(ContentQueue::preloaded(docs(10), 4), 10, Box::new(sink));
    let calls = AtomicUsize::new(0);

    let processor = |_: &Doc, _: &CancelToken| -> Result<(), ProcessError> {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    };

    let result = scheduler
        .process_session(&CancelToken::new(), &session, &processor)
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 10);
    assert_eq!(result.processed, 10);
    assert_eq!(result.failed, 0);
    assert_eq!(session.progress().in_flight_len(), 0);
    assert_eq!(session.progress().fraction(), 1.0);
    assert_eq!(session.queue().stats().unreleased(), 0);
}
