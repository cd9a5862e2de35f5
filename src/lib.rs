//! indexing-runner - Bounded-Parallelism Content Indexer
//!
//! Processes a fixed collection of work items with a small pool of worker
//! threads, cooperating with a host that periodically needs exclusive
//! write access to shared state. Workers only read while no write is
//! pending; when a write phase starts, the current batch is interrupted,
//! unfinished items are pushed back, and the scheduler retries until the
//! queue is fully drained.
//!
//! # Features
//!
//! - **Bounded Parallelism**: Worker count follows a thread budget derived
//!   from the host's cores, reserving one for interactive hosts.
//!
//! - **Two-Tier Cancellation**: Write phases interrupt a batch without
//!   losing work; caller cancellation and session disposal abort the run.
//!
//! - **Sticky Failures**: Items that fail are flagged and skipped for the
//!   rest of the session instead of blocking progress.
//!
//! - **Monotonic Progress**: A shared aggregator tracks in-flight items and
//!   publishes a fraction that never goes backwards.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                           Host                                │
//! │       read/write lock, write-phase listeners, cores           │
//! └──────────────┬─────────────────────────────────┬──────────────┘
//!                │ write phase                     │ try_run_read
//!                ▼                                 ▼
//! ┌──────────────────────────┐       ┌───────────────────────────┐
//! │    CancellationScope     │──────▶│       Worker Threads      │
//! │  (one per batch attempt) │cancel │  take → process → release │
//! └──────────────────────────┘       └─────────────┬─────────────┘
//!                                                  │
//!                                                  ▼
//!                                    ┌───────────────────────────┐
//!                                    │  Session (queue, sticky,  │
//!                                    │  progress, totals)        │
//!                                    └───────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```bash
//! # Index a tree with the default thread budget
//! indexing-runner ./src
//!
//! # Two workers, simulated write phase every 50ms
//! indexing-runner ./src -t 2 --write-pulse-ms 50
//! ```

pub mod cancel;
pub mod config;
pub mod content;
pub mod error;
pub mod host;
pub mod progress;
pub mod runner;

pub use cancel::{CancelToken, CancellationScope};
pub use config::{AppConfig, CliArgs, RunnerConfig};
pub use error::{CancelReason, ProcessError, Result, RunnerError};
pub use host::{Host, LocalHost};
pub use runner::{ContentProcessor, ContentQueue, IndexResult, Scheduler, Session, WorkItem, WorkQueue};
