//! Queue-driven indexing engine
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────────────┐
//!                     │        Scheduler        │
//!                     │  - sizes the batch      │
//!                     │  - retries until done   │
//!                     └───────────┬─────────────┘
//!                                 │ CancellationScope (per batch)
//!       ┌─────────────────────────┼─────────────────────────┐
//!       │                         │                         │
//! ┌─────▼─────┐             ┌─────▼─────┐             ┌─────▼─────┐
//! │  Worker 0 │             │  Worker 1 │             │  Worker N │
//! │ take→run  │             │ take→run  │             │ take→run  │
//! └─────┬─────┘             └─────┬─────┘             └─────┬─────┘
//!       └─────────────────────────┼─────────────────────────┘
//!                                 ▼
//!                ┌──────────────────────────────────┐
//!                │ Session: WorkQueue, progress,    │
//!                │ sticky failures, totals          │
//!                └──────────────────────────────────┘
//! ```

pub mod queue;
pub mod scheduler;
pub mod session;
pub mod worker;

pub use queue::{ContentQueue, QueueStats, WorkItem, WorkQueue};
pub use scheduler::{IndexResult, Scheduler};
pub use session::{Session, SessionHandle, SessionId, StickyFailureMap};
pub use worker::{ContentProcessor, ItemOutcome, WorkerExit, WorkerStats};
