//! Configuration types for indexing-runner
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - Runtime configuration with validation
//! - The thread budget policy used to size each batch

use crate::error::ConfigError;
use crate::host::Host;
use clap::Parser;
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on the automatic thread count
pub const MAX_DEFAULT_THREADS: usize = 4;

/// Maximum explicit thread count override
const MAX_THREADS: usize = 256;

/// Queue size limits
const MIN_QUEUE_SIZE: usize = 1;
const MAX_QUEUE_SIZE: usize = 100_000;

/// Default number of loaded-but-unreleased items
const DEFAULT_QUEUE_SIZE: usize = 64;

/// Default pause between interrupted batches
const DEFAULT_RETRY_PAUSE_MS: u64 = 10;

/// Index file contents in parallel, yielding to exclusive write phases
#[derive(Parser, Debug, Clone)]
#[command(
    name = "indexing-runner",
    version,
    about = "Index file contents in parallel, yielding to exclusive write phases",
    after_help = "EXAMPLES:\n    \
        indexing-runner ./src\n    \
        indexing-runner /data -t 8 --headless\n    \
        indexing-runner . --exclude '/target/' --exclude '\\.git/'\n    \
        indexing-runner . --write-pulse-ms 50 -v  # simulate write contention"
)]
pub struct CliArgs {
    /// Directory tree to index
    #[arg(value_name = "ROOT")]
    pub root: PathBuf,

    /// Indexing thread count (0 or negative = automatic)
    #[arg(short = 't', long, default_value_t = 0, allow_negative_numbers = true, value_name = "NUM")]
    pub threads: i64,

    /// Maximum loaded-but-unreleased items
    #[arg(long, default_value_t = DEFAULT_QUEUE_SIZE, value_name = "NUM")]
    pub queue_size: usize,

    /// Turn an item into a permanent failure after this many requeues
    #[arg(long, value_name = "NUM")]
    pub max_requeues: Option<u32>,

    /// Pause between interrupted batches in milliseconds
    #[arg(long, default_value_t = DEFAULT_RETRY_PAUSE_MS, value_name = "MS")]
    pub retry_pause_ms: u64,

    /// Headless mode: do not reserve a core for interactive work
    #[arg(long)]
    pub headless: bool,

    /// Simulate an exclusive write phase every N milliseconds
    #[arg(long, value_name = "MS")]
    pub write_pulse_ms: Option<u64>,

    /// Maximum bytes read per file
    #[arg(long, default_value_t = 4 * 1024 * 1024, value_name = "BYTES")]
    pub max_file_bytes: usize,

    /// Exclude paths matching pattern (can be repeated)
    #[arg(long = "exclude", value_name = "PATTERN", action = clap::ArgAction::Append)]
    pub exclude_patterns: Vec<String>,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Scheduling configuration shared by the library and the CLI
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Explicit thread count; `<= 0` selects the automatic policy
    pub thread_count: i64,

    /// Maximum loaded-but-unreleased items in a content queue
    pub queue_size: usize,

    /// Optional cap on how often a single item may be requeued
    pub max_requeues: Option<u32>,

    /// Pause between interrupted batches
    pub retry_pause: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            thread_count: 0,
            queue_size: DEFAULT_QUEUE_SIZE,
            max_requeues: None,
            retry_pause: Duration::from_millis(DEFAULT_RETRY_PAUSE_MS),
        }
    }
}

impl RunnerConfig {
    /// Set the thread count override
    pub fn with_thread_count(mut self, count: i64) -> Self {
        self.thread_count = count;
        self
    }

    /// Set the queue size
    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    /// Set the requeue cap
    pub fn with_max_requeues(mut self, max: Option<u32>) -> Self {
        self.max_requeues = max;
        self
    }

    /// Set the pause between interrupted batches
    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    /// Check limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.thread_count > MAX_THREADS as i64 {
            return Err(ConfigError::InvalidThreadCount {
                count: self.thread_count,
                max: MAX_THREADS,
            });
        }

        if self.queue_size < MIN_QUEUE_SIZE || self.queue_size > MAX_QUEUE_SIZE {
            return Err(ConfigError::InvalidQueueSize {
                size: self.queue_size,
                min: MIN_QUEUE_SIZE,
                max: MAX_QUEUE_SIZE,
            });
        }

        Ok(())
    }

    /// Number of workers for the next batch on this host
    pub fn thread_budget(&self, host: &dyn Host) -> usize {
        thread_budget(
            self.thread_count,
            host.available_parallelism(),
            host.is_headless(),
        )
    }
}

/// Compute the worker count for a batch
///
/// A positive override wins. Otherwise one core is left for interactive
/// work (none when headless) and the result is clamped to
/// `[1, MAX_DEFAULT_THREADS]`.
pub fn thread_budget(override_count: i64, available: usize, headless: bool) -> usize {
    if override_count > 0 {
        return override_count as usize;
    }

    let reserve = if headless { 0 } else { 1 };
    available
        .saturating_sub(reserve)
        .clamp(1, MAX_DEFAULT_THREADS)
}

/// Validated configuration for the CLI binary
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory tree to index
    pub root: PathBuf,

    /// Scheduling configuration
    pub runner: RunnerConfig,

    /// Headless mode
    pub headless: bool,

    /// Interval between simulated write phases
    pub write_pulse: Option<Duration>,

    /// Maximum bytes read per file
    pub max_file_bytes: usize,

    /// Compiled exclude patterns
    pub exclude_patterns: Vec<Regex>,

    /// Show progress indicator
    pub show_progress: bool,

    /// Verbose logging
    pub verbose: bool,
}

impl AppConfig {
    /// Create and validate configuration from CLI arguments
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        if !args.root.is_dir() {
            return Err(ConfigError::InvalidRoot {
                path: args.root.display().to_string(),
                reason: "not a directory".into(),
            });
        }

        let runner = RunnerConfig {
            thread_count: args.threads,
            queue_size: args.queue_size,
            max_requeues: args.max_requeues,
            retry_pause: Duration::from_millis(args.retry_pause_ms),
        };
        runner.validate()?;

        // Compile exclude patterns
        let exclude_patterns = args
            .exclude_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| ConfigError::InvalidExcludePattern {
                    pattern: p.clone(),
                    reason: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            root: args.root,
            runner,
            headless: args.headless,
            write_pulse: args
                .write_pulse_ms
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            max_file_bytes: args.max_file_bytes,
            exclude_patterns,
            show_progress: !args.quiet,
            verbose: args.verbose,
        })
    }

    /// Check if a path should be excluded
    pub fn is_excluded(&self, path: &str) -> bool {
        self.exclude_patterns.iter().any(|re| re.is_match(path))
    }
}
