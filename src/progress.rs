//! Progress tracking and reporting
//!
//! [`ProgressAggregator`] is shared by every worker of a session. It keeps
//! the set of in-flight items and a processed counter, and publishes a
//! completion fraction plus a best-effort status label to a
//! [`ProgressSink`]. [`ProgressReporter`] is the terminal sink used by the
//! binary, built on indicatif.

use console::style;
use humansize::{format_size, BINARY};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::warn;

/// Receiver of progress updates
pub trait ProgressSink: Send + Sync {
    /// Completion fraction in `[0, 1]`
    fn set_fraction(&self, fraction: f64);

    /// Short status text (location of the latest item)
    fn set_status(&self, status: &str);
}

/// Sink that discards every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn set_fraction(&self, _fraction: f64) {}

    fn set_status(&self, _status: &str) {}
}

/// Shared progress state for one session
pub struct ProgressAggregator<K> {
    /// Items currently being processed
    in_flight: Mutex<HashSet<K>>,

    /// Highest in-flight count observed
    peak_in_flight: AtomicUsize,

    /// Items retired (done, failed or skipped)
    processed: AtomicUsize,

    /// Items in the session
    total: usize,

    /// Last fraction handed to the sink
    published: Mutex<f64>,

    /// Display target
    sink: Box<dyn ProgressSink>,
}

impl<K> ProgressAggregator<K>
where
    K: Eq + Hash + Clone + Debug,
{
    /// Create an aggregator for `total` items
    pub fn new(total: usize, sink: Box<dyn ProgressSink>) -> Self {
        Self {
            in_flight: Mutex::new(HashSet::new()),
            peak_in_flight: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            total,
            published: Mutex::new(0.0),
            sink,
        }
    }

    /// Record that processing of `key` started
    ///
    /// Returns false if the item was already in flight. That is unexpected
    /// and logged, but leaves the set intact.
    pub fn mark_started(&self, key: &K, label: Option<&str>) -> bool {
        let (added, len) = {
            let mut in_flight = self.in_flight.lock();
            let added = in_flight.insert(key.clone());
            (added, in_flight.len())
        };

        if !added {
            warn!(item = ?key, "Item started twice without finishing");
            return false;
        }

        self.peak_in_flight.fetch_max(len, Ordering::Relaxed);
        if let Some(label) = label {
            self.notify(|sink| sink.set_status(label));
        }
        true
    }

    /// Record that processing of `key` ended, whatever the outcome
    ///
    /// Returns false (and logs) if the item was not in flight.
    pub fn mark_finished(&self, key: &K) -> bool {
        let removed = self.in_flight.lock().remove(key);
        if !removed {
            warn!(item = ?key, "Finished item was not in flight");
        }
        removed
    }

    /// Count one item as permanently dealt with and publish the new fraction
    pub fn mark_retired(&self) {
        let processed = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
        let fraction = self.fraction_for(processed);

        // Updates from concurrent workers may arrive out of order
        let mut published = self.published.lock();
        if fraction > *published {
            *published = fraction;
            self.notify(|sink| sink.set_fraction(fraction));
        }
    }

    /// Forward an update to the sink; a panicking sink only loses the update
    fn notify(&self, update: impl FnOnce(&dyn ProgressSink)) {
        let sink = &*self.sink;
        if panic::catch_unwind(AssertUnwindSafe(|| update(sink))).is_err() {
            warn!("Progress sink panicked; update dropped");
        }
    }

    /// Current completion fraction
    pub fn fraction(&self) -> f64 {
        self.fraction_for(self.processed.load(Ordering::SeqCst))
    }

    /// Number of retired items
    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    /// Number of items in the session
    pub fn total(&self) -> usize {
        self.total
    }

    /// Number of items in flight right now
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Highest number of items ever in flight at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Relaxed)
    }

    fn fraction_for(&self, processed: usize) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (processed as f64 / self.total as f64).clamp(0.0, 1.0)
    }
}

/// Number of steps on the progress bar
const BAR_SCALE: u64 = 10_000;

/// Terminal progress display
pub struct ProgressReporter {
    /// Progress bar
    bar: ProgressBar,
}

impl ProgressReporter {
    /// Create a new progress reporter
    pub fn new() -> Self {
        let bar = ProgressBar::new(BAR_SCALE);

        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {percent:>3}% {msg}")
                .expect("Invalid progress template")
                .progress_chars("=> "),
        );

        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Finish the progress display with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Finish and clear the progress display
    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ProgressReporter {
    fn set_fraction(&self, fraction: f64) {
        self.bar.set_position((fraction * BAR_SCALE as f64) as u64);
    }

    fn set_status(&self, status: &str) {
        self.bar.set_message(status.to_string());
    }
}

impl<S: ProgressSink + ?Sized> ProgressSink for std::sync::Arc<S> {
    fn set_fraction(&self, fraction: f64) {
        (**self).set_fraction(fraction);
    }

    fn set_status(&self, status: &str) {
        (**self).set_status(status);
    }
}

/// Format a number with thousands separators
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| chunk.iter().rev().map(|&b| b as char).collect::<String>())
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Totals printed at the end of a run
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub requeued: u64,
    pub batches: u64,
    pub bytes: u64,
    pub lines: u64,
    pub duration: Duration,
    /// (MIME type, file count), most common first
    pub kinds: Vec<(String, u64)>,
}

/// Print a summary of the indexing results
pub fn print_summary(summary: &Summary) {
    let duration_secs = summary.duration.as_secs_f64();
    let rate = if duration_secs > 0.0 {
        summary.processed as f64 / duration_secs
    } else {
        0.0
    };

    println!();
    println!("{}", style("Indexing Complete").green().bold());
    println!("{}", style("─".repeat(50)).dim());
    println!(
        "  {} {}",
        style("Files:").bold(),
        format_number(summary.processed)
    );
    println!(
        "  {} {}",
        style("Content:").bold(),
        format_size(summary.bytes, BINARY)
    );
    println!("  {} {}", style("Lines:").bold(), format_number(summary.lines));
    println!(
        "  {} {:.1}s ({:.0} files/sec)",
        style("Duration:").bold(),
        duration_secs,
        rate
    );
    println!(
        "  {} {} ({} requeued)",
        style("Batches:").bold(),
        summary.batches,
        format_number(summary.requeued)
    );
    if summary.skipped > 0 {
        println!(
            "  {} {}",
            style("Skipped:").bold(),
            format_number(summary.skipped)
        );
    }
    if summary.failed > 0 {
        println!(
            "  {} {} (restart to retry them)",
            style("Failed:").yellow().bold(),
            format_number(summary.failed)
        );
    }
    for (kind, count) in summary.kinds.iter().take(8) {
        println!("    {:<32} {}", kind, format_number(*count));
    }
    println!();
}

/// Print a header at the start of the run
pub fn print_header(root: &str, threads: usize, files: usize) {
    println!();
    println!(
        "{} {}",
        style("indexing-runner").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Root:").bold(), root);
    println!("  {} {}", style("Threads:").bold(), threads);
    println!("  {} {}", style("Files:").bold(), format_number(files as u64));
    println!();
}
