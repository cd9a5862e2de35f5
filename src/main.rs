//! indexing-runner - Bounded-Parallelism Content Indexer
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use indexing_runner::cancel::CancelToken;
use indexing_runner::config::{AppConfig, CliArgs};
use indexing_runner::content::{ContentExtractor, FileContent};
use indexing_runner::host::{Host, LocalHost};
use indexing_runner::progress::{print_header, print_summary, ProgressReporter, Summary};
use indexing_runner::runner::{ContentQueue, Scheduler, Session};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// How long each simulated write phase holds the host
const WRITE_PHASE_HOLD: Duration = Duration::from_millis(5);

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    // Validate and create config
    let config = AppConfig::from_args(args).context("Invalid configuration")?;

    let paths = collect_paths(&config);
    let host = Arc::new(LocalHost::new().headless(config.headless));
    let scheduler = Scheduler::with_config(
        Arc::clone(&host) as Arc<dyn Host>,
        config.runner.clone(),
    );

    // Print header
    if config.show_progress {
        print_header(
            &config.root.display().to_string(),
            scheduler.thread_budget(),
            paths.len(),
        );
    }

    // Setup signal handler for graceful shutdown
    let cancel = CancelToken::new();
    let interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        interrupt.cancel();
    })
    .context("Failed to set signal handler")?;

    // Create progress reporter
    let progress = config.show_progress.then(|| Arc::new(ProgressReporter::new()));

    let total = paths.len();
    let max_bytes = config.max_file_bytes;
    let queue = ContentQueue::new(paths, config.runner.queue_size, move |path: PathBuf| {
        FileContent::load(path, max_bytes)
    });
    let session = match &progress {
        Some(p) => Session::with_sink(queue, total, Box::new(Arc::clone(p))),
        None => Session::new(queue, total),
    };

    let pulse_stop = CancelToken::new();
    let pulse = config
        .write_pulse
        .map(|interval| spawn_write_pulse(Arc::clone(&host), interval, pulse_stop.clone()))
        .transpose()
        .context("Failed to start write pulse")?;

    // Run the indexing pass
    let extractor = ContentExtractor::new();
    let outcome = scheduler.process_session(&cancel, &session, &extractor);

    pulse_stop.cancel();
    if let Some(handle) = pulse {
        if handle.join().is_err() {
            warn!("Write pulse thread panicked");
        }
    }

    let result = match outcome {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => {
            if let Some(ref p) = progress {
                p.finish("Indexing interrupted");
            }
            info!(reason = %e, "Indexing was interrupted before completion");
            return Ok(());
        }
        Err(e) => return Err(e).context("Indexing failed"),
    };

    // Finish progress
    if let Some(ref p) = progress {
        p.finish("Indexing completed");
    }

    for (path, reason) in session.sticky_failures().entries() {
        debug!(path = %path.display(), reason = %reason, "Sticky failure");
    }

    // Print summary
    let stats = extractor.stats();
    print_summary(&Summary {
        processed: result.processed,
        failed: result.failed,
        skipped: result.skipped,
        requeued: result.requeued,
        batches: result.batches,
        bytes: stats.bytes.load(Ordering::Relaxed),
        lines: stats.lines.load(Ordering::Relaxed),
        duration: result.duration,
        kinds: extractor.kinds(),
    });

    if result.failed > 0 {
        info!(failed = result.failed, "Indexing completed with failures");
    }

    Ok(())
}

/// Walk the root, skipping excluded paths
fn collect_paths(config: &AppConfig) -> Vec<PathBuf> {
    WalkDir::new(&config.root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !config.is_excluded(&entry.path().to_string_lossy()))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.into_path()),
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry");
                None
            }
        })
        .collect()
}

/// Periodically take exclusive write access, interrupting running batches
fn spawn_write_pulse(host: Arc<LocalHost>, interval: Duration, stop: CancelToken) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("write-pulse".into())
        .spawn(move || {
            while !stop.is_cancelled() {
                thread::sleep(interval);
                if stop.is_cancelled() {
                    break;
                }
                let _phase = host.begin_write();
                thread::sleep(WRITE_PHASE_HOLD);
            }
        })
}

fn setup_logging(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("indexing_runner=debug,warn")
    } else {
        EnvFilter::new("indexing_runner=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
