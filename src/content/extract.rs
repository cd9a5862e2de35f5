//! Demo content processor
//!
//! Classifies each file by magic bytes and counts bytes and lines of text
//! content. Files that could not be read are reported as failures, which the
//! scheduler records as sticky for the rest of the session.

use crate::cancel::CancelToken;
use crate::content::filetype::{classify, is_text};
use crate::content::FileContent;
use crate::error::ProcessError;
use crate::runner::ContentProcessor;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Cancellation is re-checked after this many bytes of line counting
const CANCEL_CHECK_BYTES: usize = 64 * 1024;

/// Counters filled in by the extractor
#[derive(Debug, Default)]
pub struct ExtractStats {
    pub files: AtomicU64,
    pub bytes: AtomicU64,
    pub lines: AtomicU64,
}

/// Tallies MIME types, bytes and lines across all processed files
#[derive(Debug, Default)]
pub struct ContentExtractor {
    stats: ExtractStats,
    kinds: Mutex<HashMap<String, u64>>,
}

impl ContentExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &ExtractStats {
        &self.stats
    }

    /// (MIME type, file count), most common first
    pub fn kinds(&self) -> Vec<(String, u64)> {
        let mut kinds: Vec<_> = self
            .kinds
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        kinds.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        kinds
    }
}

impl ContentProcessor<FileContent> for ContentExtractor {
    fn process(&self, item: &FileContent, cancel: &CancelToken) -> Result<(), ProcessError> {
        let bytes = item
            .bytes
            .as_ref()
            .map_err(|e| ProcessError::failed(format!("{}: {}", item.path.display(), e)))?;

        let kind = classify(bytes);
        let lines = if is_text(bytes) { count_lines(bytes, cancel)? } else { 0 };

        trace!(path = %item.path.display(), kind = %kind, lines, "Extracted");

        // Only count once the whole file is done so an interrupted item
        // contributes nothing
        self.stats.files.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.stats.lines.fetch_add(lines, Ordering::Relaxed);
        *self.kinds.lock().entry(kind).or_insert(0) += 1;

        Ok(())
    }
}

fn count_lines(bytes: &[u8], cancel: &CancelToken) -> Result<u64, ProcessError> {
    let mut lines = 0u64;
    for chunk in bytes.chunks(CANCEL_CHECK_BYTES) {
        cancel.check()?;
        lines += chunk.iter().filter(|&&b| b == b'\n').count() as u64;
    }
    if bytes.last().is_some_and(|&b| b != b'\n') {
        lines += 1;
    }
    Ok(lines)
}
