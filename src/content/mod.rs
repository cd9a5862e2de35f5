//! File content items and the demo extractor
//!
//! This module provides:
//! - [`FileContent`], a work item holding the bytes of one file
//! - [`ContentExtractor`], a processor tallying MIME types, bytes and lines
//! - Magic-byte file type detection

pub mod extract;
pub mod filetype;

pub use extract::{ContentExtractor, ExtractStats};
pub use filetype::{classify, detect_file_type};

use crate::runner::WorkItem;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// A file (or directory) loaded ahead of processing
#[derive(Debug)]
pub struct FileContent {
    /// Path of the entry
    pub path: PathBuf,

    /// Loaded bytes, or the error message if loading failed
    pub bytes: Result<Vec<u8>, String>,

    /// Directories are retired without processing
    pub is_dir: bool,
}

impl FileContent {
    /// Load up to `max_bytes` from `path`
    ///
    /// Never fails: read errors are kept in `bytes` so the processor can
    /// report them against the item.
    pub fn load(path: PathBuf, max_bytes: usize) -> Self {
        let is_dir = path.is_dir();
        let bytes = if is_dir {
            Ok(Vec::new())
        } else {
            read_prefix(&path, max_bytes).map_err(|e| e.to_string())
        };

        Self { path, bytes, is_dir }
    }

    /// Byte count of the loaded content
    pub fn len(&self) -> usize {
        self.bytes.as_ref().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_prefix(path: &Path, max_bytes: usize) -> std::io::Result<Vec<u8>> {
    let file = File::open(path)?;
    let mut buf = Vec::new();
    file.take(max_bytes as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

impl WorkItem for FileContent {
    type Key = PathBuf;

    fn key(&self) -> PathBuf {
        self.path.clone()
    }

    fn container_label(&self) -> Option<String> {
        self.path.parent().map(|p| p.display().to_string())
    }

    fn is_container(&self) -> bool {
        self.is_dir
    }
}
