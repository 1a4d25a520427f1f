//! File collection and run bookkeeping for indexing.
//!
//! This module provides functionality to:
//! - Collect Markdown files from a directory tree in a stable order
//! - Filter files by extension and exclude patterns
//! - Report per-file progress and failures of an indexing run

use crate::config::IndexerConfig;
use crate::patterns::{has_extension, should_exclude};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

/// Errors that can occur during file indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// An I/O error occurred while reading files or directories.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Directory does not exist: {0}")]
    NotFound(PathBuf),

    #[error("Path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("File is not valid UTF-8: {0}")]
    NotUtf8(PathBuf),
}

/// Result type for indexing operations.
pub type Result<T> = std::result::Result<T, IndexerError>;

/// Collects every indexable file under `root`, sorted by path.
///
/// Files are filtered based on:
/// - **Extensions**: compared case-insensitively against `config.extensions`.
/// - **Exclude patterns**: a file is skipped when any path component below
///   `root` equals a pattern (e.g., "node_modules", ".git").
/// - **Recursion**: with `config.recursive == false` only direct children count.
///
/// Pruned paths are logged at info level. Entries that cannot be read while
/// walking are logged and skipped.
pub fn collect_files(root: &Path, config: &IndexerConfig) -> Result<Vec<PathBuf>> {
    collect_files_except(root, config, &[])
}

/// Like [`collect_files`], but also prunes the directories in `skip_dirs`.
///
/// Used to keep the index's own working directory out of a notes tree that
/// contains it. Directories that do not exist are ignored.
pub fn collect_files_except(
    root: &Path,
    config: &IndexerConfig,
    skip_dirs: &[PathBuf],
) -> Result<Vec<PathBuf>> {
    if !root.exists() {
        return Err(IndexerError::NotFound(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(IndexerError::NotADirectory(root.to_path_buf()));
    }

    let skip_dirs: Vec<PathBuf> = skip_dirs
        .iter()
        .filter_map(|dir| dir.canonicalize().ok())
        .collect();

    let max_depth = if config.recursive { usize::MAX } else { 1 };
    let walker = WalkDir::new(root)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 {
                return true;
            }
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            if should_exclude(relative, &config.exclude_patterns) {
                info!(path = %entry.path().display(), "Skipping excluded path");
                return false;
            }
            if entry.file_type().is_dir() && is_skipped_dir(entry.path(), &skip_dirs) {
                info!(path = %entry.path().display(), "Skipping working directory");
                return false;
            }
            true
        });

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_file() && has_extension(entry.path(), &config.extensions) {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

fn is_skipped_dir(path: &Path, skip_dirs: &[PathBuf]) -> bool {
    if skip_dirs.is_empty() {
        return false;
    }
    path.canonicalize()
        .map(|path| skip_dirs.contains(&path))
        .unwrap_or(false)
}

/// Reads a file as UTF-8 text.
pub(crate) async fn read_text(path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path).await?;
    String::from_utf8(bytes).map_err(|_| IndexerError::NotUtf8(path.to_path_buf()))
}

/// A file that could not be indexed.
#[derive(Debug, Clone)]
pub struct FileFailure {
    pub path: PathBuf,
    /// Chunk being processed when the failure happened, if any.
    pub chunk: Option<usize>,
    pub error: String,
}

/// Outcome of one indexing run.
#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    pub files_found: usize,
    pub files_indexed: usize,
    pub chunks_indexed: usize,
    pub failures: Vec<FileFailure>,
    /// The run stopped early on request; files not started were skipped.
    pub cancelled: bool,
}

impl IndexReport {
    /// `true` when there was work to do and none of it succeeded.
    pub fn all_failed(&self) -> bool {
        self.files_found > 0 && self.files_indexed == 0 && !self.failures.is_empty()
    }
}

/// Progress notification for a single file.
#[derive(Debug, Clone, Copy)]
pub enum ProgressEvent<'a> {
    Started {
        index: usize,
        total: usize,
        path: &'a Path,
    },
    Finished {
        index: usize,
        total: usize,
        path: &'a Path,
        chunks: usize,
    },
    Failed {
        index: usize,
        total: usize,
        path: &'a Path,
        error: &'a str,
    },
}

/// Receives progress events; the caller decides how to present them.
pub type ProgressSink = Arc<dyn Fn(ProgressEvent<'_>) + Send + Sync>;

/// A sink that ignores every event.
pub fn silent_progress() -> ProgressSink {
    Arc::new(|_: ProgressEvent<'_>| {})
}
