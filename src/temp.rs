//! Allocates uniquely-named run files under a configured temp directory and guarantees they are
//! removed even if the process is interrupted mid-run.
//!
//! Grounded on the host project's disk buffer layer, which names its data files
//! `buffer-data-{id}.dat` under a configured `data_dir`; here every name additionally carries the
//! owning process id so two engines sharing a directory (tests running in parallel, say) never
//! collide.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tempfile::{NamedTempFile, TempPath};

use crate::run::RunError;

/// Hands out uniquely-named temp files within one directory for the lifetime of an engine.
///
/// Each handed-out path is backed by a [`tempfile::NamedTempFile`]; dropping the returned
/// [`SpillFile`] unlinks the file, so a run that's superseded by a later merge (or a crash
/// partway through ingestion) never leaves stray files behind.
pub struct TempManager {
    directory: PathBuf,
    prefix: String,
    counter: AtomicU64,
}

impl TempManager {
    pub fn new(directory: PathBuf) -> Self {
        let prefix = format!("flowbin-{}", std::process::id());
        Self {
            directory,
            prefix,
            counter: AtomicU64::new(0),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Reserves the next run file's path. The file exists (empty) the moment this returns, and
    /// is removed on drop unless [`SpillFile::keep`] is used to persist it.
    pub fn next_run_path(&self) -> Result<SpillFile, RunError> {
        let ordinal = self.counter.fetch_add(1, Ordering::Relaxed);
        let named = NamedTempFile::with_prefix_in(format!("{}-{:08}-", self.prefix, ordinal), &self.directory)?;
        Ok(SpillFile {
            path: named.into_temp_path(),
        })
    }
}

/// A reserved, uniquely-named path for one run file, removed automatically on drop.
pub struct SpillFile {
    path: TempPath,
}

impl SpillFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Leaks the backing temp file so it survives past this `SpillFile`'s drop. Not currently
    /// used by either engine (every run is either consumed by the final merge or superseded by
    /// one), kept for callers that want to inspect a run file after a failed merge.
    #[allow(dead_code)]
    pub fn keep(self) -> Result<PathBuf, RunError> {
        self.path.keep().map_err(|e| RunError::Io { source: e.error })
    }
}
