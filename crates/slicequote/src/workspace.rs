//! Per-request working directories.
//!
//! Every job gets `<base>/<request_id>/` with a nested `slice_output/`
//! directory. Directory names are the only isolation between concurrent
//! jobs, so request ids must be unique and safe as a single path component.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::error::{Diagnostic, Result, SliceQuoteError};

/// Name of the slice-data directory inside a work directory.
pub const SLICE_OUTPUT_DIR: &str = "slice_output";

const REQUEST_ID_MAX_LEN: usize = 64;
const GENERATED_ID_LEN: usize = 12;

/// Identifier of one request; also the name of its work directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    /// Validate a caller-supplied id.
    pub fn parse(raw: &str) -> Result<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= REQUEST_ID_MAX_LEN
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(SliceQuoteError::InvalidRequestId(raw.to_string()))
        }
    }

    /// Generate a fresh id with 48 random bits.
    pub fn generate() -> Self {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(GENERATED_ID_LEN);
        Self(id)
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A prepared work directory for one job.
#[derive(Debug, Clone)]
pub struct WorkDir {
    /// Owning request.
    pub request_id: RequestId,
    /// `<base>/<request_id>`.
    pub root: PathBuf,
    /// `<root>/slice_output`.
    pub output_dir: PathBuf,
}

impl WorkDir {
    /// Path of a file directly inside the work directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

/// Outcome of a stale-directory sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Directories removed.
    pub removed: Vec<PathBuf>,
    /// Entries that could not be inspected or removed.
    pub failures: Vec<Diagnostic>,
}

/// Allocates, sweeps and removes work directories under one base path.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    base: PathBuf,
}

impl WorkspaceManager {
    /// Create a manager rooted at `base` (usually `<config>/work`).
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Base directory.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directory a request would use, without creating it.
    pub fn locate(&self, request_id: &RequestId) -> WorkDir {
        let root = self.base.join(request_id.as_str());
        WorkDir {
            request_id: request_id.clone(),
            output_dir: root.join(SLICE_OUTPUT_DIR),
            root,
        }
    }

    /// Create the work directory and its slice-data subdirectory.
    pub fn prepare(&self, request_id: &RequestId) -> Result<WorkDir> {
        let dir = self.locate(request_id);
        fs::create_dir_all(&dir.output_dir).map_err(|source| SliceQuoteError::Workspace {
            path: dir.output_dir.clone(),
            source,
        })?;
        debug!(path = %dir.root.display(), "prepared work directory");
        Ok(dir)
    }

    /// Remove immediate child directories last modified more than `max_age` ago.
    ///
    /// Per-entry failures are collected in the report and never stop the sweep.
    /// Only a failure to list the base directory is returned as an error.
    pub fn sweep_stale(&self, max_age: Duration) -> std::result::Result<SweepReport, Diagnostic> {
        let mut report = SweepReport::default();
        if !self.base.exists() {
            return Ok(report);
        }

        let entries = fs::read_dir(&self.base)
            .map_err(|e| Diagnostic::new(format!("list {}", self.base.display()), e))?;
        let now = SystemTime::now();

        for entry in entries {
            match sweep_entry(entry, now, max_age) {
                Ok(Some(path)) => report.removed.push(path),
                Ok(None) => {}
                Err(diag) => {
                    warn!(%diag, "stale sweep skipped entry");
                    report.failures.push(diag);
                }
            }
        }

        if !report.removed.is_empty() {
            info!(
                removed = report.removed.len(),
                "Cleanup: removed old work directories"
            );
        }
        Ok(report)
    }

    /// Remove a job's work directory. A missing directory is not an error.
    pub fn teardown(&self, dir: &WorkDir) -> std::result::Result<(), Diagnostic> {
        if !dir.root.exists() {
            return Ok(());
        }
        fs::remove_dir_all(&dir.root)
            .map_err(|e| Diagnostic::new(format!("remove {}", dir.root.display()), e))?;
        info!(path = %dir.root.display(), "Cleaned up work directory");
        Ok(())
    }

    /// Tie the directory's removal to the returned guard.
    pub fn guard(&self, dir: WorkDir) -> WorkDirGuard {
        WorkDirGuard {
            manager: self.clone(),
            dir,
            armed: true,
        }
    }
}

fn sweep_entry(
    entry: std::io::Result<fs::DirEntry>,
    now: SystemTime,
    max_age: Duration,
) -> std::result::Result<Option<PathBuf>, Diagnostic> {
    let entry = entry.map_err(|e| Diagnostic::new("read work entry", e))?;
    let path = entry.path();
    let context = || format!("sweep {}", path.display());

    let metadata = entry.metadata().map_err(|e| Diagnostic::new(context(), e))?;
    if !metadata.is_dir() {
        return Ok(None);
    }
    let modified = metadata.modified().map_err(|e| Diagnostic::new(context(), e))?;
    // Clock skew into the future counts as brand new.
    let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
    if age <= max_age {
        return Ok(None);
    }

    fs::remove_dir_all(&path).map_err(|e| Diagnostic::new(context(), e))?;
    debug!(path = %path.display(), age_secs = age.as_secs(), "removed stale work directory");
    Ok(Some(path))
}

/// Removes a work directory when dropped, including during unwinding.
#[derive(Debug)]
pub struct WorkDirGuard {
    manager: WorkspaceManager,
    dir: WorkDir,
    armed: bool,
}

impl WorkDirGuard {
    /// The guarded directory.
    pub fn dir(&self) -> &WorkDir {
        &self.dir
    }

    /// Remove the directory now.
    pub fn teardown(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.armed) {
            if let Err(diag) = self.manager.teardown(&self.dir) {
                warn!(%diag, "Failed to cleanup work directory");
            }
        }
    }
}

impl Drop for WorkDirGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Size probe result for operator logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileInfo {
    /// Path does not exist.
    Missing,
    /// Path exists with the given size in bytes.
    Exists {
        /// Size in bytes.
        size: u64,
    },
}

impl fmt::Display for FileInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileInfo::Missing => f.write_str("missing"),
            FileInfo::Exists { size } => write!(f, "exists,size={size}"),
        }
    }
}

/// Probe whether a path exists and how large it is.
pub fn file_info(path: &Path) -> std::result::Result<FileInfo, Diagnostic> {
    if !path.exists() {
        return Ok(FileInfo::Missing);
    }
    let metadata =
        fs::metadata(path).map_err(|e| Diagnostic::new(format!("stat {}", path.display()), e))?;
    Ok(FileInfo::Exists {
        size: metadata.len(),
    })
}

/// `file_info` rendered for a log line; unreadable sizes show as `?`.
pub fn describe(path: &Path) -> String {
    match file_info(path) {
        Ok(info) => info.to_string(),
        Err(_) => "exists,size=?".to_string(),
    }
}
