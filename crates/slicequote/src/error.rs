//! Error types for slicing jobs.

use std::fmt::Display;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Fatal errors that end a job with a failure status.
#[derive(Error, Debug)]
pub enum SliceQuoteError {
    /// Input file does not exist or is not a regular file.
    #[error("input file not found: {0}")]
    InputNotFound(PathBuf),

    /// Request identifier is not a safe directory name.
    #[error("invalid request id: {0:?}")]
    InvalidRequestId(String),

    /// Expected archive was never produced.
    #[error("archive missing: {0}")]
    ArchiveMissing(PathBuf),

    /// Archive exists but is not a readable zip container.
    #[error("invalid archive {path}: {reason}")]
    InvalidArchive {
        /// Archive path.
        path: PathBuf,
        /// Underlying zip error.
        reason: String,
    },

    /// Slicer process could not be started.
    #[error("failed to launch slicer: {0}")]
    Launch(#[source] std::io::Error),

    /// Slicer exited with a non-zero status.
    #[error("slicer failed with exit code {0:?}")]
    SlicerFailed(Option<i32>),

    /// Slicer did not finish within the configured timeout.
    #[error("slicer timed out after {}s", .0.as_secs())]
    SlicerTimedOut(Duration),

    /// Work directory could not be created.
    #[error("workspace error at {path}: {source}")]
    Workspace {
        /// Directory being prepared.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for job operations.
pub type Result<T> = std::result::Result<T, SliceQuoteError>;

/// Non-fatal failure of a best-effort helper.
///
/// Call sites log these and carry on; they never abort a job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{context}: {detail}")]
pub struct Diagnostic {
    /// What was being attempted.
    pub context: String,
    /// Why it failed.
    pub detail: String,
}

impl Diagnostic {
    /// Create a diagnostic from any displayable error.
    pub fn new(context: impl Into<String>, detail: impl Display) -> Self {
        Self {
            context: context.into(),
            detail: detail.to_string(),
        }
    }
}
