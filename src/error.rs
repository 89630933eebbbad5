//! Typed errors for the harness and admission boundaries.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure of one external tool invocation.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {code}\nStderr: {stderr}")]
    NonZeroExit {
        program: String,
        code: String,
        stderr: String,
    },

    #[error("{program} reported errors (matched {marker:?}):\n{output}")]
    FailureMarker {
        program: String,
        marker: String,
        output: String,
    },

    #[error("expected output not created: {}\nOutput: {stdout}", path.display())]
    MissingOutput { path: PathBuf, stdout: String },

    #[error("expected output is empty: {}\nOutput: {stdout}", path.display())]
    EmptyOutput { path: PathBuf, stdout: String },

    #[error("{program} timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("{program} cancelled")]
    Cancelled { program: String },

    #[error("rate limiter wait cancelled")]
    RateLimitCancelled,

    #[error("i/o error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl HarnessError {
    /// True for the cancellation/shutdown family.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HarnessError::Cancelled { .. } | HarnessError::RateLimitCancelled)
    }
}

/// Errors surfaced synchronously to the caller of the admission and retry
/// interfaces. None of these ever create a job.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("path does not exist: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("no valid video file found in {}", .0.display())]
    NoValidVideo(PathBuf),

    #[error("file not found in failed folder: {0}")]
    NotInFailedFolder(String),

    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
