use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::stage::StagingError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid process configuration: {0}")]
    Validation(String),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error("unknown variable '{name}' in script of process '{process}'")]
    UnknownVariable { process: String, name: String },
    #[error(transparent)]
    Hash(#[from] rill_hash::HashError),
    #[error(transparent)]
    Cache(#[from] rill_cache::CacheError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("task '{task}' failed with exit status {exit_status}")]
    Execution { task: String, exit_status: i32 },
    #[error("task '{task}' exceeded its walltime limit of {limit:?}")]
    WalltimeExceeded { task: String, limit: Duration },
    #[error("no output matching '{pattern}' in {dir}")]
    MissingOutput { pattern: String, dir: Utf8PathBuf },
    #[error("failed to submit task '{task}': {message}")]
    SubmitFailed { task: String, message: String },
    #[error("backend command failed: {0}")]
    Backend(String),
    #[error("session terminated")]
    SessionTerminated,
    #[error("internal engine error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Staging(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// What to do when a firing fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorStrategy {
    /// Abort the session (default).
    #[default]
    Terminate,
    /// Log and keep going.
    Ignore,
    /// Resubmit with a fresh work directory, up to the attempt cap.
    Retry { max_retries: u32 },
}
