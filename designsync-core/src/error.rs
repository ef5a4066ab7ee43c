//! Error types for the export pipeline.
//!
//! Remote and download failures are scoped to the unit, job or config that
//! raised them. Local state *reads* never produce errors (a missing or corrupt
//! state file means "no prior state"); local state *writes* produce
//! [`StateError`], which is fatal for the run.

use std::path::PathBuf;

use crate::queue::JobId;

/// Failures talking to the remote design API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    /// The remote answered with a non-success status.
    #[error("remote returned {status} for {url}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// The requested URL.
        url: String,
    },

    /// The request never produced a response.
    #[error("request to {url} failed: {reason}")]
    Transport {
        /// The requested URL.
        url: String,
        /// Description of the transport failure.
        reason: String,
    },

    /// The response body did not have the expected shape.
    #[error("could not decode {endpoint} response: {reason}")]
    Decode {
        /// Human readable endpoint description.
        endpoint: String,
        /// Description of the decode failure.
        reason: String,
    },
}

/// Failures persisting cache or checkpoint state.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("state I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not serialize state for {path}: {reason}")]
    Serialization { path: PathBuf, reason: String },
}

/// Failures of a single download job.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DownloadError {
    /// One of the job's files failed; the job fails as a whole.
    #[error("download job {job_id} failed on {file}: {source}")]
    FileFailed {
        job_id: JobId,
        file: String,
        source: RemoteError,
    },

    /// No job with this id is waiting to be collected.
    #[error("unknown download job {0}")]
    UnknownJob(JobId),

    /// The queue shut down before the job produced a result.
    #[error("download queue closed before job {0} completed")]
    QueueClosed(JobId),
}

/// A lookup found remote data, but not what was asked for.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("variable collection {name:?} not found in file {file_id} (available: {available:?})")]
    MissingCollection {
        file_id: String,
        name: String,
        available: Vec<String>,
    },
}

/// Failure of one config within a batch.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The config file itself could not be read or understood.
    #[error("invalid config {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// Writing the output for one unit failed.
    #[error("failed to emit unit {unit}: {reason}")]
    Emit { unit: String, reason: String },
}

/// Failures that end a whole batch run.
#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("failed to persist run state: {0}")]
    State(#[from] StateError),
}
