use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

use crate::batch::BatchId;
use crate::job::{JobId, JobState};

/// Classification every failure is reduced to before it reaches a Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Timeouts, remote rate limiting, temporary unavailability. Retried with backoff.
    Transient,
    /// Removed items, missing formats, invalid trim ranges, unsupported codecs.
    Permanent,
    /// User initiated. Not an error from the user's point of view.
    Cancelled,
    /// Disk full, permission denied.
    ResourceExhaustion,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        self == ErrorKind::Transient
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ResourceExhaustion => "resource exhaustion",
        };
        f.write_str(label)
    }
}

/// Error as stored on a Job and shown to the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled by user")
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

/// Failures reported by the extraction backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("item not found: {0}")]
    NotFound(String),

    #[error("rate limited by remote host: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("network operation timed out after {0}s")]
    Timeout(u64),

    #[error("unsupported source: {0}")]
    Unsupported(String),

    #[error("requested format is not available: {0}")]
    FormatUnavailable(String),

    #[error("external tool is missing: {0}")]
    ToolMissing(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::RateLimited(_) | BackendError::Network(_) | BackendError::Timeout(_) => {
                ErrorKind::Transient
            }
            BackendError::NotFound(_)
            | BackendError::Unsupported(_)
            | BackendError::FormatUnavailable(_)
            | BackendError::ToolMissing(_) => ErrorKind::Permanent,
            BackendError::Io(e) => classify_io(e),
        }
    }

    pub fn to_job_error(&self) -> JobError {
        JobError::new(self.kind(), self.to_string())
    }
}

/// Failures reported by the media transcoder.
#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("transcoder rejected the input file: {0}")]
    InvalidInput(String),

    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("transcoder is missing: {0}")]
    ToolMissing(String),

    #[error("transcoding failed: {0}")]
    Failed(String),

    #[error("transcoding cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl TranscodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TranscodeError::Io(e) => classify_io(e),
            TranscodeError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Permanent,
        }
    }

    /// Input the transcoder could not parse. The raw download is suspect.
    pub fn is_corrupted_input(&self) -> bool {
        matches!(self, TranscodeError::InvalidInput(_))
    }

    pub fn to_job_error(&self) -> JobError {
        JobError::new(self.kind(), self.to_string())
    }
}

/// Errors returned by the engine API itself.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("job or batch {0} is unknown or already finished")]
    NotFoundOrTerminal(String),

    #[error("job {job} cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        job: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("invalid source descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("invalid trim range: start {start}s must be before end {end}s and within the item duration")]
    InvalidTrimRange { start: f64, end: f64 },

    #[error("engine is stopped")]
    EngineStopped,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn unknown_job(id: JobId) -> Self {
        EngineError::NotFoundOrTerminal(id.to_string())
    }

    pub fn unknown_batch(id: BatchId) -> Self {
        EngineError::NotFoundOrTerminal(id.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Disk full and permission problems are fatal to the Job but not a defect of the item.
pub fn classify_io(err: &io::Error) -> ErrorKind {
    // ENOSPC / EDQUOT on unix, ERROR_DISK_FULL / ERROR_HANDLE_DISK_FULL on windows
    const DISK_FULL_CODES: &[i32] = if cfg!(windows) { &[39, 112] } else { &[28, 122] };

    match err.kind() {
        io::ErrorKind::PermissionDenied => ErrorKind::ResourceExhaustion,
        io::ErrorKind::TimedOut => ErrorKind::Transient,
        _ => match err.raw_os_error() {
            Some(code) if DISK_FULL_CODES.contains(&code) => ErrorKind::ResourceExhaustion,
            // subprocesses only report disk exhaustion as text
            None if err.to_string().to_lowercase().contains("no space left") => {
                ErrorKind::ResourceExhaustion
            }
            _ => ErrorKind::Permanent,
        },
    }
}

/// Message for the shell when the filesystem refuses a write.
pub fn io_job_error(context: &str, err: &io::Error) -> JobError {
    let kind = classify_io(err);
    let message = match kind {
        ErrorKind::ResourceExhaustion => format!(
            "{context}: {err}. Free up disk space or choose an output directory you can write to"
        ),
        _ => format!("{context}: {err}"),
    };
    JobError::new(kind, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_map_to_taxonomy() {
        assert_eq!(BackendError::Timeout(30).kind(), ErrorKind::Transient);
        assert_eq!(BackendError::RateLimited("429".into()).kind(), ErrorKind::Transient);
        assert_eq!(BackendError::NotFound("gone".into()).kind(), ErrorKind::Permanent);
        assert_eq!(
            BackendError::FormatUnavailable("137".into()).kind(),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn permission_denied_is_resource_exhaustion() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(classify_io(&err), ErrorKind::ResourceExhaustion);
        let job_err = io_job_error("writing output", &err);
        assert!(job_err.message.contains("Free up disk space"));
    }

    #[test]
    fn disk_full_is_resource_exhaustion() {
        let code = if cfg!(windows) { 112 } else { 28 };
        let err = io::Error::from_raw_os_error(code);
        assert_eq!(classify_io(&err), ErrorKind::ResourceExhaustion);
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Permanent.is_retryable());
        assert!(!ErrorKind::ResourceExhaustion.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }
}
