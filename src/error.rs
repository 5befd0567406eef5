//! Common error type and alias.
//!
//! Every failure the core can report maps onto one [`ErrorKind`], so callers
//! (the HTTP surface, the CLI, a chat adapter) can phrase each kind differently
//! while the core only supplies the kind and a diagnostic string.
use std::time::Duration;

use thiserror::Error;

use crate::comfyui::backend::BackendError;
use crate::job::client::JobError;
use crate::job::gate::GateError;
use crate::prompt::injector::InjectionError;
use crate::workflow::classify::UnsupportedWorkflowError;
use crate::workflow::graph::ParseError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("malformed workflow: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    UnsupportedWorkflow(#[from] UnsupportedWorkflowError),

    #[error(transparent)]
    Injection(#[from] InjectionError),

    #[error("workflow [{0}] does not exist")]
    WorkflowNotFound(usize),

    #[error("backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("generation failed: {0}")]
    JobFailed(String),

    #[error("no result within {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("too many requests waiting ({capacity} already queued)")]
    QueueFull { capacity: usize },

    #[error("waited {}s for a free slot", .0.as_secs())]
    QueueTimeout(Duration),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stable discriminant of [`AppError`], used for user-facing formatting and
/// HTTP status mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Parse,
    UnsupportedWorkflow,
    Injection,
    WorkflowNotFound,
    BackendUnreachable,
    JobFailed,
    TimedOut,
    Cancelled,
    QueueFull,
    QueueTimeout,
    InvalidRequest,
    Config,
    Io,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Parse => "PARSE_ERROR",
            ErrorKind::UnsupportedWorkflow => "UNSUPPORTED_WORKFLOW",
            ErrorKind::Injection => "UNSUPPORTED_MODE",
            ErrorKind::WorkflowNotFound => "WORKFLOW_NOT_FOUND",
            ErrorKind::BackendUnreachable => "BACKEND_UNREACHABLE",
            ErrorKind::JobFailed => "JOB_FAILED",
            ErrorKind::TimedOut => "TIMED_OUT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::QueueFull => "QUEUE_FULL",
            ErrorKind::QueueTimeout => "QUEUE_TIMEOUT",
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::Config => "CONFIG_ERROR",
            ErrorKind::Io => "IO_ERROR",
        }
    }

    /// Whether simply asking again later is a reasonable reaction.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::BackendUnreachable
                | ErrorKind::TimedOut
                | ErrorKind::QueueFull
                | ErrorKind::QueueTimeout
        )
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Parse(_) => ErrorKind::Parse,
            AppError::UnsupportedWorkflow(_) => ErrorKind::UnsupportedWorkflow,
            AppError::Injection(_) => ErrorKind::Injection,
            AppError::WorkflowNotFound(_) => ErrorKind::WorkflowNotFound,
            AppError::BackendUnreachable(_) => ErrorKind::BackendUnreachable,
            AppError::JobFailed(_) => ErrorKind::JobFailed,
            AppError::TimedOut(_) => ErrorKind::TimedOut,
            AppError::Cancelled => ErrorKind::Cancelled,
            AppError::QueueFull { .. } => ErrorKind::QueueFull,
            AppError::QueueTimeout(_) => ErrorKind::QueueTimeout,
            AppError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            AppError::Config(_) => ErrorKind::Config,
            AppError::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::BackendUnreachable(msg) => AppError::BackendUnreachable(msg),
            JobError::Failed(msg) => AppError::JobFailed(msg),
            JobError::TimedOut(after) => AppError::TimedOut(after),
            JobError::Cancelled => AppError::Cancelled,
        }
    }
}

impl From<GateError> for AppError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::QueueFull { capacity } => AppError::QueueFull { capacity },
            GateError::Timeout(after) => AppError::QueueTimeout(after),
            GateError::Cancelled | GateError::Closed => AppError::Cancelled,
        }
    }
}

impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        if err.is_transport() {
            AppError::BackendUnreachable(err.to_string())
        } else {
            AppError::JobFailed(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_errors_keep_their_kind() {
        let unreachable: AppError = JobError::BackendUnreachable("refused".into()).into();
        let failed: AppError = JobError::Failed("OOM".into()).into();
        assert_eq!(unreachable.kind(), ErrorKind::BackendUnreachable);
        assert_eq!(failed.kind(), ErrorKind::JobFailed);
        assert_ne!(unreachable.kind().code(), failed.kind().code());
    }

    #[test]
    fn timeouts_are_retryable_but_failures_are_not() {
        assert!(ErrorKind::TimedOut.is_retryable());
        assert!(ErrorKind::QueueFull.is_retryable());
        assert!(!ErrorKind::JobFailed.is_retryable());
        assert!(!ErrorKind::Injection.is_retryable());
    }

    #[test]
    fn gate_errors_map_to_queue_kinds() {
        let full: AppError = GateError::QueueFull { capacity: 4 }.into();
        let slow: AppError = GateError::Timeout(Duration::from_secs(3)).into();
        assert_eq!(full.kind(), ErrorKind::QueueFull);
        assert_eq!(slow.kind(), ErrorKind::QueueTimeout);
        assert_eq!(slow.to_string(), "waited 3s for a free slot");
    }
}
