use crate::{JobId, Role};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Cause classification recorded on every failed or cancelled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidJobSpec,
    NoWorkerForRole,
    Unreachable,
    Timeout,
    EmptyResponse,
    ProtocolError,
    /// The backend refused the request outright; retrying cannot help.
    Rejected,
    RetriesExhausted,
    Cancelled,
}

impl ErrorKind {
    /// Transient worker failures that the dispatcher retries locally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Unreachable
                | ErrorKind::Timeout
                | ErrorKind::EmptyResponse
                | ErrorKind::ProtocolError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidJobSpec => "invalid_job_spec",
            ErrorKind::NoWorkerForRole => "no_worker_for_role",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::EmptyResponse => "empty_response",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::Rejected => "rejected",
            ErrorKind::RetriesExhausted => "retries_exhausted",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure information carried by a `JobResult`.
///
/// `cause` is set when `kind` wraps another error, e.g. `RetriesExhausted`
/// wrapping the `Timeout` of the final attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    pub cause: Option<ErrorKind>,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        JobError {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Terminal wrapping of the last retryable error once attempts run out.
    pub fn exhausted(last: JobError, attempts: u32) -> Self {
        JobError {
            kind: ErrorKind::RetriesExhausted,
            message: format!("gave up after {} attempts: {}", attempts, last.message),
            cause: Some(last.kind),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cause {
            Some(cause) => write!(f, "{} ({}): {}", self.kind, cause, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Failure of a single `WorkerClient::invoke` call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    #[error("Attempt timed out")]
    Timeout,

    #[error("Backend returned an empty response")]
    EmptyResponse,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Unreachable(_) => ErrorKind::Unreachable,
            ClientError::Timeout => ErrorKind::Timeout,
            ClientError::EmptyResponse => ErrorKind::EmptyResponse,
            ClientError::Protocol(_) => ErrorKind::ProtocolError,
            ClientError::Rejected(_) => ErrorKind::Rejected,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl From<ClientError> for JobError {
    fn from(err: ClientError) -> Self {
        JobError::new(err.kind(), err.to_string())
    }
}

/// Errors surfaced synchronously to callers of the dispatcher.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid job spec: {0}")]
    InvalidJobSpec(String),

    #[error("No worker configured for role '{role}' (job {job_id} failed)")]
    NoWorkerForRole { job_id: JobId, role: Role },

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job already exists: {0}")]
    DuplicateJob(JobId),

    #[error("Queue is full ({max} pending jobs)")]
    QueueFull { max: usize },

    #[error("Timed out waiting for job {0}")]
    Timeout(JobId),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: &'static str,
        to: &'static str,
    },

    #[error("Job {0} is not in a terminal state")]
    NotTerminal(JobId),

    #[error("Payload size exceeds maximum allowed size of {max} bytes (got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Dispatcher is shutting down")]
    ShuttingDown,
}

impl DispatchError {
    /// Taxonomy kind for errors that map onto a job outcome.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            DispatchError::InvalidJobSpec(_)
            | DispatchError::DuplicateJob(_)
            | DispatchError::PayloadTooLarge { .. } => Some(ErrorKind::InvalidJobSpec),
            DispatchError::NoWorkerForRole { .. } => Some(ErrorKind::NoWorkerForRole),
            DispatchError::Timeout(_) => Some(ErrorKind::Timeout),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::Unreachable.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::EmptyResponse.is_retryable());
        assert!(ErrorKind::ProtocolError.is_retryable());

        assert!(!ErrorKind::Rejected.is_retryable());
        assert!(!ErrorKind::NoWorkerForRole.is_retryable());
        assert!(!ErrorKind::RetriesExhausted.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_exhausted_preserves_cause() {
        let last = JobError::from(ClientError::Timeout);
        let wrapped = JobError::exhausted(last, 2);

        assert_eq!(wrapped.kind, ErrorKind::RetriesExhausted);
        assert_eq!(wrapped.cause, Some(ErrorKind::Timeout));
        assert!(wrapped.message.contains("2 attempts"));
        assert_eq!(
            wrapped.to_string(),
            "retries_exhausted (timeout): gave up after 2 attempts: Attempt timed out"
        );
    }

    #[test]
    fn test_client_error_kinds() {
        assert_eq!(
            ClientError::Unreachable("refused".into()).kind(),
            ErrorKind::Unreachable
        );
        assert_eq!(ClientError::Protocol("bad json".into()).kind(), ErrorKind::ProtocolError);
        assert!(!ClientError::Rejected("model not found".into()).is_retryable());
    }
}
