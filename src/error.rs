use thiserror::Error;

use crate::scheduler::bucket::{JobId, WorkerId};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job has been deleted: {0}")]
    JobDeleted(JobId),

    #[error("Bucket must contain at least one test entry")]
    EmptyBucket,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Worker is blocked: {0}")]
    WorkerBlocked(WorkerId),

    #[error("Coordination service error: {0}")]
    Coordination(String),

    #[error("Deployment error: {0}")]
    Deployment(String),

    #[error("Test execution error: {0}")]
    Execution(String),

    #[error("Queue server responded with {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Gave up after {attempts} attempts, last error: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Transport(_) | QueueError::Coordination(_) => true,
            QueueError::Remote { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The request was refused outright; sending it again gets the same answer.
    pub fn is_rejection(&self) -> bool {
        match self {
            QueueError::JobNotFound(_)
            | QueueError::JobDeleted(_)
            | QueueError::EmptyBucket
            | QueueError::InvalidRequest(_)
            | QueueError::WorkerBlocked(_) => true,
            QueueError::Remote { status, .. } => (400..500).contains(status),
            _ => false,
        }
    }

    /// The queue refuses to work with this worker, locally or over HTTP.
    pub fn is_worker_blocked(&self) -> bool {
        matches!(
            self,
            QueueError::WorkerBlocked(_) | QueueError::Remote { status: 403, .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
