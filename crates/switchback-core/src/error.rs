//! Error types for switchback.

use thiserror::Error;

use crate::{JobId, JobStatus};

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed job description or argument. Nothing was written.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The coordination store could not be reached or answered garbage.
    /// Admission and claim are safe to retry as a whole.
    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(String),

    /// Unknown identity, usually because its retention window elapsed.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// A job id was popped from a queue but its record no longer exists.
    /// The id has been consumed and must not be re-queued.
    #[error("claimed job {0} has no record")]
    ClaimedMissing(JobId),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
