//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A key holds a different kind of structure than the command expects.
    #[error("wrong kind of value at key {0}")]
    WrongType(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

impl From<StoreError> for switchback_core::Error {
    fn from(err: StoreError) -> Self {
        switchback_core::Error::StoreUnavailable(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
