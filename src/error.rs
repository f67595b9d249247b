use std::fmt;
use thiserror::Error;

/// Which half of the read-compute-write cycle a store failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Read,
    Write,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreOp::Read => write!(f, "read"),
            StoreOp::Write => write!(f, "write"),
        }
    }
}

/// Errors raised by a `StateStore` implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A persisted value could not be parsed back into an integer pair.
    #[error("corrupt state for key '{key}': {reason}")]
    StateCorrupt { key: String, reason: String },

    /// A record existed but lacked one of the two required fields.
    #[error("state for key '{key}' is missing field '{field}'")]
    KeyFieldMissing { key: String, field: &'static str },

    #[error("operation not supported by this store: {0}")]
    Unsupported(&'static str),
}

impl StoreError {
    pub fn corrupt(key: &str, reason: impl Into<String>) -> Self {
        StoreError::StateCorrupt {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors returned by the rate limiter.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("rate limit key cannot be empty")]
    EmptyKey,

    #[error("store read failed for key '{key}': {source}")]
    StoreReadFailed {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("store write failed for key '{key}': {source}")]
    StoreWriteFailed {
        key: String,
        #[source]
        source: StoreError,
    },

    /// Every compare-and-set attempt lost a race against another writer.
    #[error("gave up on key '{key}' after {attempts} conflicting writes")]
    ContentionExhausted { key: String, attempts: u32 },
}

impl Error {
    pub(crate) fn store(op: StoreOp, key: &str, source: StoreError) -> Self {
        let key = key.to_string();
        match op {
            StoreOp::Read => Error::StoreReadFailed { key, source },
            StoreOp::Write => Error::StoreWriteFailed { key, source },
        }
    }

    /// The store operation this error came from, if any.
    pub fn store_op(&self) -> Option<StoreOp> {
        match self {
            Error::StoreReadFailed { .. } => Some(StoreOp::Read),
            Error::StoreWriteFailed { .. } => Some(StoreOp::Write),
            _ => None,
        }
    }

    /// The underlying store error, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Error::StoreReadFailed { source, .. } | Error::StoreWriteFailed { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }

    /// True when the persisted bucket state could not be decoded.
    pub fn is_state_corrupt(&self) -> bool {
        matches!(
            self.store_error(),
            Some(StoreError::StateCorrupt { .. } | StoreError::KeyFieldMissing { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
