//! Crate-wide error taxonomy.
//!
//! Covers the error kinds a broker needs to distinguish:
//! transport failures talking to the queue backend, payload decode
//! failures, task-dispatch failures, best-effort bookkeeping failures
//! (hooks/webhooks), and poison-message detection. None of these
//! terminate the worker loop; see `worker.rs`.

use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Discriminant used for metrics labeling and for callers that only care
/// about the broad category of failure, not its message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Transport,
    Decode,
    Dispatch,
    Bookkeeping,
    Poison,
    Config,
    Generic,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorType::Transport => "transport",
            ErrorType::Decode => "decode",
            ErrorType::Dispatch => "dispatch",
            ErrorType::Bookkeeping => "bookkeeping",
            ErrorType::Poison => "poison",
            ErrorType::Config => "config",
            ErrorType::Generic => "generic",
        }
    }
}

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("queue transport error: {0}")]
    Queue(String),

    #[error("failed to decode task payload: {0}")]
    Decode(String),

    #[error("task dispatch failed: {0}")]
    Dispatch(String),

    #[error("bookkeeping step failed: {0}")]
    Bookkeeping(String),

    #[error("poison message dropped after {0} deliveries")]
    Poison(u64),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Generic(String),
}

impl Error {
    pub fn queue(msg: impl Into<String>) -> Self {
        Error::Queue(msg.into())
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }

    pub fn dispatch(msg: impl Into<String>) -> Self {
        Error::Dispatch(msg.into())
    }

    /// Broad category, used for metric labels and the transport/should-retry
    /// decision made at the queue call sites.
    pub fn typ(&self) -> ErrorType {
        match self {
            Error::Queue(_) => ErrorType::Transport,
            Error::Decode(_) => ErrorType::Decode,
            Error::Dispatch(_) => ErrorType::Dispatch,
            Error::Bookkeeping(_) => ErrorType::Bookkeeping,
            Error::Poison(_) => ErrorType::Poison,
            Error::Config(_) => ErrorType::Config,
            Error::Generic(_) => ErrorType::Generic,
        }
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::Queue(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Decode(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Bookkeeping(e.to_string())
    }
}
