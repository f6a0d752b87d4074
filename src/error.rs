//! Error taxonomy: transient fetch failures are retried, everything else is fatal.
use thiserror::Error;

use crate::dataset::Height;

/// Retry classification of a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Network, timeout, non-2xx, malformed or empty payload. Retried.
    Transient,
    /// Not worth retrying.
    Fatal,
}

/// Failure of one logical request against the RPC source.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Non-2xx response.
    #[error("http status {status}")]
    Http {
        /// Response status code.
        status: u16,
    },
    /// Connect, timeout or transport failure.
    #[error("network: {0}")]
    Network(String),
    /// Body or `result` did not decode.
    #[error("decode: {0}")]
    Decode(String),
    /// JSON-RPC `error` member.
    #[error("rpc error {code}: {message}")]
    Rpc {
        /// Node error code, e.g. `-8` for an out-of-range height.
        code: i64,
        /// Node error message.
        message: String,
    },
    /// Null or missing `result`.
    #[error("empty result for {0}")]
    EmptyResult(String),
    /// Bounded retry policy ran out.
    #[error("gave up after {attempts} attempts, last error: {last}")]
    RetriesExhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last: Box<FetchError>,
    },
    /// The source cannot serve this request shape.
    #[error("unsupported request: {0}")]
    Unsupported(String),
    /// Cancellation fired.
    #[error("cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether the failure should be retried.
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Http { .. }
            | FetchError::Network(_)
            | FetchError::Decode(_)
            | FetchError::Rpc { .. }
            | FetchError::EmptyResult(_) => FailureKind::Transient,
            FetchError::RetriesExhausted { .. }
            | FetchError::Unsupported(_)
            | FetchError::Cancelled => FailureKind::Fatal,
        }
    }

    /// Shorthand for `kind() == Transient`.
    pub fn is_transient(&self) -> bool {
        self.kind() == FailureKind::Transient
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FetchError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            FetchError::Http {
                status: status.as_u16(),
            }
        } else {
            FetchError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Decode(e.to_string())
    }
}

/// Record store failure. Always fatal to the caller.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Query or connection failure.
    #[cfg(feature = "store-sqlite")]
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The blocking task panicked or was cancelled.
    #[error("blocking task: {0}")]
    Join(#[from] tokio::task::JoinError),
    /// A previous holder of the connection panicked.
    #[error("connection lock poisoned")]
    Poisoned,
    /// A stored value could not be turned back into a record.
    #[error("invalid value in {table} at height {height}: {msg}")]
    InvalidValue {
        /// Table holding the row.
        table: &'static str,
        /// Row key.
        height: Height,
        /// What was wrong with it.
        msg: String,
    },
    /// Any other backend failure.
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    /// Store failures are never retried by the engine.
    pub fn kind(&self) -> FailureKind {
        FailureKind::Fatal
    }
}

/// Conditions that end a backfill run early.
#[derive(Error, Debug)]
pub enum BackfillError {
    /// The store failed; nothing past this point was written.
    #[error("store: {0}")]
    Store(#[from] StoreError),
    /// Invalid input or an unsupported request shape.
    #[error("contract violation: {0}")]
    Contract(String),
    /// `getblockcount` failed for good.
    #[error("chain tip unavailable: {0}")]
    Tip(FetchError),
    /// Cancelled while waiting for the chain tip.
    #[error("run cancelled")]
    Cancelled,
}
