#![forbid(unsafe_code)]

//! Error types shared across the library. Binaries wrap these in `anyhow`.

/// Failures reported by a [`crate::youtube::VideoSource`].
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("rate limited by video source: {0}")]
    RateLimited(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("video source returned HTTP {status}: {message}")]
    Api { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("could not decode response: {0}")]
    Decode(String),
}

impl SourceError {
    /// Only rate limiting is considered transient; everything else aborts the
    /// channel's fetch immediately.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, SourceError::RateLimited(_))
    }
}

/// Failures raised by the libsql-backed stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] libsql::Error),
    #[error("invalid timestamp {value:?} in column {column}")]
    InvalidTimestamp { column: &'static str, value: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;
pub type SourceResult<T> = Result<T, SourceError>;
