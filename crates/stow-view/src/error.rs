/// Errors from storage view operations.
#[derive(Debug, thiserror::Error)]
pub enum ViewError {
    /// I/O error from the underlying storage backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The key is malformed for this backend (empty segment, `..`, etc.).
    #[error("invalid key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// The value exceeds the backend's per-entry ceiling.
    #[error("value for {key} is {size} bytes, backend limit is {max}")]
    ValueTooLarge { key: String, size: usize, max: usize },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline passed before the operation ran.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Backend-specific transient failure.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Result alias for view operations.
pub type ViewResult<T> = Result<T, ViewError>;
