use stow_view::ViewError;
use thiserror::Error;

/// Errors from packer operations.
#[derive(Debug, Error)]
pub enum PackerError {
    /// The storage view failed. The packer never retries internally.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] ViewError),

    /// A persisted bucket or config entry could not be decoded.
    #[error("corrupt entry {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A single item too large to fit in any bucket.
    #[error("item {id} encodes to {size} bytes, bucket limit is {max}")]
    Oversize { id: String, size: usize, max: usize },

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification of a [`PackerError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    StorageUnavailable,
    Corrupt,
    InvalidArgument,
    Oversize,
    Internal,
}

impl PackerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PackerError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            PackerError::Corrupt { .. } => ErrorKind::Corrupt,
            PackerError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            PackerError::Oversize { .. } => ErrorKind::Oversize,
            PackerError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns `true` if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PackerError::StorageUnavailable(
                ViewError::Io(_) | ViewError::Unavailable(_) | ViewError::DeadlineExceeded
            )
        )
    }

    pub(crate) fn corrupt(key: impl Into<String>, reason: impl ToString) -> Self {
        PackerError::Corrupt {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result alias for packer operations.
pub type PackerResult<T> = Result<T, PackerError>;
