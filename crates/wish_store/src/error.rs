//! Wish store error types.

use thiserror::Error;

/// Errors that can occur during wish store operations.
#[derive(Debug, Error)]
pub enum WishStoreError {
    /// The remote store could not be reached.
    #[error("Remote store unreachable: {0}")]
    Unreachable(String),

    /// The remote store answered but refused the request.
    #[error("Remote store rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The remote store answered with something we cannot use.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Realtime channel error.
    #[error("Realtime error: {0}")]
    Realtime(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local storage I/O error.
    #[error("Storage error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage key that cannot be mapped to a storage slot.
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl WishStoreError {
    /// Creates a rejected error.
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Returns true when the failure means the store is out of reach, as
    /// opposed to a store that answered and refused.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Unreachable(_) => true,
            Self::Rejected { status, .. } => matches!(status, 502..=504),
            _ => false,
        }
    }
}

/// Result type for wish store operations.
pub type WishStoreResult<T> = Result<T, WishStoreError>;
