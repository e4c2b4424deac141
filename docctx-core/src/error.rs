//! Error surface of the document client.
//!
//! The dispatcher never wraps or rewrites these: whatever the client returns
//! reaches the caller unchanged. `ClientNotAttached` is the only variant the
//! dispatcher raises itself.

use thiserror::Error;

/// Errors returned by document operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Document does not exist
    #[error("Document not found: {path}")]
    NotFound { path: String },

    /// Document already exists (create on an existing path)
    #[error("Document already exists: {path}")]
    AlreadyExists { path: String },

    /// A write precondition did not hold
    #[error("Failed precondition: {reason}")]
    FailedPrecondition { reason: String },

    /// Malformed path, payload or call sequence
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// Transaction aborted due to contention
    #[error("Aborted: {reason}")]
    Aborted { reason: String },

    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("Service unavailable: {reason}")]
    Unavailable { reason: String },

    /// Context deadline passed before the call completed
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Context was cancelled before the call completed
    #[error("Cancelled")]
    Cancelled,

    /// No client bound anywhere in the context chain
    #[error("No document client attached to context")]
    ClientNotAttached,
}

/// Result type alias for docctx operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        Self::AlreadyExists { path: path.into() }
    }

    pub fn failed_precondition(reason: impl Into<String>) -> Self {
        Self::FailedPrecondition {
            reason: reason.into(),
        }
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Aborted errors are the ones a transaction runner may retry.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// True for cancellation and deadline expiry.
    pub fn is_context_error(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}
