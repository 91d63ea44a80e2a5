//! Error types for the VNF lifecycle engine
//!
//! Every error carries a structured [`ErrorKind`] assigned where it
//! originates, so retry decisions never depend on the message text.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type alias using [`LifecycleError`].
pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Errors raised by phase handlers and their collaborators.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LifecycleError {
    /// The intent itself is invalid; only a spec change fixes it.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Artifact generation or artifact validation failed.
    #[error("package generation failed: {0}")]
    Packaging(String),

    /// A site could not satisfy the requested envelope.
    #[error("insufficient capacity on site {site}: {detail}")]
    InsufficientCapacity {
        /// Site that rejected the reservation.
        site: String,
        /// Which dimension was exhausted.
        detail: String,
    },

    /// A remote call exceeded its deadline.
    #[error("remote call timed out: {0}")]
    Timeout(String),

    /// The remote side could not be reached or answered with a transient failure.
    #[error("remote service unavailable: {0}")]
    Unavailable(String),

    /// The remote side refused the request.
    #[error("remote rejected request (HTTP {status}): {message}")]
    Rejected {
        /// HTTP status returned by the remote side.
        status: u16,
        /// Message extracted from the response body.
        message: String,
    },

    /// The remote deployment reported a failed state.
    #[error("remote deployment failed: {0}")]
    RemoteFailed(String),

    /// The addressed object does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The object already exists on the remote side.
    #[error("{resource} already exists")]
    AlreadyExists {
        /// Description of the conflicting object.
        resource: String,
        /// Identifier of the existing object, when the remote side returned one.
        existing_id: Option<String>,
    },

    /// The caller cancelled the pass.
    #[error("operation cancelled")]
    Cancelled,

    /// Object store failure.
    #[error("object store error: {0}")]
    Store(String),

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl LifecycleError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a packaging error.
    #[must_use]
    pub fn packaging(msg: impl Into<String>) -> Self {
        Self::Packaging(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a store error.
    #[must_use]
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Taxonomy bucket of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Packaging(_) => ErrorKind::Validation,
            Self::InsufficientCapacity { .. } => ErrorKind::Allocation,
            Self::Timeout(_) | Self::Unavailable(_) => ErrorKind::TransientRemote,
            Self::Rejected { .. }
            | Self::RemoteFailed(_)
            | Self::NotFound(_)
            | Self::AlreadyExists { .. } => ErrorKind::PermanentRemote,
            Self::Cancelled | Self::Store(_) | Self::Serialisation(_) | Self::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Stable machine-readable code, used by failure pattern matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Packaging(_) => "packaging",
            Self::InsufficientCapacity { .. } => "insufficient_capacity",
            Self::Timeout(_) => "timeout",
            Self::Unavailable(_) => "unavailable",
            Self::Rejected { .. } => "rejected",
            Self::RemoteFailed(_) => "remote_failed",
            Self::NotFound(_) => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::Cancelled => "cancelled",
            Self::Store(_) => "store",
            Self::Serialisation(_) => "serialisation",
            Self::Internal(_) => "internal",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<serde_json::Error> for LifecycleError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialisation(e.to_string())
    }
}

/// Error taxonomy used for retry and remediation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad intent, never retried automatically
    Validation,
    /// Timeout, connection or temporary remote failure
    TransientRemote,
    /// Insufficient capacity
    Allocation,
    /// Remote side rejected the request or the deployment failed
    PermanentRemote,
    /// Bug or unexpected condition
    Internal,
}

impl ErrorKind {
    /// Whether an error of this kind is worth retrying without human action
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::TransientRemote | ErrorKind::Allocation)
    }

    pub fn severity(&self) -> Severity {
        match self {
            ErrorKind::TransientRemote => Severity::Warning,
            ErrorKind::Validation | ErrorKind::Allocation => Severity::Error,
            ErrorKind::PermanentRemote | ErrorKind::Internal => Severity::Critical,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::TransientRemote => write!(f, "transient_remote"),
            ErrorKind::Allocation => write!(f, "allocation"),
            ErrorKind::PermanentRemote => write!(f, "permanent_remote"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Severity recorded alongside each error
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}
