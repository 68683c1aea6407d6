//! Stable, machine-readable error kinds returned to clients.

use serde::{Deserialize, Serialize};

/// Error taxonomy shared by every request/response operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No valid credential was presented on this connection.
    Unauthenticated,
    /// Authenticated, but not a member (or not the owner) of the board.
    Forbidden,
    /// The entity does not exist or is archived.
    NotFound,
    /// Target index outside `[0, count]`.
    InvalidPosition,
    /// Structurally invalid destination: cross-board move, stale source
    /// list, ordering that is not a permutation.
    InvalidTarget,
    /// Uniqueness violation, e.g. duplicate membership or assignment.
    Conflict,
    /// The board's serialization point could not be acquired in time.
    Busy,
    /// Malformed request or field value (empty title, oversized frame).
    InvalidInput,
    /// Unexpected server failure.
    Internal,
}

impl ErrorKind {
    /// Whether the same request may succeed if simply sent again.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Busy)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::InvalidPosition => "invalid_position",
            Self::InvalidTarget => "invalid_target",
            Self::Conflict => "conflict",
            Self::Busy => "busy",
            Self::InvalidInput => "invalid_input",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Error payload: a stable kind plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
