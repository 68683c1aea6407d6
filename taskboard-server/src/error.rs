//! Service-level errors and their mapping onto wire error kinds.

use taskboard_proto::error::{ErrorBody, ErrorKind};
use taskboard_proto::ids::BoardId;

use crate::ordering::OrderingError;
use crate::store::StoreError;

/// Errors returned by [`crate::service::KanbanService`] operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// No credential on this connection.
    #[error("authentication required")]
    Unauthenticated,
    /// Not a member, or not the owner where ownership is required.
    #[error("{0}")]
    Forbidden(String),
    /// Entity missing or archived.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// Target index outside `[0, count]`.
    #[error("position {index} out of range (0..={count})")]
    InvalidPosition { index: i64, count: u32 },
    /// Destination structurally invalid.
    #[error("{0}")]
    InvalidTarget(String),
    /// Uniqueness violation.
    #[error("{0}")]
    Conflict(String),
    /// Board lock not acquired in time.
    #[error("board {0} is busy, retry")]
    Busy(BoardId),
    /// Malformed field value.
    #[error("{0}")]
    InvalidInput(String),
    /// Unexpected failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    /// Wire error kind for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthenticated => ErrorKind::Unauthenticated,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidPosition { .. } => ErrorKind::InvalidPosition,
            Self::InvalidTarget(_) => ErrorKind::InvalidTarget,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Busy(_) => ErrorKind::Busy,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub(crate) fn invalid_target(message: impl Into<String>) -> Self {
        Self::InvalidTarget(message.into())
    }

    pub(crate) fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub(crate) fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::BoardNotFound(_) => Self::NotFound("board"),
            StoreError::Busy(board_id) => Self::Busy(board_id),
        }
    }
}

impl From<OrderingError> for ServiceError {
    fn from(err: OrderingError) -> Self {
        match err {
            OrderingError::InvalidPosition { index, count } => {
                Self::InvalidPosition { index, count }
            }
            OrderingError::UnknownEntity | OrderingError::NotLive => Self::NotFound("task"),
            OrderingError::NotPermutation => Self::InvalidTarget(err.to_string()),
        }
    }
}

impl From<ServiceError> for ErrorBody {
    fn from(err: ServiceError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}
