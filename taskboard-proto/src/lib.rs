//! Shared protocol definitions for the Taskboard wire format.
//!
//! Entity model, per-board event catalogue, client/server messages and the
//! stable error taxonomy. Everything here is plain data: serde-serializable,
//! JSON on the wire, no I/O.

pub mod error;
pub mod event;
pub mod ids;
pub mod model;
pub mod wire;

pub use error::{ErrorBody, ErrorKind};
pub use ids::{ActivityId, BoardId, CommentId, ConnectionId, ListId, RequestId, TaskId, UserId};
