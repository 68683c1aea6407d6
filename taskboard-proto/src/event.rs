//! Per-board event stream.
//!
//! Every successful mutation produces one [`BoardEvent`], wrapped in an
//! [`EventEnvelope`] and delivered to every connection subscribed to the
//! board. Payloads carry canonical entity state so receivers can replace
//! their local copy without another request.

use serde::{Deserialize, Serialize};

use crate::ids::{BoardId, ConnectionId, ListId, RequestId, TaskId, UserId};
use crate::model::{Activity, Board, ListView, Member, TaskView};

/// Payload of a `task:move` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMove {
    /// The moved task, already carrying its new list and position.
    pub task: TaskView,
    pub source_list_id: ListId,
    pub target_list_id: ListId,
    pub position: u32,
}

/// Events emitted on a board's stream. The serde tag is the event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum BoardEvent {
    #[serde(rename = "board:update")]
    BoardUpdated(Board),
    #[serde(rename = "board:delete")]
    BoardDeleted { board_id: BoardId },
    #[serde(rename = "list:create")]
    ListCreated(ListView),
    #[serde(rename = "list:update")]
    ListUpdated(ListView),
    /// The list and all its tasks are gone; later lists shifted down by one.
    #[serde(rename = "list:delete")]
    ListDeleted { list_id: ListId },
    /// Every list of the board in its new order.
    #[serde(rename = "list:reorder")]
    ListsReordered { lists: Vec<ListView> },
    #[serde(rename = "task:create")]
    TaskCreated(TaskView),
    /// Field edits, assignment changes, archive and unarchive. An archived
    /// task leaves its list's ordering; an unarchived one is appended.
    #[serde(rename = "task:update")]
    TaskUpdated(TaskView),
    #[serde(rename = "task:delete")]
    TaskDeleted { task_id: TaskId, list_id: ListId },
    #[serde(rename = "task:move")]
    TaskMoved(TaskMove),
    #[serde(rename = "member:join")]
    MemberJoined { member: Member },
    /// `unassigned` lists the tasks the departed user was removed from.
    #[serde(rename = "member:leave")]
    MemberLeft {
        user_id: UserId,
        unassigned: Vec<TaskId>,
    },
    #[serde(rename = "activity:new")]
    ActivityRecorded(Activity),
    /// Full set of users currently viewing the board.
    #[serde(rename = "presence:update")]
    PresenceChanged { viewers: Vec<UserId> },
}

impl BoardEvent {
    /// Wire name of the event.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::BoardUpdated(_) => "board:update",
            Self::BoardDeleted { .. } => "board:delete",
            Self::ListCreated(_) => "list:create",
            Self::ListUpdated(_) => "list:update",
            Self::ListDeleted { .. } => "list:delete",
            Self::ListsReordered { .. } => "list:reorder",
            Self::TaskCreated(_) => "task:create",
            Self::TaskUpdated(_) => "task:update",
            Self::TaskDeleted { .. } => "task:delete",
            Self::TaskMoved(_) => "task:move",
            Self::MemberJoined { .. } => "member:join",
            Self::MemberLeft { .. } => "member:leave",
            Self::ActivityRecorded(_) => "activity:new",
            Self::PresenceChanged { .. } => "presence:update",
        }
    }

    /// Whether the event describes a committed change to board state.
    ///
    /// Activity and presence events are informational: they carry the
    /// current revision without advancing it.
    #[must_use]
    pub const fn is_state_change(&self) -> bool {
        !matches!(
            self,
            Self::ActivityRecorded(_) | Self::PresenceChanged { .. }
        )
    }
}

/// The connection and request that caused an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub connection_id: ConnectionId,
    pub request_id: RequestId,
}

/// An event as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub board_id: BoardId,
    /// Board commit counter after the change this event describes.
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    #[serde(flatten)]
    pub event: BoardEvent,
}
