//! Board, list and task entities plus the canonical views sent to clients.
//!
//! Rows ([`Board`], [`List`], [`Task`]) are what the server stores. Views
//! ([`TaskView`], [`ListView`], [`BoardView`]) are rows with their relations
//! resolved, so a receiver can replace its local copy without a round trip.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::ids::{ActivityId, BoardId, CommentId, ListId, TaskId, UserId};

/// Maximum allowed task title length in characters.
pub const MAX_TASK_TITLE_LENGTH: usize = 256;

/// Maximum allowed board or list name length in characters.
pub const MAX_NAME_LENGTH: usize = 128;

/// Maximum allowed comment length in characters.
pub const MAX_COMMENT_LENGTH: usize = 4096;

/// Background colour given to boards created without one.
pub const DEFAULT_BACKGROUND: &str = "#1e3a5f";

/// Lists every new board starts with, in position order.
pub const DEFAULT_LISTS: [&str; 3] = ["To Do", "In Progress", "Done"];

/// Task priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Can wait.
    Low,
    /// The default.
    #[default]
    Medium,
    /// Should be picked up soon.
    High,
    /// Drop everything.
    Urgent,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

/// Role of a user within a board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    /// Created the board; may archive, delete and manage members.
    Owner,
    /// May read and mutate lists and tasks.
    Member,
}

/// A user's membership of a board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// The member.
    pub user_id: UserId,
    /// Owner or plain member.
    pub role: MemberRole,
    /// When the membership was created.
    pub joined_at: DateTime<Utc>,
}

/// A board row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Board {
    pub id: BoardId,
    pub name: String,
    pub background: String,
    /// Soft-deleted boards keep their contents but are hidden from listings.
    pub archived: bool,
    pub owner_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A list row. `position` is dense and zero-based within the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct List {
    pub id: ListId,
    pub board_id: BoardId,
    pub name: String,
    pub position: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task row.
///
/// `position` is dense and zero-based among the non-archived tasks of
/// `list_id`. An archived task keeps its last position but is no longer part
/// of the list's ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub list_id: ListId,
    pub position: u32,
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub due_date: Option<DateTime<Utc>>,
    pub labels: BTreeSet<String>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Whether the task takes part in its list's ordering.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        !self.archived
    }
}

/// A task with its relations resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub board_id: BoardId,
    /// Assigned users, sorted.
    pub assignees: Vec<UserId>,
    #[serde(default)]
    pub comment_count: u32,
}

impl TaskView {
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.task.id
    }
}

/// A list with its live tasks in position order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListView {
    #[serde(flatten)]
    pub list: List,
    pub tasks: Vec<TaskView>,
}

impl ListView {
    #[must_use]
    pub const fn id(&self) -> ListId {
        self.list.id
    }
}

/// Full canonical state of one board, used for initial load and re-fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardView {
    pub board: Board,
    pub members: Vec<Member>,
    /// Lists in position order, each with its live tasks in position order.
    pub lists: Vec<ListView>,
    /// Users currently viewing the board.
    pub viewers: Vec<UserId>,
    /// Commit counter the snapshot was taken at.
    pub revision: u64,
}

/// Fields for a new task. The list and position are not part of it: new
/// tasks are always appended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub assignees: Vec<UserId>,
}

impl NewTask {
    /// A task with only a title; everything else defaulted.
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// Partial update of a task. Absent fields are left alone; for nullable
/// fields an explicit `null` clears the value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub description: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "double_option"
    )]
    pub due_date: Option<Option<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

/// Partial update of a board.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<String>,
    /// Owner only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

/// One entry of a board's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub board_id: BoardId,
    pub user_id: UserId,
    pub description: String,
    pub task_id: Option<TaskId>,
    pub created_at: DateTime<Utc>,
}

/// A comment left on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub task_id: TaskId,
    pub user_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Present-but-null must deserialize to `Some(None)`, which plain
/// `Option<Option<T>>` collapses to `None`.
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
