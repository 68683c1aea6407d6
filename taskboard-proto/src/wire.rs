//! Client/server messages carried as JSON text frames over the board
//! WebSocket.
//!
//! The first client frame must be [`ClientMessage::Hello`]; the server
//! answers with [`ServerMessage::Welcome`] or an `unauthenticated`
//! [`ServerMessage::Error`]. After that every [`ClientMessage::Request`] gets
//! exactly one [`ServerMessage::Response`] with the same `request_id`, and
//! board events arrive interleaved as [`ServerMessage::Event`].

use serde::{Deserialize, Serialize};

use crate::error::ErrorBody;
use crate::event::EventEnvelope;
use crate::ids::{BoardId, ConnectionId, ListId, RequestId, TaskId, UserId};
use crate::model::{
    Activity, Board, BoardPatch, BoardView, Comment, ListView, Member, NewTask, Priority,
    TaskPatch, TaskView,
};

/// Error type for encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Operations a client can request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Boards the caller is a member of, most recently updated first.
    /// `archived` picks archived boards instead of live ones; `query`
    /// matches names case-insensitively.
    ListBoards {
        #[serde(default)]
        archived: bool,
        #[serde(default)]
        query: Option<String>,
    },
    CreateBoard {
        name: String,
        #[serde(default)]
        background: Option<String>,
    },
    GetBoard {
        board_id: BoardId,
    },
    UpdateBoard {
        board_id: BoardId,
        patch: BoardPatch,
    },
    DeleteBoard {
        board_id: BoardId,
    },
    AddMember {
        board_id: BoardId,
        user_id: UserId,
    },
    RemoveMember {
        board_id: BoardId,
        user_id: UserId,
    },
    CreateList {
        board_id: BoardId,
        name: String,
    },
    RenameList {
        list_id: ListId,
        name: String,
    },
    DeleteList {
        list_id: ListId,
    },
    /// Replace the board's list order; `list_ids` must be a permutation of
    /// the board's lists.
    ReorderLists {
        board_id: BoardId,
        list_ids: Vec<ListId>,
    },
    CreateTask {
        list_id: ListId,
        task: NewTask,
    },
    UpdateTask {
        task_id: TaskId,
        patch: TaskPatch,
    },
    DeleteTask {
        task_id: TaskId,
    },
    /// Signed so that negative indices reach the server and are rejected
    /// with `invalid_position` rather than failing to parse.
    MoveTask {
        task_id: TaskId,
        source_list_id: ListId,
        target_list_id: ListId,
        target_index: i64,
    },
    AssignTask {
        task_id: TaskId,
        user_id: UserId,
    },
    UnassignTask {
        task_id: TaskId,
        user_id: UserId,
    },
    AddComment {
        task_id: TaskId,
        body: String,
    },
    /// Live tasks on the caller's boards, most recently updated first.
    /// Every given filter must match; `query` looks at title and
    /// description case-insensitively.
    SearchTasks {
        #[serde(default)]
        board_id: Option<BoardId>,
        #[serde(default)]
        query: Option<String>,
        #[serde(default)]
        priority: Option<Priority>,
        #[serde(default)]
        assignee: Option<UserId>,
        #[serde(default)]
        limit: Option<usize>,
    },
    /// Start receiving the board's events. Leaves any previous board first.
    Subscribe {
        board_id: BoardId,
    },
    Unsubscribe {
        board_id: BoardId,
    },
    Viewers {
        board_id: BoardId,
    },
    Activities {
        board_id: BoardId,
        #[serde(default)]
        limit: Option<usize>,
    },
}

impl Request {
    /// Short operation name for logs.
    #[must_use]
    pub const fn op_name(&self) -> &'static str {
        match self {
            Self::ListBoards { .. } => "list_boards",
            Self::CreateBoard { .. } => "create_board",
            Self::GetBoard { .. } => "get_board",
            Self::UpdateBoard { .. } => "update_board",
            Self::DeleteBoard { .. } => "delete_board",
            Self::AddMember { .. } => "add_member",
            Self::RemoveMember { .. } => "remove_member",
            Self::CreateList { .. } => "create_list",
            Self::RenameList { .. } => "rename_list",
            Self::DeleteList { .. } => "delete_list",
            Self::ReorderLists { .. } => "reorder_lists",
            Self::CreateTask { .. } => "create_task",
            Self::UpdateTask { .. } => "update_task",
            Self::DeleteTask { .. } => "delete_task",
            Self::MoveTask { .. } => "move_task",
            Self::AssignTask { .. } => "assign_task",
            Self::UnassignTask { .. } => "unassign_task",
            Self::AddComment { .. } => "add_comment",
            Self::SearchTasks { .. } => "search_tasks",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Viewers { .. } => "viewers",
            Self::Activities { .. } => "activities",
        }
    }
}

/// Successful results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Reply {
    Boards(Vec<Board>),
    Board(BoardView),
    BoardRow(Board),
    List(ListView),
    Lists(Vec<ListView>),
    Task(TaskView),
    Tasks(Vec<TaskView>),
    Comment(Comment),
    Member(Member),
    Viewers(Vec<UserId>),
    Activities(Vec<Activity>),
    Done,
}

/// Result of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "snake_case")]
pub enum Outcome {
    Ok(Reply),
    Error(ErrorBody),
}

impl From<Result<Reply, ErrorBody>> for Outcome {
    fn from(result: Result<Reply, ErrorBody>) -> Self {
        match result {
            Ok(reply) => Self::Ok(reply),
            Err(err) => Self::Error(err),
        }
    }
}

impl From<Outcome> for Result<Reply, ErrorBody> {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Ok(reply) => Ok(reply),
            Outcome::Error(err) => Err(err),
        }
    }
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Must be the first frame on a connection.
    Hello { token: String },
    Request {
        request_id: RequestId,
        request: Request,
    },
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        user_id: UserId,
        connection_id: ConnectionId,
    },
    Response {
        request_id: RequestId,
        outcome: Outcome,
    },
    Event(EventEnvelope),
    /// Error not tied to a request: failed hello, undecodable frame.
    Error(ErrorBody),
}

/// Encodes a [`ClientMessage`] as a JSON string.
///
/// # Errors
///
/// Returns [`WireError::Serialization`] if serialization fails.
pub fn encode_client(msg: &ClientMessage) -> Result<String, WireError> {
    Ok(serde_json::to_string(msg)?)
}

/// Decodes a [`ClientMessage`] from JSON text.
///
/// # Errors
///
/// Returns [`WireError::Serialization`] if the text is not a valid message.
pub fn decode_client(text: &str) -> Result<ClientMessage, WireError> {
    Ok(serde_json::from_str(text)?)
}

/// Encodes a [`ServerMessage`] as a JSON string.
///
/// # Errors
///
/// Returns [`WireError::Serialization`] if serialization fails.
pub fn encode_server(msg: &ServerMessage) -> Result<String, WireError> {
    Ok(serde_json::to_string(msg)?)
}

/// Decodes a [`ServerMessage`] from JSON text.
///
/// # Errors
///
/// Returns [`WireError::Serialization`] if the text is not a valid message.
pub fn decode_server(text: &str) -> Result<ServerMessage, WireError> {
    Ok(serde_json::from_str(text)?)
}
