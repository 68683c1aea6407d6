//! In-memory transactional board store.
//!
//! Each board lives in its own cell behind a `tokio::sync::Mutex`, which is
//! the serialization point for every mutation of that board. Boards are
//! independent: locking one never waits on another.
//!
//! A mutation takes the board lock ([`Store::lock_board`]), stages a copy of
//! the tables ([`BoardGuard::begin`]), edits the copy, and swaps it in
//! ([`BoardGuard::commit`]). Dropping a staged copy aborts the transaction
//! without a trace.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use taskboard_proto::ids::{BoardId, ListId, TaskId, UserId};
use taskboard_proto::model::{
    Board, BoardView, Comment, List, ListView, Member, MemberRole, Task, TaskView,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::ordering::{self, Rows};

/// Default time a request waits for a board's lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur when acquiring a board.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The board does not exist (or was deleted while waiting).
    #[error("board {0} not found")]
    BoardNotFound(BoardId),
    /// The board lock could not be acquired within the timeout.
    #[error("board {0} is busy")]
    Busy(BoardId),
}

/// All rows belonging to one board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardTables {
    pub board: Board,
    pub members: BTreeMap<UserId, Member>,
    pub lists: Rows<List>,
    pub tasks: Rows<Task>,
    /// `(task, user)` pairs.
    pub assignments: BTreeSet<(TaskId, UserId)>,
    /// Comments per task, oldest first.
    pub comments: BTreeMap<TaskId, Vec<Comment>>,
}

impl BoardTables {
    /// Fresh tables for a new board with its owner as the only member.
    #[must_use]
    pub fn new(board: Board) -> Self {
        let owner = Member {
            user_id: board.owner_id.clone(),
            role: MemberRole::Owner,
            joined_at: board.created_at,
        };
        Self {
            members: BTreeMap::from([(owner.user_id.clone(), owner)]),
            board,
            lists: HashMap::new(),
            tasks: HashMap::new(),
            assignments: BTreeSet::new(),
            comments: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn is_member(&self, user: &UserId) -> bool {
        self.members.contains_key(user)
    }

    #[must_use]
    pub fn is_owner(&self, user: &UserId) -> bool {
        self.board.owner_id == *user
    }

    /// Users assigned to a task, sorted.
    #[must_use]
    pub fn assignees(&self, task_id: TaskId) -> Vec<UserId> {
        self.assignments
            .range((task_id, UserId::new(""))..)
            .take_while(|(task, _)| *task == task_id)
            .map(|(_, user)| user.clone())
            .collect()
    }

    /// Canonical view of a task, archived or not.
    #[must_use]
    pub fn task_view(&self, task_id: TaskId) -> Option<TaskView> {
        self.tasks.get(&task_id).map(|task| TaskView {
            task: task.clone(),
            board_id: self.board.id,
            assignees: self.assignees(task_id),
            comment_count: self
                .comments
                .get(&task_id)
                .map_or(0, |c| u32::try_from(c.len()).unwrap_or(u32::MAX)),
        })
    }

    /// Canonical view of a list with its live tasks in order.
    #[must_use]
    pub fn list_view(&self, list_id: ListId) -> Option<ListView> {
        let list = self.lists.get(&list_id)?;
        let tasks = ordering::ordered_ids(&self.tasks, list_id)
            .into_iter()
            .filter_map(|id| self.task_view(id))
            .collect();
        Some(ListView {
            list: list.clone(),
            tasks,
        })
    }

    /// All lists in order, each with its tasks.
    #[must_use]
    pub fn list_views(&self) -> Vec<ListView> {
        ordering::ordered_ids(&self.lists, self.board.id)
            .into_iter()
            .filter_map(|id| self.list_view(id))
            .collect()
    }

    /// Full board snapshot.
    #[must_use]
    pub fn view(&self, revision: u64, viewers: Vec<UserId>) -> BoardView {
        BoardView {
            board: self.board.clone(),
            members: self.members.values().cloned().collect(),
            lists: self.list_views(),
            viewers,
            revision,
        }
    }

    /// Drops every assignment of `task_id`.
    pub fn clear_assignments(&mut self, task_id: TaskId) {
        self.assignments.retain(|(task, _)| *task != task_id);
    }

    /// Drops a task's assignments and comments along with the row.
    pub fn remove_task(&mut self, task_id: TaskId) -> Option<Task> {
        self.clear_assignments(task_id);
        self.comments.remove(&task_id);
        self.tasks.remove(&task_id)
    }
}

struct BoardState {
    tables: BoardTables,
    deleted: bool,
}

struct BoardCell {
    state: Arc<Mutex<BoardState>>,
    /// Mirror of the committed revision, readable without the lock.
    revision: AtomicU64,
}

/// Global index of boards and of which board owns each list and task.
pub struct Store {
    boards: RwLock<HashMap<BoardId, Arc<BoardCell>>>,
    lists: RwLock<HashMap<ListId, BoardId>>,
    tasks: RwLock<HashMap<TaskId, BoardId>>,
    lock_timeout: Duration,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Creates an empty store with the default lock timeout.
    #[must_use]
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Creates an empty store with a custom lock timeout.
    #[must_use]
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            boards: RwLock::new(HashMap::new()),
            lists: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            lock_timeout,
        }
    }

    /// Adds a new board at revision 0.
    pub fn insert_board(&self, tables: BoardTables) {
        let board_id = tables.board.id;
        {
            let mut lists = self.lists.write();
            for id in tables.lists.keys() {
                lists.insert(*id, board_id);
            }
        }
        {
            let mut tasks = self.tasks.write();
            for id in tables.tasks.keys() {
                tasks.insert(*id, board_id);
            }
        }
        let cell = BoardCell {
            state: Arc::new(Mutex::new(BoardState {
                tables,
                deleted: false,
            })),
            revision: AtomicU64::new(0),
        };
        self.boards.write().insert(board_id, Arc::new(cell));
    }

    /// Board owning a list, if the list exists.
    #[must_use]
    pub fn board_of_list(&self, list_id: ListId) -> Option<BoardId> {
        self.lists.read().get(&list_id).copied()
    }

    /// Board owning a task, if the task exists.
    #[must_use]
    pub fn board_of_task(&self, task_id: TaskId) -> Option<BoardId> {
        self.tasks.read().get(&task_id).copied()
    }

    /// Last committed revision of a board, without taking its lock.
    #[must_use]
    pub fn revision(&self, board_id: BoardId) -> Option<u64> {
        self.boards
            .read()
            .get(&board_id)
            .map(|cell| cell.revision.load(Ordering::Acquire))
    }

    /// Number of boards currently stored.
    #[must_use]
    pub fn board_count(&self) -> usize {
        self.boards.read().len()
    }

    /// Acquires a board's serialization point.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::BoardNotFound`] if the board does not exist or
    /// was deleted while waiting, and [`StoreError::Busy`] if the lock was
    /// not acquired within the store's lock timeout.
    pub async fn lock_board(&self, board_id: BoardId) -> Result<BoardGuard<'_>, StoreError> {
        let cell = self
            .boards
            .read()
            .get(&board_id)
            .cloned()
            .ok_or(StoreError::BoardNotFound(board_id))?;

        let state = tokio::time::timeout(self.lock_timeout, Arc::clone(&cell.state).lock_owned())
            .await
            .map_err(|_| {
                tracing::debug!(board_id = %board_id, "board lock timed out");
                StoreError::Busy(board_id)
            })?;

        if state.deleted {
            return Err(StoreError::BoardNotFound(board_id));
        }

        Ok(BoardGuard {
            store: self,
            cell,
            state,
        })
    }

    /// Rows of every board `user` belongs to, most recently updated first.
    ///
    /// Boards are visited one lock at a time; a board deleted meanwhile is
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Busy`] if some board stays locked past the
    /// timeout.
    pub async fn boards_of(&self, user: &UserId) -> Result<Vec<Board>, StoreError> {
        let ids: Vec<BoardId> = self.boards.read().keys().copied().collect();
        let mut boards = Vec::new();
        for board_id in ids {
            match self.lock_board(board_id).await {
                Ok(guard) if guard.tables().is_member(user) => {
                    boards.push(guard.tables().board.clone());
                }
                Ok(_) | Err(StoreError::BoardNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        boards.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(boards)
    }

    /// Whether `user` is a member of `board_id`.
    ///
    /// # Errors
    ///
    /// Propagates [`Store::lock_board`] errors.
    pub async fn is_board_member(&self, user: &UserId, board_id: BoardId) -> Result<bool, StoreError> {
        Ok(self.lock_board(board_id).await?.tables().is_member(user))
    }

    /// Whether `user` owns `board_id`.
    ///
    /// # Errors
    ///
    /// Propagates [`Store::lock_board`] errors.
    pub async fn is_board_owner(&self, user: &UserId, board_id: BoardId) -> Result<bool, StoreError> {
        Ok(self.lock_board(board_id).await?.tables().is_owner(user))
    }

    /// Brings the id indexes in line with a commit. Only ids the commit
    /// added or removed are touched, and an index whose key set did not
    /// change is not locked at all.
    fn reindex(&self, board_id: BoardId, before: &BoardTables, after: &BoardTables) {
        reindex_rows(&self.lists, board_id, &before.lists, &after.lists);
        reindex_rows(&self.tasks, board_id, &before.tasks, &after.tasks);
    }
}

fn reindex_rows<K, V>(
    index: &RwLock<HashMap<K, BoardId>>,
    board_id: BoardId,
    before: &HashMap<K, V>,
    after: &HashMap<K, V>,
) where
    K: Copy + Eq + Hash,
{
    let removed: Vec<K> = before
        .keys()
        .filter(|id| !after.contains_key(id))
        .copied()
        .collect();
    let added: Vec<K> = after
        .keys()
        .filter(|id| !before.contains_key(id))
        .copied()
        .collect();
    if removed.is_empty() && added.is_empty() {
        return;
    }

    let mut index = index.write();
    for id in &removed {
        index.remove(id);
    }
    for id in added {
        index.insert(id, board_id);
    }
}

/// Exclusive access to one board for the duration of a request.
pub struct BoardGuard<'a> {
    store: &'a Store,
    cell: Arc<BoardCell>,
    state: OwnedMutexGuard<BoardState>,
}

impl BoardGuard<'_> {
    #[must_use]
    pub fn board_id(&self) -> BoardId {
        self.state.tables.board.id
    }

    /// Committed tables.
    #[must_use]
    pub fn tables(&self) -> &BoardTables {
        &self.state.tables
    }

    /// Last committed revision.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.cell.revision.load(Ordering::Acquire)
    }

    /// Stages a copy of the committed tables.
    #[must_use]
    pub fn begin(&self) -> BoardTables {
        self.state.tables.clone()
    }

    /// Swaps staged tables in and bumps the revision. Returns the new
    /// revision.
    pub fn commit(&mut self, staged: BoardTables) -> u64 {
        let board_id = self.board_id();
        self.store.reindex(board_id, &self.state.tables, &staged);
        self.state.tables = staged;
        let revision = self.cell.revision.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(board_id = %board_id, revision, "board committed");
        revision
    }

    /// Removes the board and everything in it. Requests already waiting on
    /// the lock see [`StoreError::BoardNotFound`]. Returns the final
    /// revision.
    pub fn delete(mut self) -> u64 {
        let board_id = self.board_id();
        let empty = BoardTables::new(self.state.tables.board.clone());
        self.store.reindex(board_id, &self.state.tables, &empty);
        self.state.deleted = true;
        self.store.boards.write().remove(&board_id);
        self.cell.revision.fetch_add(1, Ordering::AcqRel) + 1
    }
}
