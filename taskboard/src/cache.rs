//! Client-side board cache.
//!
//! Holds the last known canonical state of one board and folds the server's
//! event stream into it. State-changing events must arrive with consecutive
//! revisions: older ones are ignored, and a gap means the cache has missed
//! something and must be reloaded from a fresh snapshot.
//!
//! Task moves, whether predicted locally or announced by the server, go
//! through the same reducer ([`relocate`]) so both paths land on identical
//! state.

use std::collections::VecDeque;

use taskboard_proto::event::{BoardEvent, EventEnvelope};
use taskboard_proto::ids::{BoardId, ListId, TaskId, UserId};
use taskboard_proto::model::{Activity, BoardView, ListView, TaskView};

/// Activity entries kept for display.
const ACTIVITY_CAPACITY: usize = 50;

/// Reasons an event or intent cannot be applied to cached state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("task {0} is not in the cached board")]
    UnknownTask(TaskId),
    #[error("list {0} is not in the cached board")]
    UnknownList(ListId),
    #[error("position {index} out of range (0..={count})")]
    InvalidPosition { index: i64, count: usize },
}

/// What applying an event did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The cached board changed.
    Changed,
    /// Nothing to do: stale, duplicate, or already reflected.
    Ignored,
    /// The cache is out of step with the server and must be reloaded.
    RefetchRequired,
}

/// Last known canonical state of one board.
#[derive(Debug, Clone)]
pub struct BoardCache {
    view: BoardView,
    activity: VecDeque<Activity>,
    deleted: bool,
}

impl BoardCache {
    /// Starts from a full snapshot.
    #[must_use]
    pub fn from_snapshot(view: BoardView) -> Self {
        Self {
            view,
            activity: VecDeque::new(),
            deleted: false,
        }
    }

    #[must_use]
    pub const fn board_id(&self) -> BoardId {
        self.view.board.id
    }

    /// Revision of the last state change folded in.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.view.revision
    }

    #[must_use]
    pub const fn view(&self) -> &BoardView {
        &self.view
    }

    /// Whether a `board:delete` event has been seen.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Recent activity seen on the stream, newest first.
    pub fn activity(&self) -> impl Iterator<Item = &Activity> {
        self.activity.iter()
    }

    #[must_use]
    pub fn list(&self, list_id: ListId) -> Option<&ListView> {
        self.view.lists.iter().find(|l| l.id() == list_id)
    }

    #[must_use]
    pub fn task(&self, task_id: TaskId) -> Option<&TaskView> {
        let (l, i) = locate(&self.view.lists, task_id)?;
        Some(&self.view.lists[l].tasks[i])
    }

    /// Task ids of a list in display order.
    #[must_use]
    pub fn task_order(&self, list_id: ListId) -> Vec<TaskId> {
        self.list(list_id)
            .map(|l| l.tasks.iter().map(TaskView::id).collect())
            .unwrap_or_default()
    }

    /// Folds one event from the board's stream into the cache.
    pub fn apply_event(&mut self, envelope: &EventEnvelope) -> Applied {
        if envelope.board_id != self.board_id() {
            return Applied::Ignored;
        }
        if !envelope.event.is_state_change() {
            return self.apply_informational(&envelope.event);
        }

        let known = self.view.revision;
        if envelope.revision <= known {
            return Applied::Ignored;
        }
        if envelope.revision > known + 1 {
            tracing::debug!(
                board_id = %self.board_id(),
                known,
                got = envelope.revision,
                "revision gap"
            );
            return Applied::RefetchRequired;
        }

        match self.apply_state(&envelope.event) {
            Ok(changed) => {
                self.view.revision = envelope.revision;
                if changed {
                    Applied::Changed
                } else {
                    Applied::Ignored
                }
            }
            Err(e) => {
                tracing::debug!(
                    board_id = %self.board_id(),
                    event = envelope.event.name(),
                    error = %e,
                    "event does not fit cached board"
                );
                Applied::RefetchRequired
            }
        }
    }

    /// Replaces a task with its canonical form without touching the
    /// revision. Used when a reply arrives ahead of its event.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the task or its list is unknown.
    pub fn adopt_task(&mut self, task: &TaskView) -> Result<bool, CacheError> {
        upsert_task(&mut self.view.lists, task)
    }

    fn apply_informational(&mut self, event: &BoardEvent) -> Applied {
        match event {
            BoardEvent::PresenceChanged { viewers } => {
                if self.view.viewers == *viewers {
                    return Applied::Ignored;
                }
                self.view.viewers.clone_from(viewers);
            }
            BoardEvent::ActivityRecorded(entry) => {
                if self.activity.iter().any(|a| a.id == entry.id) {
                    return Applied::Ignored;
                }
                self.activity.push_front(entry.clone());
                self.activity.truncate(ACTIVITY_CAPACITY);
            }
            _ => return Applied::Ignored,
        }
        Applied::Changed
    }

    #[allow(clippy::too_many_lines)]
    fn apply_state(&mut self, event: &BoardEvent) -> Result<bool, CacheError> {
        let lists = &mut self.view.lists;
        match event {
            BoardEvent::BoardUpdated(board) => {
                let changed = self.view.board != *board;
                self.view.board.clone_from(board);
                Ok(changed)
            }
            BoardEvent::BoardDeleted { .. } => {
                self.deleted = true;
                Ok(true)
            }
            BoardEvent::ListCreated(list) | BoardEvent::ListUpdated(list) => {
                if let Some(existing) = lists.iter_mut().find(|l| l.id() == list.id()) {
                    let changed = existing != list;
                    existing.clone_from(list);
                    return Ok(changed);
                }
                if matches!(event, BoardEvent::ListUpdated(_)) {
                    return Err(CacheError::UnknownList(list.id()));
                }
                let at = index(list.list.position).min(lists.len());
                lists.insert(at, list.clone());
                renumber_lists(lists);
                Ok(true)
            }
            BoardEvent::ListDeleted { list_id } => {
                let at = lists
                    .iter()
                    .position(|l| l.id() == *list_id)
                    .ok_or(CacheError::UnknownList(*list_id))?;
                lists.remove(at);
                renumber_lists(lists);
                Ok(true)
            }
            BoardEvent::ListsReordered { lists: canonical } => {
                let changed = lists != canonical;
                lists.clone_from(canonical);
                Ok(changed)
            }
            BoardEvent::TaskCreated(task) | BoardEvent::TaskUpdated(task) => {
                upsert_task(lists, task)
            }
            BoardEvent::TaskDeleted { task_id, list_id } => {
                if !lists.iter().any(|l| l.id() == *list_id) {
                    return Err(CacheError::UnknownList(*list_id));
                }
                // Archived tasks are not cached; deleting one changes nothing.
                Ok(remove_task(lists, *task_id).is_some())
            }
            BoardEvent::TaskMoved(mv) => relocate(
                lists,
                mv.task.id(),
                mv.target_list_id,
                i64::from(mv.position),
                Some(&mv.task),
            ),
            BoardEvent::MemberJoined { member } => {
                if self.view.members.iter().any(|m| m.user_id == member.user_id) {
                    return Ok(false);
                }
                self.view.members.push(member.clone());
                self.view.members.sort_by(|a, b| a.user_id.cmp(&b.user_id));
                Ok(true)
            }
            BoardEvent::MemberLeft {
                user_id,
                unassigned,
            } => {
                let before = self.view.members.len();
                self.view.members.retain(|m| m.user_id != *user_id);
                let mut changed = self.view.members.len() != before;
                for task_id in unassigned {
                    changed |= unassign(&mut self.view.lists, *task_id, user_id);
                }
                Ok(changed)
            }
            BoardEvent::ActivityRecorded(_) | BoardEvent::PresenceChanged { .. } => Ok(false),
        }
    }
}

/// Splices `task_id` out of whichever list holds it and into `target_list`
/// at `target_index`, renumbering both lists.
///
/// The one reducer for task moves: local predictions and server events both
/// go through it. Applying the same move twice is a no-op the second time.
/// When `canonical` is given, the moved task is replaced by it.
///
/// # Errors
///
/// [`CacheError::UnknownTask`], [`CacheError::UnknownList`], or
/// [`CacheError::InvalidPosition`] when `target_index` is outside
/// `[0, count]` with count excluding the moving task.
pub fn relocate(
    lists: &mut [ListView],
    task_id: TaskId,
    target_list: ListId,
    target_index: i64,
    canonical: Option<&TaskView>,
) -> Result<bool, CacheError> {
    let (from_l, from_i) = locate(lists, task_id).ok_or(CacheError::UnknownTask(task_id))?;
    let to_l = lists
        .iter()
        .position(|l| l.id() == target_list)
        .ok_or(CacheError::UnknownList(target_list))?;
    let count = lists[to_l].tasks.len() - usize::from(from_l == to_l);
    let at = usize::try_from(target_index)
        .ok()
        .filter(|at| *at <= count)
        .ok_or(CacheError::InvalidPosition {
            index: target_index,
            count,
        })?;

    let current = &lists[from_l].tasks[from_i];
    if from_l == to_l && from_i == at && canonical.is_none_or(|c| c == current) {
        return Ok(false);
    }

    let mut task = lists[from_l].tasks.remove(from_i);
    renumber_tasks(&mut lists[from_l]);
    if let Some(canonical) = canonical {
        task.clone_from(canonical);
    }
    task.task.list_id = target_list;
    lists[to_l].tasks.insert(at, task);
    renumber_tasks(&mut lists[to_l]);
    Ok(true)
}

/// Index of the list and slot holding `task_id`.
#[must_use]
pub fn locate(lists: &[ListView], task_id: TaskId) -> Option<(usize, usize)> {
    lists.iter().enumerate().find_map(|(l, list)| {
        list.tasks
            .iter()
            .position(|t| t.id() == task_id)
            .map(|i| (l, i))
    })
}

/// Brings a task to its canonical state: archived tasks leave the view,
/// live ones are placed at their canonical list and position.
fn upsert_task(lists: &mut [ListView], task: &TaskView) -> Result<bool, CacheError> {
    if !lists.iter().any(|l| l.id() == task.task.list_id) {
        return Err(CacheError::UnknownList(task.task.list_id));
    }
    if task.task.archived {
        return Ok(remove_task(lists, task.id()).is_some());
    }
    if locate(lists, task.id()).is_some() {
        return relocate(
            lists,
            task.id(),
            task.task.list_id,
            i64::from(task.task.position),
            Some(task),
        );
    }

    let list = lists
        .iter_mut()
        .find(|l| l.id() == task.task.list_id)
        .ok_or(CacheError::UnknownList(task.task.list_id))?;
    let at = index(task.task.position);
    if at > list.tasks.len() {
        return Err(CacheError::InvalidPosition {
            index: i64::from(task.task.position),
            count: list.tasks.len(),
        });
    }
    list.tasks.insert(at, task.clone());
    renumber_tasks(list);
    Ok(true)
}

fn remove_task(lists: &mut [ListView], task_id: TaskId) -> Option<TaskView> {
    let (l, i) = locate(lists, task_id)?;
    let task = lists[l].tasks.remove(i);
    renumber_tasks(&mut lists[l]);
    Some(task)
}

fn unassign(lists: &mut [ListView], task_id: TaskId, user_id: &UserId) -> bool {
    let Some((l, i)) = locate(lists, task_id) else {
        return false;
    };
    let assignees = &mut lists[l].tasks[i].assignees;
    let before = assignees.len();
    assignees.retain(|u| u != user_id);
    assignees.len() != before
}

fn renumber_tasks(list: &mut ListView) {
    for (position, task) in (0u32..).zip(list.tasks.iter_mut()) {
        task.task.position = position;
    }
}

fn renumber_lists(lists: &mut [ListView]) {
    for (position, list) in (0u32..).zip(lists.iter_mut()) {
        list.list.position = position;
    }
}

fn index(position: u32) -> usize {
    usize::try_from(position).unwrap_or(usize::MAX)
}
