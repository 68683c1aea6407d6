//! Move coordination: task moves and list reordering.
//!
//! A move is validated against committed state and applied to a staged copy
//! under the board lock, so two moves on the same board never interleave and
//! every list stays dense no matter how requests race.

use chrono::Utc;
use taskboard_proto::event::{BoardEvent, TaskMove};
use taskboard_proto::ids::{BoardId, ListId, TaskId};
use taskboard_proto::model::{ListView, TaskView};

use crate::error::ServiceError;
use crate::ordering;
use crate::service::{Actor, KanbanService, require_member, task_view};

impl KanbanService {
    /// Moves a task to `target_index` of `target_list_id`.
    ///
    /// Validation order: the task exists and is live, the actor is a board
    /// member, the target list exists on the same board, the task is still in
    /// `source_list_id`, then the index is within `[0, count]` where count
    /// excludes the moving task.
    ///
    /// A move to the task's own slot commits nothing but still returns the
    /// canonical task and announces it, so the caller's optimistic state is
    /// confirmed like any other move.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`], [`ServiceError::Forbidden`],
    /// [`ServiceError::InvalidTarget`], [`ServiceError::InvalidPosition`] or
    /// [`ServiceError::Busy`].
    pub async fn move_task(
        &self,
        actor: &Actor,
        task_id: TaskId,
        source_list_id: ListId,
        target_list_id: ListId,
        target_index: i64,
    ) -> Result<TaskView, ServiceError> {
        let mut guard = self.lock_for_task(task_id).await?;

        let tables = guard.tables();
        let task = tables
            .tasks
            .get(&task_id)
            .filter(|task| task.is_live())
            .ok_or(ServiceError::NotFound("task"))?;
        require_member(tables, &actor.user_id)?;
        let Some(target_list) = tables.lists.get(&target_list_id) else {
            return Err(match self.store.board_of_list(target_list_id) {
                Some(_) => ServiceError::invalid_target("target list is on another board"),
                None => ServiceError::NotFound("list"),
            });
        };
        if task.list_id != source_list_id {
            return Err(ServiceError::invalid_target(
                "task is no longer in the source list",
            ));
        }
        let count = ordering::count_excluding(&tables.tasks, target_list_id, task_id);
        let index = ordering::validate_index(target_index, count)?;

        let title = task.title.clone();
        let target_name = target_list.name.clone();
        let source_name = tables
            .lists
            .get(&source_list_id)
            .map(|list| list.name.clone())
            .unwrap_or_default();

        if source_list_id == target_list_id && task.position == index {
            let view = task_view(&guard, task_id)?;
            tracing::debug!(task_id = %task_id, position = index, "move is a no-op");
            self.emit(&guard, actor, moved(view.clone(), source_list_id))
                .await;
            return Ok(view);
        }

        let mut staged = guard.begin();
        let outcome = ordering::apply_move(&mut staged.tasks, task_id, target_list_id, index)?;
        if let Some(task) = staged.tasks.get_mut(&task_id) {
            task.updated_at = Utc::now();
        }
        let revision = guard.commit(staged);

        tracing::debug!(
            task_id = %task_id,
            from = %outcome.source_parent,
            from_position = outcome.source_position,
            to = %outcome.parent,
            to_position = outcome.position,
            shifted = outcome.shifted,
            revision,
            "task moved"
        );

        let view = task_view(&guard, task_id)?;
        self.emit(&guard, actor, moved(view.clone(), source_list_id))
            .await;
        let description = if source_list_id == target_list_id {
            format!("reordered \"{title}\" in \"{target_name}\"")
        } else {
            format!("moved \"{title}\" from \"{source_name}\" to \"{target_name}\"")
        };
        self.record(&guard, actor, description, Some(task_id)).await;
        Ok(view)
    }

    /// Replaces the board's list order. `list_ids` must name every list of
    /// the board exactly once.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`], [`ServiceError::Forbidden`] or
    /// [`ServiceError::InvalidTarget`] when `list_ids` is not a permutation.
    pub async fn reorder_lists(
        &self,
        actor: &Actor,
        board_id: BoardId,
        list_ids: &[ListId],
    ) -> Result<Vec<ListView>, ServiceError> {
        let mut guard = self.store.lock_board(board_id).await?;
        require_member(guard.tables(), &actor.user_id)?;

        let mut staged = guard.begin();
        ordering::reorder(&mut staged.lists, board_id, list_ids)?;
        guard.commit(staged);

        let lists = guard.tables().list_views();
        self.emit(&guard, actor, BoardEvent::ListsReordered {
            lists: lists.clone(),
        })
        .await;
        self.record(&guard, actor, "reordered lists".to_string(), None)
            .await;
        Ok(lists)
    }
}

fn moved(task: TaskView, source_list_id: ListId) -> BoardEvent {
    BoardEvent::TaskMoved(TaskMove {
        source_list_id,
        target_list_id: task.task.list_id,
        position: task.task.position,
        task,
    })
}
