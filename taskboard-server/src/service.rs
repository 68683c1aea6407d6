//! Board operations: the request handlers behind the WebSocket API.
//!
//! Every mutation follows the same shape: lock the board, validate against
//! committed state, edit a staged copy, commit, publish the resulting event
//! while still holding the lock, then record an activity entry. Because
//! events go out under the board lock, subscribers see them in commit order.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use taskboard_proto::event::{BoardEvent, EventEnvelope, Origin};
use taskboard_proto::ids::{
    ActivityId, BoardId, CommentId, ConnectionId, ListId, RequestId, TaskId, UserId,
};
use taskboard_proto::model::{
    Activity, Board, BoardPatch, BoardView, Comment, DEFAULT_BACKGROUND, DEFAULT_LISTS, List,
    ListView, MAX_COMMENT_LENGTH, MAX_NAME_LENGTH, MAX_TASK_TITLE_LENGTH, Member, MemberRole,
    NewTask, Priority, Task, TaskPatch, TaskView,
};
use taskboard_proto::wire::{Reply, Request};

use crate::activity::{ActivityLog, ActivitySink, DEFAULT_PAGE};
use crate::auth::{Authenticator, StaticTokens};
use crate::error::ServiceError;
use crate::fanout::Fanout;
use crate::ordering;
use crate::registry::{ConnectionRegistry, Outbox};
use crate::store::{BoardGuard, BoardTables, Store, StoreError};

/// Longest accepted background value (a colour or an image URL).
const MAX_BACKGROUND_LENGTH: usize = 512;

/// The user performing an operation and, when it came over a connection,
/// the request that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub origin: Option<Origin>,
}

impl Actor {
    /// An actor with no originating connection.
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: UserId::new(user_id),
            origin: None,
        }
    }

    /// An actor acting through `connection_id`'s request `request_id`.
    #[must_use]
    pub const fn on_connection(
        user_id: UserId,
        connection_id: ConnectionId,
        request_id: RequestId,
    ) -> Self {
        Self {
            user_id,
            origin: Some(Origin {
                connection_id,
                request_id,
            }),
        }
    }
}

/// The board service: store, ordering, fan-out and activity behind one API.
pub struct KanbanService {
    pub(crate) store: Store,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) fanout: Fanout,
    pub(crate) activity: Arc<dyn ActivitySink>,
    auth: Arc<dyn Authenticator>,
}

impl Default for KanbanService {
    fn default() -> Self {
        Self::new(
            Store::new(),
            Arc::new(ActivityLog::new()),
            Arc::new(StaticTokens::default()),
        )
    }
}

impl KanbanService {
    /// Creates a service over the given collaborators.
    #[must_use]
    pub fn new(
        store: Store,
        activity: Arc<dyn ActivitySink>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            store,
            fanout: Fanout::new(Arc::clone(&registry)),
            registry,
            activity,
            auth,
        }
    }

    /// Underlying store.
    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// Connection registry.
    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Maps a bearer token to a user.
    #[must_use]
    pub fn authenticate(&self, token: &str) -> Option<UserId> {
        self.auth.authenticate(token)
    }

    /// Registers an authenticated connection so it can subscribe to boards.
    pub async fn attach(&self, connection_id: ConnectionId, user_id: UserId, sender: Outbox) {
        self.registry.register(connection_id, user_id, sender).await;
    }

    /// Forgets a connection, updating presence on the board it watched.
    pub async fn detach(&self, connection_id: ConnectionId) {
        if let Some(board_id) = self.registry.unregister(connection_id).await {
            self.publish_presence(board_id).await;
        }
    }

    /// Runs one request on behalf of `actor`.
    ///
    /// # Errors
    ///
    /// Returns the operation's [`ServiceError`].
    pub async fn execute(
        &self,
        actor: &Actor,
        request: Request,
    ) -> Result<Reply, ServiceError> {
        match request {
            Request::ListBoards { archived, query } => self
                .list_boards(actor, archived, query.as_deref())
                .await
                .map(Reply::Boards),
            Request::CreateBoard { name, background } => self
                .create_board(actor, &name, background.as_deref())
                .await
                .map(Reply::Board),
            Request::GetBoard { board_id } => self.get_board(actor, board_id).await.map(Reply::Board),
            Request::UpdateBoard { board_id, patch } => self
                .update_board(actor, board_id, patch)
                .await
                .map(Reply::BoardRow),
            Request::DeleteBoard { board_id } => {
                self.delete_board(actor, board_id).await.map(|()| Reply::Done)
            }
            Request::AddMember { board_id, user_id } => self
                .add_member(actor, board_id, user_id)
                .await
                .map(Reply::Member),
            Request::RemoveMember { board_id, user_id } => self
                .remove_member(actor, board_id, &user_id)
                .await
                .map(|()| Reply::Done),
            Request::CreateList { board_id, name } => self
                .create_list(actor, board_id, &name)
                .await
                .map(Reply::List),
            Request::RenameList { list_id, name } => self
                .rename_list(actor, list_id, &name)
                .await
                .map(Reply::List),
            Request::DeleteList { list_id } => {
                self.delete_list(actor, list_id).await.map(|()| Reply::Done)
            }
            Request::ReorderLists { board_id, list_ids } => self
                .reorder_lists(actor, board_id, &list_ids)
                .await
                .map(Reply::Lists),
            Request::CreateTask { list_id, task } => self
                .create_task(actor, list_id, task)
                .await
                .map(Reply::Task),
            Request::UpdateTask { task_id, patch } => self
                .update_task(actor, task_id, patch)
                .await
                .map(Reply::Task),
            Request::DeleteTask { task_id } => {
                self.delete_task(actor, task_id).await.map(|()| Reply::Done)
            }
            Request::MoveTask {
                task_id,
                source_list_id,
                target_list_id,
                target_index,
            } => self
                .move_task(actor, task_id, source_list_id, target_list_id, target_index)
                .await
                .map(Reply::Task),
            Request::AssignTask { task_id, user_id } => self
                .assign_task(actor, task_id, user_id)
                .await
                .map(Reply::Task),
            Request::UnassignTask { task_id, user_id } => self
                .unassign_task(actor, task_id, &user_id)
                .await
                .map(Reply::Task),
            Request::AddComment { task_id, body } => self
                .add_comment(actor, task_id, &body)
                .await
                .map(Reply::Comment),
            Request::SearchTasks {
                board_id,
                query,
                priority,
                assignee,
                limit,
            } => {
                let filter = TaskFilter {
                    query,
                    priority,
                    assignee,
                };
                self.search_tasks(actor, board_id, &filter, limit)
                    .await
                    .map(Reply::Tasks)
            }
            Request::Subscribe { board_id } => {
                let connection_id = actor
                    .origin
                    .map(|o| o.connection_id)
                    .ok_or(ServiceError::Unauthenticated)?;
                self.subscribe(actor, connection_id, board_id)
                    .await
                    .map(Reply::Board)
            }
            Request::Unsubscribe { board_id } => {
                if let Some(origin) = actor.origin {
                    self.unsubscribe(origin.connection_id, board_id).await;
                }
                Ok(Reply::Done)
            }
            Request::Viewers { board_id } => {
                self.viewers(actor, board_id).await.map(Reply::Viewers)
            }
            Request::Activities { board_id, limit } => self
                .activities(actor, board_id, limit)
                .await
                .map(Reply::Activities),
        }
    }

    // -----------------------------------------------------------------------
    // Boards
    // -----------------------------------------------------------------------

    /// Creates a board owned by `actor` with the default lists.
    ///
    /// # Errors
    ///
    /// [`ServiceError::InvalidInput`] for an empty or oversized name or
    /// background.
    pub async fn create_board(
        &self,
        actor: &Actor,
        name: &str,
        background: Option<&str>,
    ) -> Result<BoardView, ServiceError> {
        let name = validate_name("board name", name)?;
        let background = background
            .map(validate_background)
            .transpose()?
            .unwrap_or_else(|| DEFAULT_BACKGROUND.to_string());

        let now = Utc::now();
        let board = Board {
            id: BoardId::new(),
            name,
            background,
            archived: false,
            owner_id: actor.user_id.clone(),
            created_at: now,
            updated_at: now,
        };
        let board_id = board.id;
        let mut tables = BoardTables::new(board);
        for (position, list_name) in (0u32..).zip(DEFAULT_LISTS) {
            let list = List {
                id: ListId::new(),
                board_id,
                name: list_name.to_string(),
                position,
                created_at: now,
                updated_at: now,
            };
            tables.lists.insert(list.id, list);
        }
        self.store.insert_board(tables);

        let guard = self.store.lock_board(board_id).await?;
        tracing::info!(board_id = %board_id, owner = %actor.user_id, "board created");
        let description = format!("created board \"{}\"", guard.tables().board.name);
        self.record(&guard, actor, description, None).await;
        Ok(guard.tables().view(guard.revision(), Vec::new()))
    }

    /// Boards `actor` belongs to, most recently updated first. Only
    /// archived boards are listed when `archived` is set, only live ones
    /// otherwise.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Busy`] if a board stays locked too long.
    pub async fn list_boards(
        &self,
        actor: &Actor,
        archived: bool,
        query: Option<&str>,
    ) -> Result<Vec<Board>, ServiceError> {
        let needle = query.map(str::trim).filter(|q| !q.is_empty()).map(str::to_lowercase);
        let mut boards = self.store.boards_of(&actor.user_id).await?;
        boards.retain(|board| {
            board.archived == archived
                && needle
                    .as_deref()
                    .is_none_or(|n| board.name.to_lowercase().contains(n))
        });
        Ok(boards)
    }

    /// Full board snapshot.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] or [`ServiceError::Forbidden`].
    pub async fn get_board(&self, actor: &Actor, board_id: BoardId) -> Result<BoardView, ServiceError> {
        let guard = self.store.lock_board(board_id).await?;
        require_member(guard.tables(), &actor.user_id)?;
        let viewers = self.registry.viewers(board_id).await;
        Ok(guard.tables().view(guard.revision(), viewers))
    }

    /// Renames, recolours, archives or restores a board. Archiving is
    /// owner-only.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`], [`ServiceError::Forbidden`] or
    /// [`ServiceError::InvalidInput`].
    pub async fn update_board(
        &self,
        actor: &Actor,
        board_id: BoardId,
        patch: BoardPatch,
    ) -> Result<Board, ServiceError> {
        let mut guard = self.store.lock_board(board_id).await?;
        require_member(guard.tables(), &actor.user_id)?;
        if patch.archived.is_some() {
            require_owner(guard.tables(), &actor.user_id)?;
        }

        let mut staged = guard.begin();
        let board = &mut staged.board;
        if let Some(name) = &patch.name {
            board.name = validate_name("board name", name)?;
        }
        if let Some(background) = &patch.background {
            board.background = validate_background(background)?;
        }
        let archive_change = patch.archived.filter(|archived| *archived != board.archived);
        if let Some(archived) = archive_change {
            board.archived = archived;
        }
        board.updated_at = Utc::now();
        let updated = board.clone();
        guard.commit(staged);

        self.emit(&guard, actor, BoardEvent::BoardUpdated(updated.clone()))
            .await;
        let description = match archive_change {
            Some(true) => "archived the board".to_string(),
            Some(false) => "restored the board".to_string(),
            None => format!("updated board \"{}\"", updated.name),
        };
        self.record(&guard, actor, description, None).await;
        Ok(updated)
    }

    /// Deletes a board and everything in it. Owner only.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] or [`ServiceError::Forbidden`].
    pub async fn delete_board(&self, actor: &Actor, board_id: BoardId) -> Result<(), ServiceError> {
        let guard = self.store.lock_board(board_id).await?;
        require_owner(guard.tables(), &actor.user_id)?;

        let revision = guard.delete();
        self.fanout
            .publish(EventEnvelope {
                board_id,
                revision,
                origin: actor.origin,
                event: BoardEvent::BoardDeleted { board_id },
            })
            .await;
        let dropped = self.registry.drop_board(board_id).await;
        self.activity.forget(board_id);
        tracing::info!(board_id = %board_id, subscribers = dropped, "board deleted");
        Ok(())
    }

    /// Adds `user_id` as a plain member. Owner only.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Forbidden`] for non-owners, [`ServiceError::Conflict`]
    /// if the user already belongs to the board.
    pub async fn add_member(
        &self,
        actor: &Actor,
        board_id: BoardId,
        user_id: UserId,
    ) -> Result<Member, ServiceError> {
        let mut guard = self.store.lock_board(board_id).await?;
        require_owner(guard.tables(), &actor.user_id)?;
        if guard.tables().is_member(&user_id) {
            return Err(ServiceError::conflict(format!(
                "{user_id} is already a member of this board"
            )));
        }

        let member = Member {
            user_id: user_id.clone(),
            role: MemberRole::Member,
            joined_at: Utc::now(),
        };
        let mut staged = guard.begin();
        staged.members.insert(user_id.clone(), member.clone());
        guard.commit(staged);

        self.emit(&guard, actor, BoardEvent::MemberJoined {
            member: member.clone(),
        })
        .await;
        self.record(&guard, actor, format!("added {user_id} to the board"), None)
            .await;
        Ok(member)
    }

    /// Removes a member, their assignments on this board and their
    /// subscriptions to it. Owner only; the owner cannot be removed.
    ///
    /// # Errors
    ///
    /// [`ServiceError::Forbidden`], [`ServiceError::InvalidTarget`] for the
    /// owner, [`ServiceError::NotFound`] for non-members.
    pub async fn remove_member(
        &self,
        actor: &Actor,
        board_id: BoardId,
        user_id: &UserId,
    ) -> Result<(), ServiceError> {
        let mut guard = self.store.lock_board(board_id).await?;
        require_owner(guard.tables(), &actor.user_id)?;
        if guard.tables().is_owner(user_id) {
            return Err(ServiceError::invalid_target(
                "the board owner cannot be removed",
            ));
        }
        if !guard.tables().is_member(user_id) {
            return Err(ServiceError::NotFound("member"));
        }

        let mut staged = guard.begin();
        staged.members.remove(user_id);
        let unassigned: Vec<TaskId> = staged
            .assignments
            .iter()
            .filter(|(_, user)| user == user_id)
            .map(|(task, _)| *task)
            .collect();
        staged.assignments.retain(|(_, user)| user != user_id);
        guard.commit(staged);

        self.emit(&guard, actor, BoardEvent::MemberLeft {
            user_id: user_id.clone(),
            unassigned,
        })
        .await;
        self.record(&guard, actor, format!("removed {user_id} from the board"), None)
            .await;

        let dropped = self.registry.unsubscribe_user(board_id, user_id).await;
        if !dropped.is_empty() {
            self.fanout
                .publish_presence(board_id, guard.revision())
                .await;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lists
    // -----------------------------------------------------------------------

    /// Appends a list to the board.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`], [`ServiceError::Forbidden`] or
    /// [`ServiceError::InvalidInput`].
    pub async fn create_list(
        &self,
        actor: &Actor,
        board_id: BoardId,
        name: &str,
    ) -> Result<ListView, ServiceError> {
        let mut guard = self.store.lock_board(board_id).await?;
        require_member(guard.tables(), &actor.user_id)?;
        let name = validate_name("list name", name)?;

        let mut staged = guard.begin();
        let position = ordering::reindex_for_insert(&mut staged.lists, board_id, u32::MAX);
        let now = Utc::now();
        let list = List {
            id: ListId::new(),
            board_id,
            name,
            position,
            created_at: now,
            updated_at: now,
        };
        let list_id = list.id;
        staged.lists.insert(list_id, list);
        guard.commit(staged);

        let view = list_view(&guard, list_id)?;
        self.emit(&guard, actor, BoardEvent::ListCreated(view.clone()))
            .await;
        self.record(&guard, actor, format!("added list \"{}\"", view.list.name), None)
            .await;
        Ok(view)
    }

    /// Renames a list in place.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`], [`ServiceError::Forbidden`] or
    /// [`ServiceError::InvalidInput`].
    pub async fn rename_list(
        &self,
        actor: &Actor,
        list_id: ListId,
        name: &str,
    ) -> Result<ListView, ServiceError> {
        let mut guard = self.lock_for_list(list_id).await?;
        require_member(guard.tables(), &actor.user_id)?;
        let name = validate_name("list name", name)?;

        let mut staged = guard.begin();
        let list = staged
            .lists
            .get_mut(&list_id)
            .ok_or(ServiceError::NotFound("list"))?;
        let previous = std::mem::replace(&mut list.name, name);
        list.updated_at = Utc::now();
        guard.commit(staged);

        let view = list_view(&guard, list_id)?;
        self.emit(&guard, actor, BoardEvent::ListUpdated(view.clone()))
            .await;
        let description = format!("renamed list \"{previous}\" to \"{}\"", view.list.name);
        self.record(&guard, actor, description, None).await;
        Ok(view)
    }

    /// Deletes a list with all its tasks.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] or [`ServiceError::Forbidden`].
    pub async fn delete_list(&self, actor: &Actor, list_id: ListId) -> Result<(), ServiceError> {
        let mut guard = self.lock_for_list(list_id).await?;
        require_member(guard.tables(), &actor.user_id)?;

        let mut staged = guard.begin();
        let board_id = staged.board.id;
        let list = staged
            .lists
            .remove(&list_id)
            .ok_or(ServiceError::NotFound("list"))?;
        let doomed: BTreeSet<TaskId> = staged
            .tasks
            .values()
            .filter(|task| task.list_id == list_id)
            .map(|task| task.id)
            .collect();
        staged.tasks.retain(|id, _| !doomed.contains(id));
        staged.assignments.retain(|(task, _)| !doomed.contains(task));
        staged.comments.retain(|task, _| !doomed.contains(task));
        ordering::reindex_for_removal(&mut staged.lists, board_id, list.position);
        guard.commit(staged);

        self.emit(&guard, actor, BoardEvent::ListDeleted { list_id })
            .await;
        self.record(&guard, actor, format!("deleted list \"{}\"", list.name), None)
            .await;
        tracing::debug!(list_id = %list_id, tasks = doomed.len(), "list deleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Appends a task to a list.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`], [`ServiceError::Forbidden`] or
    /// [`ServiceError::InvalidInput`] (bad title, assignee not a member).
    pub async fn create_task(
        &self,
        actor: &Actor,
        list_id: ListId,
        new: NewTask,
    ) -> Result<TaskView, ServiceError> {
        let mut guard = self.lock_for_list(list_id).await?;
        require_member(guard.tables(), &actor.user_id)?;
        let title = validate_title(&new.title)?;
        let assignees: BTreeSet<UserId> = new.assignees.into_iter().collect();
        if let Some(outsider) = assignees.iter().find(|u| !guard.tables().is_member(u)) {
            return Err(ServiceError::invalid_input(format!(
                "{outsider} is not a member of this board"
            )));
        }

        let mut staged = guard.begin();
        let position = ordering::reindex_for_insert(&mut staged.tasks, list_id, u32::MAX);
        let now = Utc::now();
        let task = Task {
            id: TaskId::new(),
            list_id,
            position,
            title,
            description: normalize_description(new.description),
            priority: new.priority,
            due_date: new.due_date,
            labels: new.labels,
            archived: false,
            created_at: now,
            updated_at: now,
        };
        let task_id = task.id;
        staged.tasks.insert(task_id, task);
        staged
            .assignments
            .extend(assignees.into_iter().map(|user| (task_id, user)));
        guard.commit(staged);

        let view = task_view(&guard, task_id)?;
        self.emit(&guard, actor, BoardEvent::TaskCreated(view.clone()))
            .await;
        let description = format!("created task \"{}\"", view.task.title);
        self.record(&guard, actor, description, Some(task_id)).await;
        Ok(view)
    }

    /// Edits task fields. Archiving takes the task out of its list's
    /// ordering; restoring appends it to the end of its list.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`], [`ServiceError::Forbidden`] or
    /// [`ServiceError::InvalidInput`].
    pub async fn update_task(
        &self,
        actor: &Actor,
        task_id: TaskId,
        patch: TaskPatch,
    ) -> Result<TaskView, ServiceError> {
        let mut guard = self.lock_for_task(task_id).await?;
        require_member(guard.tables(), &actor.user_id)?;
        let title = patch.title.as_deref().map(validate_title).transpose()?;

        let mut staged = guard.begin();
        let task = staged
            .tasks
            .get_mut(&task_id)
            .ok_or(ServiceError::NotFound("task"))?;
        if let Some(title) = title {
            task.title = title;
        }
        if let Some(description) = patch.description {
            task.description = normalize_description(description);
        }
        if let Some(priority) = patch.priority {
            task.priority = priority;
        }
        if let Some(due_date) = patch.due_date {
            task.due_date = due_date;
        }
        if let Some(labels) = patch.labels {
            task.labels = labels;
        }
        task.updated_at = Utc::now();
        let (list_id, position, was_archived) = (task.list_id, task.position, task.archived);

        let archive_change = patch.archived.filter(|archived| *archived != was_archived);
        match archive_change {
            Some(true) => {
                if let Some(task) = staged.tasks.get_mut(&task_id) {
                    task.archived = true;
                }
                ordering::reindex_for_removal(&mut staged.tasks, list_id, position);
            }
            Some(false) => {
                let position = ordering::reindex_for_insert(&mut staged.tasks, list_id, u32::MAX);
                if let Some(task) = staged.tasks.get_mut(&task_id) {
                    task.archived = false;
                    task.position = position;
                }
            }
            None => {}
        }
        guard.commit(staged);

        let view = task_view(&guard, task_id)?;
        self.emit(&guard, actor, BoardEvent::TaskUpdated(view.clone()))
            .await;
        let verb = match archive_change {
            Some(true) => "archived",
            Some(false) => "restored",
            None => "updated",
        };
        let description = format!("{verb} task \"{}\"", view.task.title);
        self.record(&guard, actor, description, Some(task_id)).await;
        Ok(view)
    }

    /// Deletes a task, closing the gap in its list.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] or [`ServiceError::Forbidden`].
    pub async fn delete_task(&self, actor: &Actor, task_id: TaskId) -> Result<(), ServiceError> {
        let mut guard = self.lock_for_task(task_id).await?;
        require_member(guard.tables(), &actor.user_id)?;

        let mut staged = guard.begin();
        let task = staged
            .remove_task(task_id)
            .ok_or(ServiceError::NotFound("task"))?;
        if task.is_live() {
            ordering::reindex_for_removal(&mut staged.tasks, task.list_id, task.position);
        }
        guard.commit(staged);

        self.emit(&guard, actor, BoardEvent::TaskDeleted {
            task_id,
            list_id: task.list_id,
        })
        .await;
        self.record(&guard, actor, format!("deleted task \"{}\"", task.title), None)
            .await;
        Ok(())
    }

    /// Assigns a board member to a task.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`], [`ServiceError::Forbidden`],
    /// [`ServiceError::InvalidInput`] if the assignee is not a member, or
    /// [`ServiceError::Conflict`] if already assigned.
    pub async fn assign_task(
        &self,
        actor: &Actor,
        task_id: TaskId,
        user_id: UserId,
    ) -> Result<TaskView, ServiceError> {
        let mut guard = self.lock_for_task(task_id).await?;
        require_member(guard.tables(), &actor.user_id)?;
        if !guard.tables().is_member(&user_id) {
            return Err(ServiceError::invalid_input(format!(
                "{user_id} is not a member of this board"
            )));
        }
        let pair = (task_id, user_id);
        if guard.tables().assignments.contains(&pair) {
            return Err(ServiceError::conflict(format!(
                "{} is already assigned to this task",
                pair.1
            )));
        }

        let mut staged = guard.begin();
        let user_id = pair.1.clone();
        staged.assignments.insert(pair);
        guard.commit(staged);

        let view = task_view(&guard, task_id)?;
        self.emit(&guard, actor, BoardEvent::TaskUpdated(view.clone()))
            .await;
        let description = format!("assigned {user_id} to \"{}\"", view.task.title);
        self.record(&guard, actor, description, Some(task_id)).await;
        Ok(view)
    }

    /// Removes an assignment.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] if the task or the assignment does not
    /// exist, [`ServiceError::Forbidden`] for non-members.
    pub async fn unassign_task(
        &self,
        actor: &Actor,
        task_id: TaskId,
        user_id: &UserId,
    ) -> Result<TaskView, ServiceError> {
        let mut guard = self.lock_for_task(task_id).await?;
        require_member(guard.tables(), &actor.user_id)?;

        let mut staged = guard.begin();
        if !staged.assignments.remove(&(task_id, user_id.clone())) {
            return Err(ServiceError::NotFound("assignment"));
        }
        guard.commit(staged);

        let view = task_view(&guard, task_id)?;
        self.emit(&guard, actor, BoardEvent::TaskUpdated(view.clone()))
            .await;
        let description = format!("unassigned {user_id} from \"{}\"", view.task.title);
        self.record(&guard, actor, description, Some(task_id)).await;
        Ok(view)
    }

    /// Leaves a comment on a task. Subscribers get the task back with its
    /// new comment count.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`], [`ServiceError::Forbidden`] or
    /// [`ServiceError::InvalidInput`] for an empty or oversized body.
    pub async fn add_comment(
        &self,
        actor: &Actor,
        task_id: TaskId,
        body: &str,
    ) -> Result<Comment, ServiceError> {
        let body = validate_comment(body)?;
        let mut guard = self.lock_for_task(task_id).await?;
        require_member(guard.tables(), &actor.user_id)?;

        let comment = Comment {
            id: CommentId::new(),
            task_id,
            user_id: actor.user_id.clone(),
            body,
            created_at: Utc::now(),
        };
        let mut staged = guard.begin();
        staged
            .comments
            .entry(task_id)
            .or_default()
            .push(comment.clone());
        guard.commit(staged);

        let view = task_view(&guard, task_id)?;
        self.emit(&guard, actor, BoardEvent::TaskUpdated(view.clone()))
            .await;
        let description = format!("commented on \"{}\"", view.task.title);
        self.record(&guard, actor, description, Some(task_id)).await;
        Ok(comment)
    }

    // -----------------------------------------------------------------------
    // Subscriptions and queries
    // -----------------------------------------------------------------------

    /// Subscribes a connection to a board and returns the snapshot its
    /// event stream continues from.
    ///
    /// The subscription and the snapshot are taken under the board lock, so
    /// the connection receives every event after the snapshot's revision
    /// and none before it.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] or [`ServiceError::Forbidden`].
    pub async fn subscribe(
        &self,
        actor: &Actor,
        connection_id: ConnectionId,
        board_id: BoardId,
    ) -> Result<BoardView, ServiceError> {
        let guard = self.store.lock_board(board_id).await?;
        require_member(guard.tables(), &actor.user_id)?;

        let previous = self.registry.subscribe(connection_id, board_id).await;
        self.fanout.publish_presence(board_id, guard.revision()).await;
        let viewers = self.registry.viewers(board_id).await;
        let view = guard.tables().view(guard.revision(), viewers);
        drop(guard);

        tracing::debug!(
            connection_id = %connection_id,
            board_id = %board_id,
            "connection subscribed"
        );
        if let Some(previous) = previous {
            self.publish_presence(previous).await;
        }
        Ok(view)
    }

    /// Stops a connection's event stream for a board. Unsubscribing from a
    /// board the connection is not watching does nothing.
    pub async fn unsubscribe(&self, connection_id: ConnectionId, board_id: BoardId) {
        if self.registry.unsubscribe(connection_id, board_id).await {
            self.publish_presence(board_id).await;
        }
    }

    /// Users currently viewing a board.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] or [`ServiceError::Forbidden`].
    pub async fn viewers(&self, actor: &Actor, board_id: BoardId) -> Result<Vec<UserId>, ServiceError> {
        if !self.store.is_board_member(&actor.user_id, board_id).await? {
            return Err(not_a_member());
        }
        Ok(self.registry.viewers(board_id).await)
    }

    /// Recent activity on a board, newest first.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] or [`ServiceError::Forbidden`].
    pub async fn activities(
        &self,
        actor: &Actor,
        board_id: BoardId,
        limit: Option<usize>,
    ) -> Result<Vec<Activity>, ServiceError> {
        if !self.store.is_board_member(&actor.user_id, board_id).await? {
            return Err(not_a_member());
        }
        Ok(self
            .activity
            .recent(board_id, limit.unwrap_or(DEFAULT_PAGE)))
    }

    /// Live tasks matching `filter` on one board, or on every board `actor`
    /// belongs to, most recently updated first.
    ///
    /// # Errors
    ///
    /// [`ServiceError::NotFound`] or [`ServiceError::Forbidden`] for an
    /// explicit board, [`ServiceError::Busy`] if a board stays locked.
    pub async fn search_tasks(
        &self,
        actor: &Actor,
        board_id: Option<BoardId>,
        filter: &TaskFilter,
        limit: Option<usize>,
    ) -> Result<Vec<TaskView>, ServiceError> {
        let boards = match board_id {
            Some(board_id) => vec![board_id],
            None => self
                .store
                .boards_of(&actor.user_id)
                .await?
                .into_iter()
                .map(|board| board.id)
                .collect(),
        };

        let mut found = Vec::new();
        for id in boards {
            let guard = match self.store.lock_board(id).await {
                Ok(guard) => guard,
                // Deleted since it was listed.
                Err(StoreError::BoardNotFound(_)) if board_id.is_none() => continue,
                Err(e) => return Err(e.into()),
            };
            if board_id.is_some() {
                require_member(guard.tables(), &actor.user_id)?;
            } else if !guard.tables().is_member(&actor.user_id) {
                continue;
            }
            let tables = guard.tables();
            found.extend(
                tables
                    .tasks
                    .values()
                    .filter(|task| task.is_live() && filter.matches(tables, task))
                    .filter_map(|task| tables.task_view(task.id)),
            );
        }
        found.sort_by(|a, b| {
            b.task
                .updated_at
                .cmp(&a.task.updated_at)
                .then(b.id().cmp(&a.id()))
        });
        found.truncate(limit.unwrap_or(DEFAULT_PAGE));
        Ok(found)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    pub(crate) async fn lock_for_task(&self, task_id: TaskId) -> Result<BoardGuard<'_>, ServiceError> {
        let board_id = self
            .store
            .board_of_task(task_id)
            .ok_or(ServiceError::NotFound("task"))?;
        let guard = self.store.lock_board(board_id).await?;
        if guard.tables().tasks.contains_key(&task_id) {
            Ok(guard)
        } else {
            Err(ServiceError::NotFound("task"))
        }
    }

    async fn lock_for_list(&self, list_id: ListId) -> Result<BoardGuard<'_>, ServiceError> {
        let board_id = self
            .store
            .board_of_list(list_id)
            .ok_or(ServiceError::NotFound("list"))?;
        let guard = self.store.lock_board(board_id).await?;
        if guard.tables().lists.contains_key(&list_id) {
            Ok(guard)
        } else {
            Err(ServiceError::NotFound("list"))
        }
    }

    /// Publishes an event stamped with the guard's current revision.
    pub(crate) async fn emit(&self, guard: &BoardGuard<'_>, actor: &Actor, event: BoardEvent) {
        self.fanout
            .publish(EventEnvelope {
                board_id: guard.board_id(),
                revision: guard.revision(),
                origin: actor.origin,
                event,
            })
            .await;
    }

    /// Records an activity entry and announces it. Sink failures are logged
    /// and dropped.
    pub(crate) async fn record(
        &self,
        guard: &BoardGuard<'_>,
        actor: &Actor,
        description: String,
        task_id: Option<TaskId>,
    ) {
        let entry = Activity {
            id: ActivityId::new(),
            board_id: guard.board_id(),
            user_id: actor.user_id.clone(),
            description,
            task_id,
            created_at: Utc::now(),
        };
        if let Err(e) = self.activity.record(entry.clone()) {
            tracing::warn!(board_id = %entry.board_id, error = %e, "failed to record activity");
            return;
        }
        self.fanout
            .publish(EventEnvelope {
                board_id: entry.board_id,
                revision: guard.revision(),
                origin: None,
                event: BoardEvent::ActivityRecorded(entry),
            })
            .await;
    }

    async fn publish_presence(&self, board_id: BoardId) {
        if let Some(revision) = self.store.revision(board_id) {
            self.fanout.publish_presence(board_id, revision).await;
        }
    }
}

/// Criteria for [`KanbanService::search_tasks`]. Unset fields match
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub query: Option<String>,
    pub priority: Option<Priority>,
    pub assignee: Option<UserId>,
}

impl TaskFilter {
    fn matches(&self, tables: &BoardTables, task: &Task) -> bool {
        if self.priority.is_some_and(|p| p != task.priority) {
            return false;
        }
        let assigned = |user: &UserId| tables.assignments.contains(&(task.id, user.clone()));
        if !self.assignee.as_ref().is_none_or(assigned) {
            return false;
        }
        let Some(needle) = self
            .query
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
        else {
            return true;
        };
        let needle = needle.to_lowercase();
        task.title.to_lowercase().contains(&needle)
            || task
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&needle))
    }
}

pub(crate) fn require_member(tables: &BoardTables, user: &UserId) -> Result<(), ServiceError> {
    if tables.is_member(user) {
        Ok(())
    } else {
        Err(not_a_member())
    }
}

fn require_owner(tables: &BoardTables, user: &UserId) -> Result<(), ServiceError> {
    if tables.is_owner(user) {
        Ok(())
    } else {
        Err(ServiceError::forbidden("only the board owner can do that"))
    }
}

fn not_a_member() -> ServiceError {
    ServiceError::forbidden("not a member of this board")
}

/// Re-reads a task that the current operation has already validated or
/// just written; its absence means the tables are inconsistent.
pub(crate) fn task_view(guard: &BoardGuard<'_>, task_id: TaskId) -> Result<TaskView, ServiceError> {
    guard.tables().task_view(task_id).ok_or_else(|| {
        tracing::error!(board_id = %guard.board_id(), task_id = %task_id, "task vanished under the board lock");
        ServiceError::internal(format!("task {task_id} vanished"))
    })
}

fn list_view(guard: &BoardGuard<'_>, list_id: ListId) -> Result<ListView, ServiceError> {
    guard.tables().list_view(list_id).ok_or_else(|| {
        tracing::error!(board_id = %guard.board_id(), list_id = %list_id, "list vanished under the board lock");
        ServiceError::internal(format!("list {list_id} vanished"))
    })
}

fn validate_title(title: &str) -> Result<String, ServiceError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ServiceError::invalid_input("task title must not be empty"));
    }
    if title.chars().count() > MAX_TASK_TITLE_LENGTH {
        return Err(ServiceError::invalid_input(format!(
            "task title longer than {MAX_TASK_TITLE_LENGTH} characters"
        )));
    }
    Ok(title.to_string())
}

fn validate_comment(body: &str) -> Result<String, ServiceError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(ServiceError::invalid_input("comment must not be empty"));
    }
    if body.chars().count() > MAX_COMMENT_LENGTH {
        return Err(ServiceError::invalid_input(format!(
            "comment longer than {MAX_COMMENT_LENGTH} characters"
        )));
    }
    Ok(body.to_string())
}

fn validate_name(what: &str, name: &str) -> Result<String, ServiceError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServiceError::invalid_input(format!("{what} must not be empty")));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(ServiceError::invalid_input(format!(
            "{what} longer than {MAX_NAME_LENGTH} characters"
        )));
    }
    Ok(name.to_string())
}

fn validate_background(background: &str) -> Result<String, ServiceError> {
    let background = background.trim();
    if background.is_empty() || background.len() > MAX_BACKGROUND_LENGTH {
        return Err(ServiceError::invalid_input("invalid board background"));
    }
    Ok(background.to_string())
}

fn normalize_description(description: Option<String>) -> Option<String> {
    description
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
}
