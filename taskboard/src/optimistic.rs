//! Optimistic task moves reconciled against the server's event stream.
//!
//! The reconciler keeps the last confirmed board ([`BoardCache`]) and the
//! moves this client has sent but not yet seen resolved. What the user sees
//! is the confirmed board with the pending moves replayed on top through the
//! shared [`relocate`] reducer, so:
//!
//! - a local move shows up immediately;
//! - the server's event for it lands the same state, and the intent is
//!   dropped;
//! - a rejected move disappears, leaving the confirmed board plus whatever
//!   other intents are still in flight;
//! - moves by other clients flow into the confirmed board and pending
//!   intents are replayed over them.

use taskboard_proto::error::ErrorBody;
use taskboard_proto::event::EventEnvelope;
use taskboard_proto::ids::{ConnectionId, ListId, RequestId, TaskId};
use taskboard_proto::model::{BoardView, TaskView};
use taskboard_proto::wire::{Outcome, Reply, Request};

use crate::cache::{Applied, BoardCache, CacheError, locate, relocate};

/// A move sent to the server and not yet resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMove {
    pub request_id: RequestId,
    pub task_id: TaskId,
    pub source_list_id: ListId,
    pub target_list_id: ListId,
    pub target_index: i64,
}

/// How a pending move ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The server accepted the move.
    Confirmed(PendingMove),
    /// The server rejected the move; it has been rolled back.
    Reverted(PendingMove, ErrorBody),
}

/// Confirmed board state plus in-flight local moves.
#[derive(Debug, Clone)]
pub struct Reconciler {
    connection_id: ConnectionId,
    confirmed: BoardCache,
    pending: Vec<PendingMove>,
    view: BoardView,
}

impl Reconciler {
    /// Starts from a snapshot, recognising events caused by
    /// `connection_id` as this client's own.
    #[must_use]
    pub fn new(snapshot: BoardView, connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            view: snapshot.clone(),
            confirmed: BoardCache::from_snapshot(snapshot),
            pending: Vec::new(),
        }
    }

    /// What to display: confirmed state with pending moves applied.
    #[must_use]
    pub const fn view(&self) -> &BoardView {
        &self.view
    }

    /// Last state confirmed by the server.
    #[must_use]
    pub const fn confirmed(&self) -> &BoardCache {
        &self.confirmed
    }

    #[must_use]
    pub fn pending(&self) -> &[PendingMove] {
        &self.pending
    }

    /// Predicts a move locally and returns the request to send.
    ///
    /// The move is validated against the current view; an impossible move
    /// is refused without touching anything.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the task or list is unknown or the index is
    /// out of range.
    pub fn begin_move(
        &mut self,
        request_id: RequestId,
        task_id: TaskId,
        target_list_id: ListId,
        target_index: i64,
    ) -> Result<Request, CacheError> {
        let (l, _) = locate(&self.view.lists, task_id).ok_or(CacheError::UnknownTask(task_id))?;
        let source_list_id = self.view.lists[l].id();
        relocate(
            &mut self.view.lists,
            task_id,
            target_list_id,
            target_index,
            None,
        )?;

        self.pending.push(PendingMove {
            request_id,
            task_id,
            source_list_id,
            target_list_id,
            target_index,
        });
        tracing::debug!(
            request_id = %request_id,
            task_id = %task_id,
            pending = self.pending.len(),
            "move predicted"
        );
        Ok(Request::MoveTask {
            task_id,
            source_list_id,
            target_list_id,
            target_index,
        })
    }

    /// Handles the server's answer to one of this client's requests.
    /// Returns `None` if the request was not a pending move, or if its
    /// event already resolved it.
    pub fn on_response(&mut self, request_id: RequestId, outcome: &Outcome) -> Option<Resolution> {
        let at = self.pending.iter().position(|p| p.request_id == request_id)?;
        let intent = self.pending.remove(at);

        let resolution = match outcome {
            Outcome::Ok(reply) => {
                if let Reply::Task(task) = reply {
                    self.adopt(task);
                }
                Resolution::Confirmed(intent)
            }
            Outcome::Error(err) => {
                tracing::debug!(
                    request_id = %request_id,
                    kind = %err.kind,
                    "move rejected, reverting"
                );
                Resolution::Reverted(intent, err.clone())
            }
        };
        self.rebuild();
        Some(resolution)
    }

    /// Folds one event into the confirmed state and replays pending moves.
    pub fn on_event(&mut self, envelope: &EventEnvelope) -> Applied {
        // The event for one of our own moves settles it regardless of
        // whether its revision is news to the cache: a no-op move is
        // announced at the unchanged revision.
        if let Some(origin) = envelope.origin
            && origin.connection_id == self.connection_id
        {
            self.pending.retain(|p| p.request_id != origin.request_id);
        }

        let applied = self.confirmed.apply_event(envelope);
        self.rebuild();
        applied
    }

    /// Replaces the confirmed state with a fresh snapshot, keeping pending
    /// moves.
    pub fn reload(&mut self, snapshot: BoardView) {
        self.confirmed = BoardCache::from_snapshot(snapshot);
        self.rebuild();
    }

    fn adopt(&mut self, task: &TaskView) {
        if let Err(e) = self.confirmed.adopt_task(task) {
            tracing::debug!(task_id = %task.id(), error = %e, "could not adopt canonical task");
        }
    }

    fn rebuild(&mut self) {
        let mut view = self.confirmed.view().clone();
        for intent in &self.pending {
            if let Err(e) = relocate(
                &mut view.lists,
                intent.task_id,
                intent.target_list_id,
                intent.target_index,
                None,
            ) {
                tracing::debug!(
                    request_id = %intent.request_id,
                    error = %e,
                    "pending move no longer applies"
                );
            }
        }
        self.view = view;
    }
}
