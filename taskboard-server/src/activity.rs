//! Board activity history.
//!
//! Recording is fire-and-forget: the service logs a failed write and moves
//! on, so a broken sink never fails the mutation that produced the entry.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use taskboard_proto::ids::BoardId;
use taskboard_proto::model::Activity;

/// Default number of entries kept per board before FIFO eviction.
pub const DEFAULT_HISTORY: usize = 200;

/// Number of entries returned when a query gives no limit.
pub const DEFAULT_PAGE: usize = 50;

/// Errors an activity sink may report.
#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    /// The sink cannot accept writes right now.
    #[error("activity sink unavailable: {0}")]
    Unavailable(String),
}

/// Destination for activity entries.
pub trait ActivitySink: Send + Sync {
    /// Stores one entry.
    ///
    /// # Errors
    ///
    /// Returns [`ActivityError`] if the entry could not be stored.
    fn record(&self, entry: Activity) -> Result<(), ActivityError>;

    /// Most recent entries of a board, newest first.
    fn recent(&self, board_id: BoardId, limit: usize) -> Vec<Activity>;

    /// Discards a deleted board's history.
    fn forget(&self, board_id: BoardId);
}

/// In-memory per-board history with FIFO eviction.
pub struct ActivityLog {
    entries: RwLock<HashMap<BoardId, VecDeque<Activity>>>,
    max_per_board: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityLog {
    /// Creates an empty log keeping [`DEFAULT_HISTORY`] entries per board.
    #[must_use]
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    /// Creates an empty log with a custom per-board cap.
    #[must_use]
    pub fn with_history(max_per_board: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_per_board,
        }
    }

    /// Number of entries held for a board.
    #[must_use]
    pub fn len(&self, board_id: BoardId) -> usize {
        self.entries.read().get(&board_id).map_or(0, VecDeque::len)
    }
}

impl ActivitySink for ActivityLog {
    fn record(&self, entry: Activity) -> Result<(), ActivityError> {
        let mut entries = self.entries.write();
        let queue = entries.entry(entry.board_id).or_default();
        queue.push_back(entry);
        while queue.len() > self.max_per_board {
            queue.pop_front();
        }
        drop(entries);
        Ok(())
    }

    fn recent(&self, board_id: BoardId, limit: usize) -> Vec<Activity> {
        self.entries
            .read()
            .get(&board_id)
            .map(|queue| queue.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    fn forget(&self, board_id: BoardId) {
        self.entries.write().remove(&board_id);
    }
}
