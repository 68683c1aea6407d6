//! Connection registry: who is connected, as which user, watching which
//! board.
//!
//! Populated when a connection completes its hello, pruned on disconnect or
//! when a send to it fails. A connection watches at most one board at a
//! time; subscribing elsewhere leaves the previous board first.

use std::collections::{BTreeSet, HashMap, HashSet};

use taskboard_proto::ids::{BoardId, ConnectionId, UserId};
use taskboard_proto::wire::ServerMessage;
use tokio::sync::{RwLock, mpsc};

/// Sending half of a connection's outgoing frame queue.
pub type Outbox = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug)]
struct ConnectionEntry {
    user_id: UserId,
    sender: Outbox,
    board: Option<BoardId>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    boards: HashMap<BoardId, HashSet<ConnectionId>>,
}

impl RegistryInner {
    fn leave(&mut self, connection_id: ConnectionId, board_id: BoardId) {
        if let Some(members) = self.boards.get_mut(&board_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                self.boards.remove(&board_id);
            }
        }
    }
}

/// Registry of live connections and their board subscriptions.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: RwLock<RegistryInner>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an authenticated connection.
    pub async fn register(&self, connection_id: ConnectionId, user_id: UserId, sender: Outbox) {
        let mut inner = self.inner.write().await;
        inner.connections.insert(
            connection_id,
            ConnectionEntry {
                user_id,
                sender,
                board: None,
            },
        );
    }

    /// Removes a connection. Returns the board it was watching, if any.
    pub async fn unregister(&self, connection_id: ConnectionId) -> Option<BoardId> {
        let mut inner = self.inner.write().await;
        let entry = inner.connections.remove(&connection_id)?;
        let board_id = entry.board?;
        inner.leave(connection_id, board_id);
        Some(board_id)
    }

    /// Subscribes a connection to a board. Returns the board it left, if it
    /// was watching a different one.
    pub async fn subscribe(&self, connection_id: ConnectionId, board_id: BoardId) -> Option<BoardId> {
        let mut inner = self.inner.write().await;
        let entry = inner.connections.get_mut(&connection_id)?;
        let previous = entry.board.replace(board_id).filter(|prev| *prev != board_id);
        if let Some(prev) = previous {
            inner.leave(connection_id, prev);
        }
        inner.boards.entry(board_id).or_default().insert(connection_id);
        previous
    }

    /// Unsubscribes a connection from a board. Returns `false` if it was
    /// not watching that board.
    pub async fn unsubscribe(&self, connection_id: ConnectionId, board_id: BoardId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.connections.get_mut(&connection_id) else {
            return false;
        };
        if entry.board != Some(board_id) {
            return false;
        }
        entry.board = None;
        inner.leave(connection_id, board_id);
        true
    }

    /// Unsubscribes every connection of `user_id` from a board.
    pub async fn unsubscribe_user(&self, board_id: BoardId, user_id: &UserId) -> Vec<ConnectionId> {
        let mut inner = self.inner.write().await;
        let removed: Vec<ConnectionId> = inner
            .connections
            .iter_mut()
            .filter(|(_, entry)| entry.board == Some(board_id) && entry.user_id == *user_id)
            .map(|(id, entry)| {
                entry.board = None;
                *id
            })
            .collect();
        for id in &removed {
            inner.leave(*id, board_id);
        }
        removed
    }

    /// Unsubscribes every connection from a board.
    pub async fn drop_board(&self, board_id: BoardId) -> usize {
        let mut inner = self.inner.write().await;
        let Some(members) = inner.boards.remove(&board_id) else {
            return 0;
        };
        for id in &members {
            if let Some(entry) = inner.connections.get_mut(id) {
                entry.board = None;
            }
        }
        members.len()
    }

    /// Senders of every connection watching a board.
    pub async fn subscribers(&self, board_id: BoardId) -> Vec<(ConnectionId, Outbox)> {
        let inner = self.inner.read().await;
        inner
            .boards
            .get(&board_id)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|id| {
                        inner
                            .connections
                            .get(id)
                            .map(|entry| (*id, entry.sender.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Distinct users watching a board, sorted.
    pub async fn viewers(&self, board_id: BoardId) -> Vec<UserId> {
        let inner = self.inner.read().await;
        let users: BTreeSet<&UserId> = inner
            .boards
            .get(&board_id)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.connections.get(id))
            .map(|entry| &entry.user_id)
            .collect();
        users.into_iter().cloned().collect()
    }

    /// Board a connection is watching.
    pub async fn board_of(&self, connection_id: ConnectionId) -> Option<BoardId> {
        let inner = self.inner.read().await;
        inner.connections.get(&connection_id).and_then(|e| e.board)
    }

    /// Sender for a connection, if registered.
    pub async fn sender(&self, connection_id: ConnectionId) -> Option<Outbox> {
        let inner = self.inner.read().await;
        inner.connections.get(&connection_id).map(|e| e.sender.clone())
    }

    /// Number of registered connections.
    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Whether no connection is registered.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.connections.is_empty()
    }
}
