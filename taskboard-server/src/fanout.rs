//! Best-effort delivery of board events to subscribed connections.

use std::sync::Arc;

use taskboard_proto::event::{BoardEvent, EventEnvelope};
use taskboard_proto::ids::BoardId;
use taskboard_proto::wire::ServerMessage;

use crate::registry::ConnectionRegistry;

/// Publishes events to every connection subscribed to a board.
///
/// A connection whose outbox is closed is pruned from the registry; the
/// failure never reaches the publisher.
#[derive(Debug, Clone)]
pub struct Fanout {
    registry: Arc<ConnectionRegistry>,
}

impl Fanout {
    #[must_use]
    pub const fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Delivers `envelope` to the board's subscribers. Returns how many
    /// connections accepted it.
    ///
    /// Connections found closed are pruned, and the remaining subscribers
    /// are sent the board's new viewer set.
    pub async fn publish(&self, envelope: EventEnvelope) -> usize {
        let board_id = envelope.board_id;
        let revision = envelope.revision;
        let (delivered, mut pruned) = self.deliver(envelope).await;

        // A presence update can itself find more closed connections.
        while pruned > 0 {
            let viewers = self.registry.viewers(board_id).await;
            tracing::debug!(board_id = %board_id, pruned, "viewers left with their connections");
            (_, pruned) = self
                .deliver(EventEnvelope {
                    board_id,
                    revision,
                    origin: None,
                    event: BoardEvent::PresenceChanged { viewers },
                })
                .await;
        }
        delivered
    }

    /// Sends to every subscriber once. Returns `(delivered, pruned)`.
    async fn deliver(&self, envelope: EventEnvelope) -> (usize, usize) {
        let board_id = envelope.board_id;
        let subscribers = self.registry.subscribers(board_id).await;
        let event = envelope.event.name();
        let message = ServerMessage::Event(envelope);

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (connection_id, sender) in subscribers {
            if sender.send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(connection_id);
            }
        }

        for connection_id in &dead {
            tracing::debug!(
                board_id = %board_id,
                connection_id = %connection_id,
                "pruning closed connection"
            );
            self.registry.unregister(*connection_id).await;
        }

        tracing::trace!(board_id = %board_id, event, delivered, "event published");
        (delivered, dead.len())
    }

    /// Pushes the board's current viewer set.
    pub async fn publish_presence(&self, board_id: BoardId, revision: u64) -> usize {
        let viewers = self.registry.viewers(board_id).await;
        self.publish(EventEnvelope {
            board_id,
            revision,
            origin: None,
            event: BoardEvent::PresenceChanged { viewers },
        })
        .await
    }
}
