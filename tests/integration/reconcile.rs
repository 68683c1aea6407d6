#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end tests for client reconciliation against a live server.
//!
//! Whatever path a change takes to a client (optimistic prediction, the
//! server's reply, another client's event, a reload after a gap) the
//! client's board must end up ordered exactly like the server's.

use std::sync::Arc;
use std::time::Duration;

use taskboard::optimistic::Resolution;
use taskboard::{Applied, BoardCache, BoardClient, Reconciler};
use taskboard_proto::error::ErrorKind;
use taskboard_proto::event::EventEnvelope;
use taskboard_proto::ids::{ListId, TaskId, UserId};
use taskboard_proto::model::{BoardView, NewTask};
use taskboard_server::activity::ActivityLog;
use taskboard_server::auth::StaticTokens;
use taskboard_server::store::Store;
use taskboard_server::{KanbanService, ServerState, start_server_with_state};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

async fn start() -> String {
    let auth = StaticTokens::new([("t-alice", "alice"), ("t-bob", "bob")]);
    let service = KanbanService::new(Store::new(), Arc::new(ActivityLog::new()), Arc::new(auth));
    let (addr, _handle) =
        start_server_with_state("127.0.0.1:0", Arc::new(ServerState::new(service)))
            .await
            .expect("failed to start board server");
    format!("ws://{addr}/ws")
}

/// A shared board with three tasks in the first list, both users
/// subscribed.
async fn shared_board(url: &str) -> (BoardClient, BoardClient, BoardView, Vec<TaskId>) {
    let alice = BoardClient::connect(url, "t-alice").await.unwrap();
    let bob = BoardClient::connect(url, "t-bob").await.unwrap();
    let view = alice.create_board("Reconcile").await.unwrap();
    alice
        .add_member(view.board.id, UserId::new("bob"))
        .await
        .unwrap();
    let mut tasks = Vec::new();
    for n in 0..3 {
        let task = alice
            .create_task(view.lists[0].id(), NewTask::titled(format!("task {n}")))
            .await
            .unwrap();
        tasks.push(task.id());
    }
    bob.subscribe(view.board.id).await.unwrap();
    let snapshot = alice.subscribe(view.board.id).await.unwrap();
    (alice, bob, snapshot, tasks)
}

/// Events up to and including the first state change at `revision`.
async fn events_through(client: &BoardClient, revision: u64) -> Vec<EventEnvelope> {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        let mut out = Vec::new();
        loop {
            let envelope = client.next_event().await.expect("connection closed");
            let done = envelope.event.is_state_change() && envelope.revision >= revision;
            out.push(envelope);
            if done {
                return out;
            }
        }
    })
    .await
    .expect("timed out waiting for events")
}

fn order(view: &BoardView) -> Vec<Vec<TaskId>> {
    view.lists
        .iter()
        .map(|l| l.tasks.iter().map(|t| t.id()).collect())
        .collect()
}

fn list(view: &BoardView, n: usize) -> ListId {
    view.lists[n].id()
}

#[tokio::test]
async fn optimistic_move_converges_with_server() {
    let url = start().await;
    let (alice, _bob, snapshot, tasks) = shared_board(&url).await;
    let mut rec = Reconciler::new(snapshot.clone(), alice.connection_id());

    let request_id = alice.allocate_request_id();
    let request = rec
        .begin_move(request_id, tasks[0], list(&snapshot, 1), 0)
        .unwrap();
    let predicted = order(rec.view());
    assert_eq!(predicted[1], vec![tasks[0]]);

    let outcome = alice.send(request_id, request).await.unwrap();
    for envelope in events_through(&alice, snapshot.revision + 1).await {
        rec.on_event(&envelope);
    }
    // The event usually lands first and settles the intent on its own.
    let resolution = rec.on_response(request_id, &outcome);
    assert!(matches!(resolution, None | Some(Resolution::Confirmed(_))));

    assert!(rec.pending().is_empty());
    assert_eq!(order(rec.view()), predicted);
    let server = alice.get_board(snapshot.board.id).await.unwrap();
    assert_eq!(order(rec.view()), order(&server));
    assert_eq!(rec.confirmed().revision(), server.revision);
}

#[tokio::test]
async fn rejected_move_reverts_then_catches_up() {
    let url = start().await;
    let (alice, bob, snapshot, tasks) = shared_board(&url).await;
    let mut rec = Reconciler::new(snapshot.clone(), alice.connection_id());

    // Bob gets there first.
    bob.move_task(tasks[1], list(&snapshot, 0), list(&snapshot, 2), 0)
        .await
        .unwrap();

    // Alice still sees the old board and moves the same task within Todo.
    let request_id = alice.allocate_request_id();
    let request = rec
        .begin_move(request_id, tasks[1], list(&snapshot, 0), 2)
        .unwrap();
    let outcome = alice.send(request_id, request).await.unwrap();

    let resolution = rec.on_response(request_id, &outcome);
    let Some(Resolution::Reverted(intent, err)) = resolution else {
        panic!("expected a revert, got {resolution:?}");
    };
    assert_eq!(intent.task_id, tasks[1]);
    assert_eq!(err.kind, ErrorKind::InvalidTarget);
    assert_eq!(order(rec.view()), order(&snapshot));

    for envelope in events_through(&alice, snapshot.revision + 1).await {
        rec.on_event(&envelope);
    }
    let server = alice.get_board(snapshot.board.id).await.unwrap();
    assert_eq!(order(rec.view()), order(&server));
    assert_eq!(order(rec.view())[2], vec![tasks[1]]);
}

#[tokio::test]
async fn foreign_moves_land_in_cache() {
    let url = start().await;
    let (alice, bob, snapshot, tasks) = shared_board(&url).await;
    let mut cache = BoardCache::from_snapshot(snapshot.clone());

    bob.move_task(tasks[2], list(&snapshot, 0), list(&snapshot, 0), 0)
        .await
        .unwrap();
    bob.move_task(tasks[0], list(&snapshot, 0), list(&snapshot, 1), 0)
        .await
        .unwrap();

    for envelope in events_through(&alice, snapshot.revision + 2).await {
        assert_ne!(cache.apply_event(&envelope), Applied::RefetchRequired);
    }
    let server = alice.get_board(snapshot.board.id).await.unwrap();
    assert_eq!(order(cache.view()), order(&server));
    assert_eq!(cache.task_order(list(&snapshot, 0)), vec![tasks[2], tasks[1]]);
}

#[tokio::test]
async fn missed_event_forces_reload() {
    let url = start().await;
    let (alice, bob, snapshot, _tasks) = shared_board(&url).await;
    let mut cache = BoardCache::from_snapshot(snapshot.clone());

    for title in ["one", "two"] {
        bob.create_task(list(&snapshot, 1), NewTask::titled(title))
            .await
            .unwrap();
    }
    let events = events_through(&alice, snapshot.revision + 2).await;
    let skipped = snapshot.revision + 1;

    let mut needs_reload = false;
    for envelope in events
        .iter()
        .filter(|e| !(e.event.is_state_change() && e.revision == skipped))
    {
        needs_reload |= cache.apply_event(envelope) == Applied::RefetchRequired;
    }
    assert!(needs_reload);
    assert_eq!(cache.revision(), snapshot.revision);

    cache = BoardCache::from_snapshot(alice.get_board(snapshot.board.id).await.unwrap());
    assert_eq!(cache.revision(), snapshot.revision + 2);
    assert_eq!(cache.task_order(list(&snapshot, 1)).len(), 2);
}
