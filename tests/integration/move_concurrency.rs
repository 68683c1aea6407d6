#![allow(clippy::unwrap_used, clippy::expect_used, clippy::cast_possible_wrap)]

//! Integration tests for concurrent task moves.
//!
//! Many tasks moved at once from many workers must leave every list dense,
//! keep every task exactly once, and produce one `task:move` event per
//! successful move with strictly consecutive revisions.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use taskboard_proto::error::ErrorKind;
use taskboard_proto::event::BoardEvent;
use taskboard_proto::ids::{ConnectionId, ListId, TaskId, UserId};
use taskboard_proto::model::{BoardView, NewTask};
use taskboard_proto::wire::ServerMessage;
use taskboard_server::activity::ActivityLog;
use taskboard_server::auth::StaticTokens;
use taskboard_server::store::Store;
use taskboard_server::{Actor, KanbanService, ServiceError};
use tokio::sync::mpsc;

fn alice() -> Actor {
    Actor::new("alice")
}

async fn seeded(service: &KanbanService, per_list: usize) -> (BoardView, Vec<TaskId>) {
    let view = service.create_board(&alice(), "Race", None).await.unwrap();
    let mut tasks = Vec::new();
    for list in &view.lists {
        for n in 0..per_list {
            let task = service
                .create_task(&alice(), list.id(), NewTask::titled(format!("{} {n}", list.list.name)))
                .await
                .unwrap();
            tasks.push(task.id());
        }
    }
    (view, tasks)
}

async fn assert_dense(service: &KanbanService, view: &BoardView, expected_total: usize) {
    let snapshot = service.get_board(&alice(), view.board.id).await.unwrap();
    let mut seen = HashSet::new();
    for list in &snapshot.lists {
        for (position, task) in (0u32..).zip(&list.tasks) {
            assert_eq!(task.task.position, position, "gap or duplicate in {}", list.list.name);
            assert_eq!(task.task.list_id, list.id());
            assert!(seen.insert(task.id()), "task listed twice");
        }
    }
    assert_eq!(seen.len(), expected_total);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_moves_keep_lists_dense() {
    let service = Arc::new(KanbanService::default());
    let (view, tasks) = seeded(&service, 6).await;
    let lists: Vec<ListId> = view.lists.iter().map(|l| l.id()).collect();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = ConnectionId::new();
    service.attach(watcher, UserId::new("alice"), tx).await;
    let snapshot = service.subscribe(&alice(), watcher, view.board.id).await.unwrap();

    let mut handles = Vec::new();
    for worker in 0..8usize {
        let service = Arc::clone(&service);
        let tasks = tasks.clone();
        let lists = lists.clone();
        handles.push(tokio::spawn(async move {
            let mut ok = 0usize;
            for round in 0..20usize {
                let task = tasks[(worker * 7 + round * 3) % tasks.len()];
                let target = lists[(worker + round) % lists.len()];
                let index = ((worker + round) % 4) as i64;

                // Read the task's current list so most moves pass the source
                // check; a concurrent move may still invalidate it.
                let current = service
                    .get_board(&alice(), service.store().board_of_task(task).unwrap())
                    .await
                    .unwrap()
                    .lists
                    .iter()
                    .find(|l| l.tasks.iter().any(|t| t.id() == task))
                    .map(|l| l.id())
                    .unwrap();

                match service.move_task(&alice(), task, current, target, index).await {
                    Ok(_) => ok += 1,
                    Err(e) => assert!(
                        matches!(
                            e.kind(),
                            ErrorKind::InvalidTarget | ErrorKind::InvalidPosition
                        ),
                        "unexpected error {e:?}"
                    ),
                }
            }
            ok
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        succeeded += handle.await.unwrap();
    }
    assert!(succeeded > 0);
    assert_dense(&service, &view, tasks.len()).await;

    let mut moves = 0;
    let mut last_revision = snapshot.revision;
    while let Ok(message) = rx.try_recv() {
        let ServerMessage::Event(envelope) = message else {
            continue;
        };
        if let BoardEvent::TaskMoved(_) = envelope.event {
            moves += 1;
            // No-op moves are announced at the unchanged revision.
            assert!(envelope.revision >= last_revision);
            last_revision = envelope.revision;
        }
    }
    assert_eq!(moves, succeeded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn state_change_revisions_are_consecutive() {
    let service = Arc::new(KanbanService::default());
    let (view, tasks) = seeded(&service, 4).await;
    let todo = view.lists[0].id();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = ConnectionId::new();
    service.attach(watcher, UserId::new("alice"), tx).await;
    let snapshot = service.subscribe(&alice(), watcher, view.board.id).await.unwrap();

    let mut handles = Vec::new();
    for n in 0..16usize {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            service
                .create_task(&alice(), todo, NewTask::titled(format!("burst {n}")))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut revisions = Vec::new();
    while let Ok(ServerMessage::Event(envelope)) = rx.try_recv() {
        if envelope.event.is_state_change() {
            revisions.push(envelope.revision);
        }
    }
    let expected: Vec<u64> = (1..=16).map(|n| snapshot.revision + n).collect();
    assert_eq!(revisions, expected);
    assert_dense(&service, &view, tasks.len() + 16).await;
}

#[tokio::test]
async fn racing_moves_of_same_task_one_wins() {
    let service = Arc::new(KanbanService::default());
    let (view, tasks) = seeded(&service, 2).await;
    let (todo, doing, done) = (view.lists[0].id(), view.lists[1].id(), view.lists[2].id());
    let task = tasks[0];

    let a = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.move_task(&alice(), task, todo, doing, 0).await })
    };
    let b = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.move_task(&alice(), task, todo, done, 0).await })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1);
    let loser = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(loser.kind(), ErrorKind::InvalidTarget);
    assert_dense(&service, &view, tasks.len()).await;
}

#[tokio::test]
async fn held_board_lock_reports_busy() {
    let service = KanbanService::new(
        Store::with_lock_timeout(Duration::from_millis(50)),
        Arc::new(ActivityLog::new()),
        Arc::new(StaticTokens::default()),
    );
    let (view, tasks) = seeded(&service, 2).await;
    let todo = view.lists[0].id();
    let other = service.create_board(&alice(), "Elsewhere", None).await.unwrap();

    let guard = service.store().lock_board(view.board.id).await.unwrap();

    let err = service
        .move_task(&alice(), tasks[0], todo, todo, 1)
        .await
        .unwrap_err();
    assert_eq!(err, ServiceError::Busy(view.board.id));
    assert!(err.kind().is_retryable());

    // Other boards are unaffected.
    service
        .create_task(&alice(), other.lists[0].id(), NewTask::titled("free"))
        .await
        .unwrap();

    drop(guard);
    service
        .move_task(&alice(), tasks[0], todo, todo, 1)
        .await
        .unwrap();
}
