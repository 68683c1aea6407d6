#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Integration tests for live board fan-out over real WebSocket connections.
//!
//! Every subscriber of a board must see every change in revision order,
//! subscribers of other boards must see none of it, and presence must follow
//! connections as they subscribe and disconnect.

use std::sync::Arc;
use std::time::Duration;

use taskboard::{BoardClient, ClientError};
use taskboard_proto::error::ErrorKind;
use taskboard_proto::event::{BoardEvent, EventEnvelope};
use taskboard_proto::ids::UserId;
use taskboard_proto::model::NewTask;
use taskboard_server::activity::ActivityLog;
use taskboard_server::auth::StaticTokens;
use taskboard_server::store::Store;
use taskboard_server::{KanbanService, ServerState, start_server_with_state};

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

async fn start() -> String {
    let auth = StaticTokens::new([("t-alice", "alice"), ("t-bob", "bob"), ("t-carol", "carol")]);
    let service = KanbanService::new(Store::new(), Arc::new(ActivityLog::new()), Arc::new(auth));
    let (addr, _handle) =
        start_server_with_state("127.0.0.1:0", Arc::new(ServerState::new(service)))
            .await
            .expect("failed to start board server");
    format!("ws://{addr}/ws")
}

/// Next event matching `pred`, skipping the rest.
async fn next_where(
    client: &BoardClient,
    pred: impl Fn(&EventEnvelope) -> bool,
) -> EventEnvelope {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            let envelope = client.next_event().await.expect("connection closed");
            if pred(&envelope) {
                return envelope;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn next_state_change(client: &BoardClient) -> EventEnvelope {
    next_where(client, |e| e.event.is_state_change()).await
}

async fn next_presence(client: &BoardClient) -> Vec<UserId> {
    let envelope = next_where(client, |e| {
        matches!(e.event, BoardEvent::PresenceChanged { .. })
    })
    .await;
    let BoardEvent::PresenceChanged { viewers } = envelope.event else {
        unreachable!()
    };
    viewers
}

fn users(names: &[&str]) -> Vec<UserId> {
    names.iter().map(|n| UserId::new(*n)).collect()
}

#[tokio::test]
async fn every_subscriber_sees_every_change_in_order() {
    let url = start().await;
    let alice = BoardClient::connect(&url, "t-alice").await.unwrap();
    let bob = BoardClient::connect(&url, "t-bob").await.unwrap();

    let view = alice.create_board("Shared").await.unwrap();
    alice
        .add_member(view.board.id, UserId::new("bob"))
        .await
        .unwrap();
    let a_snap = alice.subscribe(view.board.id).await.unwrap();
    let b_snap = bob.subscribe(view.board.id).await.unwrap();
    assert_eq!(a_snap.revision, b_snap.revision);

    let todo = view.lists[0].id();
    let doing = view.lists[1].id();
    let first = alice
        .create_task(todo, NewTask::titled("write tests"))
        .await
        .unwrap();
    let second = bob
        .create_task(todo, NewTask::titled("review tests"))
        .await
        .unwrap();
    alice
        .move_task(second.id(), todo, doing, 0)
        .await
        .unwrap();

    for client in [&alice, &bob] {
        let mut revisions = Vec::new();
        let mut names = Vec::new();
        for _ in 0..3 {
            let envelope = next_state_change(client).await;
            assert_eq!(envelope.board_id, view.board.id);
            revisions.push(envelope.revision);
            names.push(envelope.event.name());
        }
        assert_eq!(
            revisions,
            vec![a_snap.revision + 1, a_snap.revision + 2, a_snap.revision + 3]
        );
        assert_eq!(names, vec!["task:create", "task:create", "task:move"]);
    }

    let board = bob.get_board(view.board.id).await.unwrap();
    assert_eq!(board.lists[0].tasks[0].id(), first.id());
    assert_eq!(board.lists[1].tasks[0].id(), second.id());
}

#[tokio::test]
async fn own_events_carry_origin() {
    let url = start().await;
    let alice = BoardClient::connect(&url, "t-alice").await.unwrap();
    let view = alice.create_board("Origins").await.unwrap();
    alice.subscribe(view.board.id).await.unwrap();

    let request_id = alice.allocate_request_id();
    alice
        .send(
            request_id,
            taskboard_proto::wire::Request::CreateTask {
                list_id: view.lists[0].id(),
                task: NewTask::titled("traced"),
            },
        )
        .await
        .unwrap();

    let envelope = next_state_change(&alice).await;
    let origin = envelope.origin.expect("own event without origin");
    assert_eq!(origin.connection_id, alice.connection_id());
    assert_eq!(origin.request_id, request_id);

    // The activity entry that follows is informational and has no origin.
    let activity = next_where(&alice, |e| {
        matches!(e.event, BoardEvent::ActivityRecorded(_))
    })
    .await;
    assert!(activity.origin.is_none());
}

#[tokio::test]
async fn other_boards_receive_nothing() {
    let url = start().await;
    let alice = BoardClient::connect(&url, "t-alice").await.unwrap();
    let carol = BoardClient::connect(&url, "t-carol").await.unwrap();

    let shared = alice.create_board("Alice's").await.unwrap();
    let private = carol.create_board("Carol's").await.unwrap();
    alice.subscribe(shared.board.id).await.unwrap();
    carol.subscribe(private.board.id).await.unwrap();

    alice
        .create_task(shared.lists[0].id(), NewTask::titled("not for carol"))
        .await
        .unwrap();
    carol
        .create_task(private.lists[0].id(), NewTask::titled("carol's own"))
        .await
        .unwrap();

    let envelope = next_state_change(&carol).await;
    assert_eq!(envelope.board_id, private.board.id);
    let BoardEvent::TaskCreated(task) = envelope.event else {
        panic!("expected task:create, got {}", envelope.event.name());
    };
    assert_eq!(task.task.title, "carol's own");
}

#[tokio::test]
async fn non_member_cannot_subscribe() {
    let url = start().await;
    let alice = BoardClient::connect(&url, "t-alice").await.unwrap();
    let carol = BoardClient::connect(&url, "t-carol").await.unwrap();
    let view = alice.create_board("Private").await.unwrap();

    let err = carol.subscribe(view.board.id).await.unwrap_err();
    assert!(matches!(err, ClientError::Request(body) if body.kind == ErrorKind::Forbidden));
}

#[tokio::test]
async fn presence_follows_subscribe_and_disconnect() {
    let url = start().await;
    let alice = BoardClient::connect(&url, "t-alice").await.unwrap();
    let view = alice.create_board("Presence").await.unwrap();
    alice
        .add_member(view.board.id, UserId::new("bob"))
        .await
        .unwrap();

    alice.subscribe(view.board.id).await.unwrap();
    assert_eq!(next_presence(&alice).await, users(&["alice"]));

    let bob = BoardClient::connect(&url, "t-bob").await.unwrap();
    let snapshot = bob.subscribe(view.board.id).await.unwrap();
    assert_eq!(snapshot.viewers, users(&["alice", "bob"]));
    assert_eq!(next_presence(&alice).await, users(&["alice", "bob"]));

    bob.close().await;
    drop(bob);
    assert_eq!(next_presence(&alice).await, users(&["alice"]));
}

#[tokio::test]
async fn removed_member_stops_receiving() {
    let url = start().await;
    let alice = BoardClient::connect(&url, "t-alice").await.unwrap();
    let bob = BoardClient::connect(&url, "t-bob").await.unwrap();
    let view = alice.create_board("Shrinking").await.unwrap();
    alice
        .add_member(view.board.id, UserId::new("bob"))
        .await
        .unwrap();
    bob.subscribe(view.board.id).await.unwrap();

    alice
        .request(taskboard_proto::wire::Request::RemoveMember {
            board_id: view.board.id,
            user_id: UserId::new("bob"),
        })
        .await
        .unwrap();
    let left = next_state_change(&bob).await;
    assert_eq!(left.event.name(), "member:leave");

    alice
        .create_task(view.lists[0].id(), NewTask::titled("after bob left"))
        .await
        .unwrap();
    let quiet = tokio::time::timeout(Duration::from_millis(200), async {
        loop {
            let envelope = bob.next_event().await?;
            if envelope.event.is_state_change() {
                return Some(envelope);
            }
        }
    })
    .await;
    assert!(quiet.is_err(), "removed member still received {quiet:?}");
}

#[tokio::test]
async fn bad_token_is_rejected() {
    let url = start().await;
    let err = BoardClient::connect(&url, "t-mallory").await.err().unwrap();
    assert!(matches!(err, ClientError::Rejected(body) if body.kind == ErrorKind::Unauthenticated));
}

#[tokio::test]
async fn comments_reach_other_viewers() {
    let url = start().await;
    let alice = BoardClient::connect(&url, "t-alice").await.unwrap();
    let bob = BoardClient::connect(&url, "t-bob").await.unwrap();
    let view = alice.create_board("Discussed").await.unwrap();
    alice
        .add_member(view.board.id, UserId::new("bob"))
        .await
        .unwrap();
    let task = alice
        .create_task(view.lists[0].id(), NewTask::titled("needs review"))
        .await
        .unwrap();
    bob.subscribe(view.board.id).await.unwrap();

    let listed = bob.list_boards(Some("discuss")).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, view.board.id);

    let comment = alice.add_comment(task.id(), "looks fine").await.unwrap();
    assert_eq!(comment.user_id, UserId::new("alice"));

    let envelope = next_state_change(&bob).await;
    let BoardEvent::TaskUpdated(updated) = envelope.event else {
        panic!("expected task:update, got {}", envelope.event.name());
    };
    assert_eq!(updated.id(), task.id());
    assert_eq!(updated.comment_count, 1);
}
