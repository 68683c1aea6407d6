//! Property tests for the JSON wire format.
//!
//! 1. Arbitrary text never panics the decoders.
//! 2. Move requests keep their signed target index, including out-of-range
//!    values the server is expected to reject.
//! 3. Task patches keep the absent / null / value distinction for nullable
//!    fields.

use proptest::prelude::*;
use taskboard_proto::ids::{ListId, RequestId, TaskId};
use taskboard_proto::model::{Priority, TaskPatch};
use taskboard_proto::wire::{self, ClientMessage, Request};
use uuid::Uuid;

fn arb_task_id() -> impl Strategy<Value = TaskId> {
    any::<u128>().prop_map(|n| TaskId::from_uuid(Uuid::from_u128(n)))
}

fn arb_list_id() -> impl Strategy<Value = ListId> {
    any::<u128>().prop_map(|n| ListId::from_uuid(Uuid::from_u128(n)))
}

fn arb_priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Medium),
        Just(Priority::High),
        Just(Priority::Urgent),
    ]
}

fn arb_task_patch() -> impl Strategy<Value = TaskPatch> {
    (
        proptest::option::of("[^\x00]{1,64}"),
        proptest::option::of(proptest::option::of("[^\x00]{0,64}")),
        proptest::option::of(arb_priority()),
        proptest::option::of(prop::collection::btree_set("[a-z]{1,8}", 0..4)),
        proptest::option::of(any::<bool>()),
    )
        .prop_map(|(title, description, priority, labels, archived)| TaskPatch {
            title,
            description,
            priority,
            due_date: None,
            labels,
            archived,
        })
}

proptest! {
    /// Arbitrary text is rejected with an error, never a panic.
    #[test]
    fn decode_arbitrary_text_never_panics(text in ".{0,512}") {
        let _ = wire::decode_client(&text);
        let _ = wire::decode_server(&text);
    }

    /// Move requests keep the exact signed index the client sent.
    #[test]
    fn move_request_keeps_signed_index(
        task_id in arb_task_id(),
        source in arb_list_id(),
        target in arb_list_id(),
        index in any::<i64>(),
        request_id in any::<u64>(),
    ) {
        let msg = ClientMessage::Request {
            request_id: RequestId(request_id),
            request: Request::MoveTask {
                task_id,
                source_list_id: source,
                target_list_id: target,
                target_index: index,
            },
        };
        let text = wire::encode_client(&msg).expect("encode should succeed");
        let decoded = wire::decode_client(&text).expect("decode should succeed");
        prop_assert_eq!(decoded, msg);
    }

    /// Clearing a field (`Some(None)`) survives the wire and is not confused
    /// with leaving it alone (`None`).
    #[test]
    fn task_patch_keeps_clear_vs_absent(patch in arb_task_patch()) {
        let text = serde_json::to_string(&patch).expect("encode should succeed");
        let decoded: TaskPatch = serde_json::from_str(&text).expect("decode should succeed");
        prop_assert_eq!(decoded.description, patch.description);
        prop_assert_eq!(decoded.title, patch.title);
        prop_assert_eq!(decoded.archived, patch.archived);
    }
}
