#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Property tests for list ordering under arbitrary operation sequences.
//!
//! A reference model (plain `Vec`s of task ids per list) is driven alongside
//! the service. After every operation:
//! 1. Each list's live tasks have positions exactly `0..n`.
//! 2. The order matches the model, so moves land at the requested index.
//! 3. Rejected operations leave the board untouched.

use std::collections::HashMap;

use proptest::prelude::*;
use taskboard_proto::error::ErrorKind;
use taskboard_proto::ids::{BoardId, ListId, TaskId};
use taskboard_proto::model::{NewTask, TaskPatch};
use taskboard_server::{Actor, KanbanService};

const LISTS: usize = 3;

#[derive(Debug, Clone)]
enum Op {
    Create { list: usize },
    Move { task: usize, list: usize, index: i64 },
    Archive { task: usize },
    Restore { task: usize },
    Delete { task: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..LISTS).prop_map(|list| Op::Create { list }),
        6 => (any::<usize>(), 0..LISTS, -2i64..8).prop_map(|(task, list, index)| Op::Move {
            task,
            list,
            index,
        }),
        1 => any::<usize>().prop_map(|task| Op::Archive { task }),
        1 => any::<usize>().prop_map(|task| Op::Restore { task }),
        1 => any::<usize>().prop_map(|task| Op::Delete { task }),
    ]
}

/// Where a task lives in the reference model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Live,
    Archived(usize),
    Deleted,
}

struct Model {
    lists: Vec<Vec<TaskId>>,
    slots: HashMap<TaskId, Slot>,
    created: Vec<TaskId>,
}

impl Model {
    fn locate(&self, task: TaskId) -> Option<(usize, usize)> {
        self.lists.iter().enumerate().find_map(|(l, tasks)| {
            tasks.iter().position(|t| *t == task).map(|i| (l, i))
        })
    }

    fn pick(&self, n: usize) -> Option<TaskId> {
        if self.created.is_empty() {
            None
        } else {
            Some(self.created[n % self.created.len()])
        }
    }
}

fn alice() -> Actor {
    Actor::new("alice")
}

async fn check(
    service: &KanbanService,
    board_id: BoardId,
    model: &Model,
) -> Result<(), TestCaseError> {
    let view = service.get_board(&alice(), board_id).await.unwrap();
    for (l, list) in view.lists.iter().enumerate() {
        let ids: Vec<TaskId> = list.tasks.iter().map(|t| t.id()).collect();
        prop_assert_eq!(&ids, &model.lists[l]);
        for (expected, task) in (0u32..).zip(&list.tasks) {
            prop_assert_eq!(task.task.position, expected);
        }
    }
    Ok(())
}

async fn run(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let service = KanbanService::default();
    let view = service.create_board(&alice(), "Props", None).await.unwrap();
    let board_id = view.board.id;
    let list_ids: Vec<ListId> = view.lists.iter().map(|l| l.id()).collect();
    let mut model = Model {
        lists: vec![Vec::new(); LISTS],
        slots: HashMap::new(),
        created: Vec::new(),
    };

    for op in ops {
        match op {
            Op::Create { list } => {
                let task = service
                    .create_task(&alice(), list_ids[list], NewTask::titled("t"))
                    .await
                    .unwrap();
                prop_assert_eq!(task.task.position as usize, model.lists[list].len());
                model.lists[list].push(task.id());
                model.slots.insert(task.id(), Slot::Live);
                model.created.push(task.id());
            }
            Op::Move { task, list, index } => {
                let Some(task) = model.pick(task) else { continue };
                let source = model.locate(task);
                let source_list = source.map_or(list_ids[0], |(l, _)| list_ids[l]);
                let result = service
                    .move_task(&alice(), task, source_list, list_ids[list], index)
                    .await;

                match source {
                    None => {
                        prop_assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
                    }
                    Some((from, at)) => {
                        let count = model.lists[list].len() - usize::from(from == list);
                        let valid = usize::try_from(index).is_ok_and(|i| i <= count);
                        if valid {
                            let moved = result.unwrap();
                            prop_assert_eq!(i64::from(moved.task.position), index);
                            model.lists[from].remove(at);
                            model.lists[list].insert(usize::try_from(index).unwrap(), task);
                        } else {
                            prop_assert_eq!(
                                result.unwrap_err().kind(),
                                ErrorKind::InvalidPosition
                            );
                        }
                    }
                }
            }
            Op::Archive { task } => {
                let Some(task) = model.pick(task) else { continue };
                let patch = TaskPatch {
                    archived: Some(true),
                    ..TaskPatch::default()
                };
                let result = service.update_task(&alice(), task, patch).await;
                match model.slots[&task] {
                    Slot::Deleted => {
                        prop_assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
                    }
                    Slot::Archived(_) => prop_assert!(result.is_ok()),
                    Slot::Live => {
                        prop_assert!(result.is_ok());
                        let (l, at) = model.locate(task).unwrap();
                        model.lists[l].remove(at);
                        model.slots.insert(task, Slot::Archived(l));
                    }
                }
            }
            Op::Restore { task } => {
                let Some(task) = model.pick(task) else { continue };
                let patch = TaskPatch {
                    archived: Some(false),
                    ..TaskPatch::default()
                };
                let result = service.update_task(&alice(), task, patch).await;
                match model.slots[&task] {
                    Slot::Deleted => {
                        prop_assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
                    }
                    Slot::Live => prop_assert!(result.is_ok()),
                    Slot::Archived(l) => {
                        let restored = result.unwrap();
                        prop_assert_eq!(restored.task.position as usize, model.lists[l].len());
                        model.lists[l].push(task);
                        model.slots.insert(task, Slot::Live);
                    }
                }
            }
            Op::Delete { task } => {
                let Some(task) = model.pick(task) else { continue };
                let result = service.delete_task(&alice(), task).await;
                match model.slots[&task] {
                    Slot::Deleted => {
                        prop_assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
                    }
                    Slot::Archived(_) => prop_assert!(result.is_ok()),
                    Slot::Live => {
                        prop_assert!(result.is_ok());
                        let (l, at) = model.locate(task).unwrap();
                        model.lists[l].remove(at);
                    }
                }
                model.slots.insert(task, Slot::Deleted);
            }
        }
        check(&service, board_id, &model).await?;
    }
    Ok(())
}

async fn run_reorder(order: Vec<usize>) -> Result<(), TestCaseError> {
    let service = KanbanService::default();
    let view = service.create_board(&alice(), "Reorder", None).await.unwrap();
    for n in 0..order.len().saturating_sub(LISTS) {
        service
            .create_list(&alice(), view.board.id, &format!("extra {n}"))
            .await
            .unwrap();
    }
    let view = service.get_board(&alice(), view.board.id).await.unwrap();
    let wanted: Vec<ListId> = order.iter().map(|i| view.lists[*i].id()).collect();

    let lists = service
        .reorder_lists(&alice(), view.board.id, &wanted)
        .await
        .unwrap();
    let got: Vec<ListId> = lists.iter().map(|l| l.id()).collect();
    prop_assert_eq!(got, wanted);
    for (expected, list) in (0u32..).zip(&lists) {
        prop_assert_eq!(list.list.position, expected);
    }
    Ok(())
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn lists_stay_dense_and_match_model(ops in prop::collection::vec(arb_op(), 1..60)) {
        runtime().block_on(run(ops))?;
    }

    #[test]
    fn reorder_lists_applies_any_permutation(
        order in (3usize..8).prop_flat_map(|n| Just((0..n).collect::<Vec<_>>()).prop_shuffle())
    ) {
        runtime().block_on(run_reorder(order))?;
    }
}
