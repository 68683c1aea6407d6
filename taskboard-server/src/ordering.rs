//! Ordering engine: dense integer positions for tasks within lists and
//! lists within boards.
//!
//! Every live row of a collection (all tasks of one list that are not
//! archived, all lists of one board) holds a distinct position in
//! `0..count`. The functions here are the only code that writes
//! `position`; each one keeps that invariant by shifting a contiguous range
//! of siblings by one ([`RangeShift`]) and then placing the entity.
//!
//! The engine works on the staged tables of a board transaction, so all
//! shifts of one operation become visible together or not at all.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use taskboard_proto::ids::{BoardId, ListId, TaskId};
use taskboard_proto::model::{List, Task};

/// Errors produced by ordering operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderingError {
    /// Target index outside `[0, count]`.
    #[error("position {index} out of range (0..={count})")]
    InvalidPosition {
        /// Index requested by the caller.
        index: i64,
        /// Number of live rows in the destination, excluding the mover.
        count: u32,
    },
    /// The entity to move is not in the collection.
    #[error("entity not found")]
    UnknownEntity,
    /// The entity is archived and therefore not part of any ordering.
    #[error("entity is archived")]
    NotLive,
    /// A requested order is not a permutation of the collection.
    #[error("order must name every row exactly once")]
    NotPermutation,
}

/// A row that occupies a position inside a parent collection.
pub trait Positioned {
    /// Row identifier.
    type Id: Copy + Eq + Hash;
    /// Identifier of the collection the row belongs to.
    type Parent: Copy + Eq;

    fn id(&self) -> Self::Id;
    fn parent(&self) -> Self::Parent;
    fn set_parent(&mut self, parent: Self::Parent);
    fn position(&self) -> u32;
    fn set_position(&mut self, position: u32);

    /// Whether the row takes part in its parent's ordering.
    fn is_live(&self) -> bool {
        true
    }
}

impl Positioned for Task {
    type Id = TaskId;
    type Parent = ListId;

    fn id(&self) -> TaskId {
        self.id
    }

    fn parent(&self) -> ListId {
        self.list_id
    }

    fn set_parent(&mut self, parent: ListId) {
        self.list_id = parent;
    }

    fn position(&self) -> u32 {
        self.position
    }

    fn set_position(&mut self, position: u32) {
        self.position = position;
    }

    fn is_live(&self) -> bool {
        !self.archived
    }
}

impl Positioned for List {
    type Id = ListId;
    type Parent = BoardId;

    fn id(&self) -> ListId {
        self.id
    }

    fn parent(&self) -> BoardId {
        self.board_id
    }

    fn set_parent(&mut self, parent: BoardId) {
        self.board_id = parent;
    }

    fn position(&self) -> u32 {
        self.position
    }

    fn set_position(&mut self, position: u32) {
        self.position = position;
    }
}

/// Rows keyed by id, as held in a board's tables.
pub type Rows<T> = HashMap<<T as Positioned>::Id, T>;

/// Direction of a [`RangeShift`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shift {
    /// `position += 1`
    Up,
    /// `position -= 1`
    Down,
}

/// One logical range update: every live row of `parent` whose position lies
/// in `from..=to` (or `from..` when `to` is `None`) moves by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeShift<P> {
    pub parent: P,
    pub from: u32,
    pub to: Option<u32>,
    pub shift: Shift,
}

impl<P: Copy + Eq> RangeShift<P> {
    /// Whether a row at `position` under `parent` falls inside the range.
    #[must_use]
    pub fn matches(&self, parent: P, position: u32) -> bool {
        parent == self.parent && position >= self.from && self.to.is_none_or(|to| position <= to)
    }

    /// Applies the shift to every matching live row. Returns the number of
    /// rows touched.
    pub fn apply<T>(&self, rows: &mut Rows<T>) -> usize
    where
        T: Positioned<Parent = P>,
    {
        let mut touched = 0;
        for row in rows.values_mut() {
            if row.is_live() && self.matches(row.parent(), row.position()) {
                let position = match self.shift {
                    Shift::Up => row.position() + 1,
                    Shift::Down => row.position().saturating_sub(1),
                };
                row.set_position(position);
                touched += 1;
            }
        }
        touched
    }
}

/// Where a moved row ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOutcome<P> {
    pub source_parent: P,
    pub source_position: u32,
    pub parent: P,
    pub position: u32,
    /// Number of sibling rows whose position changed.
    pub shifted: usize,
}

impl<P: Copy + Eq> MoveOutcome<P> {
    /// A same-collection move to the row's own index.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.source_parent == self.parent && self.source_position == self.position
    }
}

/// Number of live rows under `parent`.
#[must_use]
pub fn count<T: Positioned>(rows: &Rows<T>, parent: T::Parent) -> u32 {
    let n = rows
        .values()
        .filter(|row| row.is_live() && row.parent() == parent)
        .count();
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Number of live rows under `parent`, not counting `exclude`.
#[must_use]
pub fn count_excluding<T: Positioned>(rows: &Rows<T>, parent: T::Parent, exclude: T::Id) -> u32 {
    let n = rows
        .values()
        .filter(|row| row.is_live() && row.parent() == parent && row.id() != exclude)
        .count();
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Ids of the live rows under `parent`, in position order.
#[must_use]
pub fn ordered_ids<T: Positioned>(rows: &Rows<T>, parent: T::Parent) -> Vec<T::Id> {
    let mut live: Vec<(u32, T::Id)> = rows
        .values()
        .filter(|row| row.is_live() && row.parent() == parent)
        .map(|row| (row.position(), row.id()))
        .collect();
    live.sort_unstable_by_key(|(position, _)| *position);
    live.into_iter().map(|(_, id)| id).collect()
}

/// Whether the live rows under `parent` hold exactly `0..count`.
#[must_use]
pub fn is_dense<T: Positioned>(rows: &Rows<T>, parent: T::Parent) -> bool {
    let mut positions: Vec<u32> = rows
        .values()
        .filter(|row| row.is_live() && row.parent() == parent)
        .map(Positioned::position)
        .collect();
    positions.sort_unstable();
    positions
        .iter()
        .zip(0u32..)
        .all(|(position, expected)| *position == expected)
}

/// Checks a caller-supplied index against `[0, count]`.
///
/// # Errors
///
/// Returns [`OrderingError::InvalidPosition`] for negative indices and
/// indices past the end.
pub fn validate_index(index: i64, count: u32) -> Result<u32, OrderingError> {
    u32::try_from(index)
        .ok()
        .filter(|i| *i <= count)
        .ok_or(OrderingError::InvalidPosition { index, count })
}

/// Opens a slot at `target_index` under `parent` and returns the position
/// the inserted row must take.
///
/// The index is clamped to `[0, count]`; appending never shifts anything.
/// The row being inserted must not be live under `parent` yet.
pub fn reindex_for_insert<T: Positioned>(
    rows: &mut Rows<T>,
    parent: T::Parent,
    target_index: u32,
) -> u32 {
    let index = target_index.min(count(rows, parent));
    RangeShift {
        parent,
        from: index,
        to: None,
        shift: Shift::Up,
    }
    .apply(rows);
    index
}

/// Closes the gap left by a row leaving `source_position` under `parent`.
///
/// Call after the row has been removed, archived, or otherwise taken out
/// of the ordering; the row itself sits at `source_position` and is not
/// matched by the shift either way.
pub fn reindex_for_removal<T: Positioned>(
    rows: &mut Rows<T>,
    parent: T::Parent,
    source_position: u32,
) -> usize {
    RangeShift {
        parent,
        from: source_position + 1,
        to: None,
        shift: Shift::Down,
    }
    .apply(rows)
}

/// Shift plan for moving a row from `(source_parent, source_position)` to
/// `(target_parent, target_index)`.
#[must_use]
pub fn plan_move<P: Copy + Eq>(
    source_parent: P,
    source_position: u32,
    target_parent: P,
    target_index: u32,
) -> Vec<RangeShift<P>> {
    if source_parent != target_parent {
        return vec![
            RangeShift {
                parent: source_parent,
                from: source_position + 1,
                to: None,
                shift: Shift::Down,
            },
            RangeShift {
                parent: target_parent,
                from: target_index,
                to: None,
                shift: Shift::Up,
            },
        ];
    }
    match target_index.cmp(&source_position) {
        std::cmp::Ordering::Greater => vec![RangeShift {
            parent: source_parent,
            from: source_position + 1,
            to: Some(target_index),
            shift: Shift::Down,
        }],
        std::cmp::Ordering::Less => vec![RangeShift {
            parent: source_parent,
            from: target_index,
            to: Some(source_position - 1),
            shift: Shift::Up,
        }],
        std::cmp::Ordering::Equal => Vec::new(),
    }
}

/// Moves row `id` to `target_index` under `target_parent`.
///
/// The index is clamped to `[0, count]` of the destination, where count
/// excludes the moving row. Siblings are shifted first; the row is placed
/// last, so the plan's ranges never match the row itself.
///
/// # Errors
///
/// Returns [`OrderingError::UnknownEntity`] if `id` is not in `rows` and
/// [`OrderingError::NotLive`] if it is archived.
pub fn apply_move<T: Positioned>(
    rows: &mut Rows<T>,
    id: T::Id,
    target_parent: T::Parent,
    target_index: u32,
) -> Result<MoveOutcome<T::Parent>, OrderingError> {
    let row = rows.get(&id).ok_or(OrderingError::UnknownEntity)?;
    if !row.is_live() {
        return Err(OrderingError::NotLive);
    }
    let source_parent = row.parent();
    let source_position = row.position();
    let index = target_index.min(count_excluding(rows, target_parent, id));

    let shifted = plan_move(source_parent, source_position, target_parent, index)
        .iter()
        .map(|shift| shift.apply(rows))
        .sum();

    let row = rows.get_mut(&id).ok_or(OrderingError::UnknownEntity)?;
    row.set_parent(target_parent);
    row.set_position(index);

    Ok(MoveOutcome {
        source_parent,
        source_position,
        parent: target_parent,
        position: index,
        shifted,
    })
}

/// Assigns positions `0..n` under `parent` in the order given.
///
/// # Errors
///
/// Returns [`OrderingError::NotPermutation`] unless `order` names every
/// live row under `parent` exactly once.
pub fn reorder<T: Positioned>(
    rows: &mut Rows<T>,
    parent: T::Parent,
    order: &[T::Id],
) -> Result<(), OrderingError> {
    let live: HashSet<T::Id> = rows
        .values()
        .filter(|row| row.is_live() && row.parent() == parent)
        .map(Positioned::id)
        .collect();
    let requested: HashSet<T::Id> = order.iter().copied().collect();
    if requested.len() != order.len() || requested != live {
        return Err(OrderingError::NotPermutation);
    }
    for (position, id) in (0u32..).zip(order) {
        if let Some(row) = rows.get_mut(id) {
            row.set_position(position);
        }
    }
    Ok(())
}
