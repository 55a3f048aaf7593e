//! Allocation decisions as pure functions of a slot snapshot. The engine
//! turns their output into a single WAL event and applies it under the
//! slot's write lock; nothing here touches shared state.

use ulid::Ulid;

use crate::model::*;

/// Status and queue position a new booking gets on this slot.
pub fn decide_placement(slot: &SlotState, capacity: u32) -> (BookingStatus, Option<u32>) {
    if slot.confirmed_count() < capacity {
        (BookingStatus::Confirmed, None)
    } else {
        let next = slot.max_waitlist_position().map_or(1, |p| p + 1);
        (BookingStatus::Waitlist, Some(next))
    }
}

/// Waitlisted bookings in promotion order: position, then creation time, then id.
pub fn waitlist_order(slot: &SlotState) -> Vec<&Booking> {
    let mut queue: Vec<&Booking> = slot
        .bookings
        .iter()
        .filter(|b| b.status == BookingStatus::Waitlist)
        .collect();
    queue.sort_by_key(|b| (b.waitlist_position.unwrap_or(u32::MAX), b.created_at, b.id));
    queue
}

pub fn next_in_line(slot: &SlotState) -> Option<Ulid> {
    waitlist_order(slot).first().map(|b| b.id)
}

/// Position changes that make `queue` dense from 1. Unchanged entries are omitted.
pub fn plan_renumber<'a>(queue: impl IntoIterator<Item = &'a Booking>) -> Vec<(Ulid, u32)> {
    queue
        .into_iter()
        .zip(1u32..)
        .filter(|(b, pos)| b.waitlist_position != Some(*pos))
        .map(|(b, pos)| (b.id, pos))
        .collect()
}

/// Effects of one cancellation, persisted as a single record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CancellationPlan {
    pub promoted: Option<Ulid>,
    pub renumbered: Vec<(Ulid, u32)>,
}

/// Effects of cancelling `target`. Only a confirmed cancellation promotes,
/// and only while the slot then sits below `capacity`; a resource shrunk
/// under its confirmed count keeps the surplus until it drains.
pub fn plan_cancellation(slot: &SlotState, target: &Booking, capacity: u32) -> CancellationPlan {
    let mut queue: Vec<&Booking> = waitlist_order(slot)
        .into_iter()
        .filter(|b| b.id != target.id)
        .collect();
    let seat_freed = target.status == BookingStatus::Confirmed
        && slot.confirmed_count().saturating_sub(1) < capacity;
    let promoted = if seat_freed && !queue.is_empty() {
        Some(queue.remove(0).id)
    } else {
        None
    };
    CancellationPlan {
        promoted,
        renumbered: plan_renumber(queue),
    }
}
