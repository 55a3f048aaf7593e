use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Only used for creation timestamps.
pub type Ms = i64;

/// The (resource, date, slot) triple every allocation decision is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub slot: u8,
}

impl SlotKey {
    pub fn new(resource_id: Ulid, date: NaiveDate, slot: u8) -> Self {
        Self { resource_id, date, slot }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.resource_id, self.date, self.slot)
    }
}

/// A user's view of one time window across all resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserWindow {
    pub user_id: Ulid,
    pub date: NaiveDate,
    pub slot: u8,
}

/// Human-readable time range of a slot number, `None` outside `1..=8`.
pub fn slot_label(slot: u8) -> Option<&'static str> {
    match slot {
        1 => Some("08:00-10:00"),
        2 => Some("10:00-12:00"),
        3 => Some("12:00-14:00"),
        4 => Some("14:00-16:00"),
        5 => Some("16:00-18:00"),
        6 => Some("18:00-20:00"),
        7 => Some("20:00-22:00"),
        8 => Some("22:00-24:00"),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Waitlist,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Waitlist => "waitlist",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub slot: u8,
    pub status: BookingStatus,
    /// Set iff `status == Waitlist`.
    pub waitlist_position: Option<u32>,
    pub created_at: Ms,
}

impl Booking {
    pub fn key(&self) -> SlotKey {
        SlotKey::new(self.resource_id, self.date, self.slot)
    }

    pub fn window(&self) -> UserWindow {
        UserWindow {
            user_id: self.user_id,
            date: self.date,
            slot: self.slot,
        }
    }

    /// Confirmed or waitlisted.
    pub fn is_active(&self) -> bool {
        self.status != BookingStatus::Cancelled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
    pub description: Option<String>,
    pub capacity: u32,
    pub active: bool,
}

/// Who is asking for a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requester {
    User(Ulid),
    /// Administrative actor allowed to cancel any booking.
    Privileged,
}

/// Every booking ever made for one key, cancelled history included.
#[derive(Debug, Clone)]
pub struct SlotState {
    pub key: SlotKey,
    /// Insertion order, which is creation order.
    pub bookings: Vec<Booking>,
    /// Bumped on every applied mutation; conditional commits compare against it.
    pub version: u64,
}

impl SlotState {
    pub fn new(key: SlotKey) -> Self {
        Self {
            key,
            bookings: Vec::new(),
            version: 0,
        }
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn confirmed_count(&self) -> u32 {
        self.bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Confirmed)
            .count() as u32
    }

    pub fn waitlist_count(&self) -> u32 {
        self.bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Waitlist)
            .count() as u32
    }

    pub fn max_waitlist_position(&self) -> Option<u32> {
        self.bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Waitlist)
            .filter_map(|b| b.waitlist_position)
            .max()
    }

    /// The user's non-cancelled booking on this key, if any.
    pub fn active_for_user(&self, user_id: Ulid) -> Option<&Booking> {
        self.bookings
            .iter()
            .find(|b| b.user_id == user_id && b.is_active())
    }
}

/// WAL record format. One record per committed operation, so a cancellation
/// together with its promotion and renumbering replays all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceUpserted {
        id: Ulid,
        name: String,
        description: Option<String>,
        capacity: u32,
    },
    ResourceDeactivated {
        id: Ulid,
    },
    SettingChanged {
        key: String,
        value: u32,
    },
    BookingPlaced {
        booking: Booking,
    },
    BookingCancelled {
        id: Ulid,
        key: SlotKey,
        promoted: Option<Ulid>,
        renumbered: Vec<(Ulid, u32)>,
    },
    WaitlistRenumbered {
        key: SlotKey,
        renumbered: Vec<(Ulid, u32)>,
    },
}

impl Event {
    /// The slot a booking event mutates; `None` for directory and settings events.
    pub fn slot_key(&self) -> Option<SlotKey> {
        match self {
            Event::BookingPlaced { booking } => Some(booking.key()),
            Event::BookingCancelled { key, .. } | Event::WaitlistRenumbered { key, .. } => {
                Some(*key)
            }
            Event::ResourceUpserted { .. }
            | Event::ResourceDeactivated { .. }
            | Event::SettingChanged { .. } => None,
        }
    }
}

// ── Operation and query result types ────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub user_id: Ulid,
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub slot: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome {
    pub booking: Booking,
    pub message: String,
}

impl CreateOutcome {
    pub fn new(booking: Booking) -> Self {
        let message = match booking.waitlist_position {
            Some(pos) if booking.status == BookingStatus::Waitlist => {
                format!("Added to waitlist at position {pos}")
            }
            _ => "Booking confirmed successfully!".to_string(),
        };
        Self { booking, message }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelOutcome {
    pub cancelled: Booking,
    pub promoted: Option<Booking>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAvailability {
    pub key: SlotKey,
    pub capacity: u32,
    pub confirmed: u32,
    pub waitlisted: u32,
    pub available_spots: u32,
    /// A new booking right now would be confirmed.
    pub is_available: bool,
    pub user_booking: Option<Booking>,
    /// `None` when no user was given.
    pub can_book_more: Option<bool>,
}

/// One (date, slot) cell of a resource's schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSlot {
    pub availability: SlotAvailability,
    /// Confirmed first, then the queue in order.
    pub bookings: Vec<Booking>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStats {
    pub resource_id: Ulid,
    pub total: u32,
    pub confirmed: u32,
    pub waitlisted: u32,
}
