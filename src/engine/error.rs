use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::SlotKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Resource missing or soft-deleted.
    ResourceUnavailable(Ulid),
    InvalidDate(NaiveDate),
    InvalidSlot(u8),
    /// Carries the configured limit for display.
    ConcurrentLimitExceeded(u32),
    DuplicateBooking,
    NotFound(Ulid),
    Unauthorized(Ulid),
    AlreadyCancelled(Ulid),
    AlreadyExists(Ulid),
    NameTaken(String),
    UnknownSetting(String),
    LimitExceeded(&'static str),
    /// The slot moved under a conditional commit. Retried by the engine, never returned.
    WriteConflict(SlotKey),
    /// Store failure or exhausted retries; safe to retry the whole request.
    Transient(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::ResourceUnavailable(id) => {
                write!(f, "resource {id} not found or inactive")
            }
            EngineError::InvalidDate(date) => write!(f, "cannot book for past date {date}"),
            EngineError::InvalidSlot(slot) => {
                write!(f, "slot number must be between 1 and 8, got {slot}")
            }
            EngineError::ConcurrentLimitExceeded(limit) => write!(
                f,
                "you can only book {limit} different resources for the same time slot"
            ),
            EngineError::DuplicateBooking => {
                write!(f, "you already have a booking for this time slot")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Unauthorized(id) => write!(f, "unauthorized to cancel booking {id}"),
            EngineError::AlreadyCancelled(id) => write!(f, "booking {id} is already cancelled"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NameTaken(name) => {
                write!(f, "resource with name '{name}' already exists")
            }
            EngineError::UnknownSetting(key) => write!(f, "unknown setting: {key}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WriteConflict(key) => write!(f, "write conflict on slot {key}"),
            EngineError::Transient(e) => write!(f, "transient failure: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
