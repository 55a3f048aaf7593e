use crate::limits::MAX_WRITE_ATTEMPTS_CEILING;

/// Settings key holding the per-window concurrent booking limit.
pub const MAX_CONCURRENT_BOOKINGS_KEY: &str = "max_concurrent_bookings";

/// Fallback for the `max_concurrent_bookings` setting when no value was ever stored.
pub const DEFAULT_MAX_CONCURRENT_BOOKINGS: u32 = 3;
pub const DEFAULT_MAX_WRITE_ATTEMPTS: u32 = 3;

/// Allocator knobs fixed at engine construction.
///
/// The stored `max_concurrent_bookings` setting always wins over
/// `default_max_concurrent`; the default only fills the gap when the
/// setting has never been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    pub default_max_concurrent: u32,
    /// Attempts per mutation before a write conflict is reported as transient.
    pub max_write_attempts: u32,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent: DEFAULT_MAX_CONCURRENT_BOOKINGS,
            max_write_attempts: DEFAULT_MAX_WRITE_ATTEMPTS,
        }
    }
}

impl AllocatorConfig {
    /// Read `SLOTBOOK_DEFAULT_MAX_CONCURRENT` and `SLOTBOOK_MAX_WRITE_ATTEMPTS`.
    /// Unparseable or zero values fall back to the defaults.
    pub fn from_env() -> Self {
        let default_max_concurrent = std::env::var("SLOTBOOK_DEFAULT_MAX_CONCURRENT")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|v| *v >= 1)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_BOOKINGS);
        let max_write_attempts = std::env::var("SLOTBOOK_MAX_WRITE_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|v| *v >= 1)
            .map(|v| v.min(MAX_WRITE_ATTEMPTS_CEILING))
            .unwrap_or(DEFAULT_MAX_WRITE_ATTEMPTS);
        Self {
            default_max_concurrent,
            max_write_attempts,
        }
    }
}
