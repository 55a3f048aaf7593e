//! Hard limits enforced by the engine and the tenant manager.

pub const MIN_CAPACITY: u32 = 1;
pub const MAX_CAPACITY: u32 = 50;

/// Slots are numbered `1..=SLOTS_PER_DAY`.
pub const SLOTS_PER_DAY: u8 = 8;

pub const MAX_NAME_LEN: usize = 100;
pub const MAX_DESCRIPTION_LEN: usize = 500;
pub const MAX_SETTING_KEY_LEN: usize = 64;

pub const MAX_RESOURCES_PER_TENANT: usize = 10_000;
/// Bookings retained per (resource, date, slot), cancelled history included.
pub const MAX_BOOKINGS_PER_SLOT: usize = 10_000;

/// Widest date range a schedule query may span, in days.
pub const MAX_SCHEDULE_DAYS: u64 = 62;

pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;

/// Upper bound accepted for `SLOTBOOK_MAX_WRITE_ATTEMPTS`.
pub const MAX_WRITE_ATTEMPTS_CEILING: u32 = 10;
