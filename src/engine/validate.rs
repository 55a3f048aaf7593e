use chrono::NaiveDate;

use crate::config::MAX_CONCURRENT_BOOKINGS_KEY;
use crate::limits::*;
use crate::model::Ms;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Calendar date in the server's local time zone.
pub(crate) fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

pub(crate) fn validate_date(date: NaiveDate, today: NaiveDate) -> Result<(), EngineError> {
    if date < today {
        return Err(EngineError::InvalidDate(date));
    }
    Ok(())
}

pub(crate) fn validate_slot(slot: u8) -> Result<(), EngineError> {
    if !(1..=SLOTS_PER_DAY).contains(&slot) {
        return Err(EngineError::InvalidSlot(slot));
    }
    Ok(())
}

pub(crate) fn validate_resource_fields(
    name: &str,
    description: Option<&str>,
    capacity: u32,
) -> Result<(), EngineError> {
    let name_len = name.trim().chars().count();
    if name_len == 0 || name_len > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("resource name must be 1-100 characters"));
    }
    if description.is_some_and(|d| d.chars().count() > MAX_DESCRIPTION_LEN) {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    if !(MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
        return Err(EngineError::LimitExceeded("capacity must be between 1 and 50"));
    }
    Ok(())
}

pub(crate) fn validate_setting(key: &str, value: u32) -> Result<(), EngineError> {
    if key.len() > MAX_SETTING_KEY_LEN || key != MAX_CONCURRENT_BOOKINGS_KEY {
        return Err(EngineError::UnknownSetting(key.to_string()));
    }
    if value < 1 {
        return Err(EngineError::LimitExceeded("max_concurrent_bookings must be at least 1"));
    }
    Ok(())
}
