use std::collections::BTreeMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::config::MAX_CONCURRENT_BOOKINGS_KEY;
use crate::limits::{MAX_SCHEDULE_DAYS, SLOTS_PER_DAY};
use crate::model::*;

use super::validate::{today, validate_slot};
use super::{Engine, EngineError};

impl Engine {
    /// Active resources sorted by name.
    pub fn list_resources(&self) -> Vec<Resource> {
        let mut resources: Vec<Resource> = self
            .store
            .resources()
            .into_iter()
            .filter(|r| r.active)
            .collect();
        resources.sort_by(|a, b| {
            a.name
                .to_lowercase()
                .cmp(&b.name.to_lowercase())
                .then(a.id.cmp(&b.id))
        });
        resources
    }

    /// Includes deactivated resources.
    pub fn resource(&self, id: &Ulid) -> Option<Resource> {
        self.store.resource(id)
    }

    pub async fn booking(&self, id: &Ulid) -> Option<Booking> {
        let key = self.store.booking_key(id)?;
        let slot = self.store.slot(&key)?;
        let guard = slot.read().await;
        guard.get(*id).cloned()
    }

    /// The user's non-cancelled bookings ordered by (date, slot). Past dates
    /// are skipped unless `include_past`.
    pub async fn user_bookings(&self, user_id: Ulid, include_past: bool) -> Vec<Booking> {
        let today = today();
        let mut held = self.store.user_active(user_id);
        held.retain(|(key, _)| include_past || key.date >= today);
        held.sort_by_key(|(key, _)| (key.date, key.slot, key.resource_id));

        let mut out = Vec::with_capacity(held.len());
        for (key, id) in held {
            let Some(slot) = self.store.slot(&key) else {
                continue;
            };
            let guard = slot.read().await;
            if let Some(b) = guard.get(id).filter(|b| b.is_active()) {
                out.push(b.clone());
            }
        }
        out
    }

    /// Non-cancelled bookings on one key: confirmed first, then the queue in order.
    pub async fn slot_bookings(&self, key: &SlotKey) -> Vec<Booking> {
        let Some(slot) = self.store.slot(key) else {
            return Vec::new();
        };
        let guard = slot.read().await;
        ordered_active(&guard)
    }

    pub async fn slot_availability(
        &self,
        key: &SlotKey,
        user_id: Option<Ulid>,
    ) -> Result<SlotAvailability, EngineError> {
        validate_slot(key.slot)?;
        let resource = self
            .store
            .resource(&key.resource_id)
            .filter(|r| r.active)
            .ok_or(EngineError::ResourceUnavailable(key.resource_id))?;

        Ok(match self.store.slot(key) {
            Some(slot) => {
                let guard = slot.read().await;
                self.availability(*key, resource.capacity, Some(&*guard), user_id)
            }
            None => self.availability(*key, resource.capacity, None, user_id),
        })
    }

    /// Every slot of every day in `from..=to` for one resource, empty slots
    /// included. Deactivated resources still report their history.
    pub async fn resource_schedule(
        &self,
        resource_id: Ulid,
        from: NaiveDate,
        to: NaiveDate,
        user_id: Option<Ulid>,
    ) -> Result<Vec<ScheduleSlot>, EngineError> {
        let resource = self
            .store
            .resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        if from > to {
            return Ok(Vec::new());
        }
        if (to - from).num_days() >= MAX_SCHEDULE_DAYS as i64 {
            return Err(EngineError::LimitExceeded("schedule range too long"));
        }

        let mut schedule = Vec::new();
        for date in from.iter_days().take_while(|d| *d <= to) {
            for slot_no in 1..=SLOTS_PER_DAY {
                let key = SlotKey::new(resource_id, date, slot_no);
                let cell = match self.store.slot(&key) {
                    Some(slot) => {
                        let guard = slot.read().await;
                        ScheduleSlot {
                            availability: self.availability(
                                key,
                                resource.capacity,
                                Some(&*guard),
                                user_id,
                            ),
                            bookings: ordered_active(&guard),
                        }
                    }
                    None => ScheduleSlot {
                        availability: self.availability(key, resource.capacity, None, user_id),
                        bookings: Vec::new(),
                    },
                };
                schedule.push(cell);
            }
        }
        Ok(schedule)
    }

    fn availability(
        &self,
        key: SlotKey,
        capacity: u32,
        state: Option<&SlotState>,
        user_id: Option<Ulid>,
    ) -> SlotAvailability {
        let (confirmed, waitlisted, user_booking) = match state {
            Some(state) => (
                state.confirmed_count(),
                state.waitlist_count(),
                user_id.and_then(|u| state.active_for_user(u).cloned()),
            ),
            None => (0, 0, None),
        };
        let can_book_more = user_id.map(|u| {
            let window = UserWindow {
                user_id: u,
                date: key.date,
                slot: key.slot,
            };
            self.store.window_count(&window) < self.max_concurrent_bookings() as usize
        });
        SlotAvailability {
            key,
            capacity,
            confirmed,
            waitlisted,
            available_spots: capacity.saturating_sub(confirmed),
            is_available: confirmed < capacity,
            user_booking,
            can_book_more,
        }
    }

    /// Per-resource counts of non-cancelled bookings, optionally narrowed to
    /// one resource and an inclusive date range. Resources without bookings
    /// report zeros.
    pub async fn booking_stats(
        &self,
        resource_id: Option<Ulid>,
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    ) -> Vec<ResourceStats> {
        let wanted = |id: &Ulid| resource_id.is_none_or(|r| r == *id);
        let mut stats: BTreeMap<Ulid, ResourceStats> = self
            .store
            .resources()
            .into_iter()
            .filter(|r| wanted(&r.id))
            .map(|r| {
                (
                    r.id,
                    ResourceStats {
                        resource_id: r.id,
                        total: 0,
                        confirmed: 0,
                        waitlisted: 0,
                    },
                )
            })
            .collect();

        for slot in self.store.slots() {
            let guard = slot.read().await;
            let key = guard.key;
            if !wanted(&key.resource_id)
                || from.is_some_and(|f| key.date < f)
                || to.is_some_and(|t| key.date > t)
            {
                continue;
            }
            let Some(entry) = stats.get_mut(&key.resource_id) else {
                continue;
            };
            let confirmed = guard.confirmed_count();
            let waitlisted = guard.waitlist_count();
            entry.confirmed += confirmed;
            entry.waitlisted += waitlisted;
            entry.total += confirmed + waitlisted;
        }
        stats.into_values().collect()
    }

    /// Effective settings, defaults included, sorted by key.
    pub fn settings(&self) -> Vec<(String, u32)> {
        let mut settings = self.store.settings();
        if !settings.iter().any(|(k, _)| k == MAX_CONCURRENT_BOOKINGS_KEY) {
            settings.push((
                MAX_CONCURRENT_BOOKINGS_KEY.to_string(),
                self.config.default_max_concurrent,
            ));
        }
        settings.sort();
        settings
    }
}

fn ordered_active(state: &SlotState) -> Vec<Booking> {
    let mut bookings: Vec<Booking> = state
        .bookings
        .iter()
        .filter(|b| b.is_active())
        .cloned()
        .collect();
    bookings.sort_by_key(|b| {
        (
            b.status != BookingStatus::Confirmed,
            b.waitlist_position.unwrap_or(0),
            b.created_at,
            b.id,
        )
    });
    bookings
}
