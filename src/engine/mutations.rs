use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;
use crate::observability;

use super::allocation::{CancellationPlan, decide_placement, plan_cancellation, plan_renumber, waitlist_order};
use super::validate::{
    now_ms, today, validate_date, validate_resource_fields, validate_setting, validate_slot,
};
use super::{Engine, EngineError, SharedSlotState, WalCommand, retry_on_conflict};

/// A decision taken under a slot read lock. It may only be committed while
/// the slot is still at `expected_version`.
pub(super) struct Planned<T> {
    slot: SharedSlotState,
    expected_version: u64,
    decision: T,
}

impl Engine {
    /// Place a booking: confirmed while the slot has room, otherwise appended
    /// to the waitlist.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<CreateOutcome, EngineError> {
        self.active_resource(req.resource_id)?;
        validate_date(req.date, today())?;
        validate_slot(req.slot)?;

        let window = UserWindow {
            user_id: req.user_id,
            date: req.date,
            slot: req.slot,
        };
        let window_lock = self.store.window_lock(window);
        let result = {
            let _window = window_lock.lock().await;
            retry_on_conflict(
                self.config.max_write_attempts,
                "create_booking",
                move |exclusive| self.try_create(req, window, exclusive),
            )
            .await
        };
        drop(window_lock);
        self.store.release_window_lock(&window);
        let booking = result?;

        metrics::counter!(
            observability::BOOKINGS_CREATED_TOTAL,
            "status" => booking.status.as_str()
        )
        .increment(1);
        debug!(
            booking = %booking.id,
            key = %booking.key(),
            status = booking.status.as_str(),
            position = ?booking.waitlist_position,
            "booking placed"
        );
        Ok(CreateOutcome::new(booking))
    }

    async fn try_create(
        &self,
        req: BookingRequest,
        window: UserWindow,
        exclusive: bool,
    ) -> Result<Booking, EngineError> {
        let _gate = self.commit_gate.read().await;
        if !exclusive {
            let planned = self.plan_create(req, window).await?;
            return self.commit_create(planned).await;
        }
        let (capacity, slot) = self.create_preconditions(req, window)?;
        let mut guard = slot.write().await;
        let booking = decide_create(&guard, req, capacity)?;
        let expected = guard.version;
        self.commit_booking(&mut guard, expected, booking).await
    }

    /// Checks that do not depend on the slot's contents. The caller holds
    /// the user's window lock.
    fn create_preconditions(
        &self,
        req: BookingRequest,
        window: UserWindow,
    ) -> Result<(u32, SharedSlotState), EngineError> {
        let resource = self.active_resource(req.resource_id)?;
        if self.store.booking_key(&req.id).is_some() {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let limit = self.max_concurrent_bookings();
        if self.store.window_count(&window) >= limit as usize {
            metrics::counter!(observability::CONCURRENT_LIMIT_REJECTIONS_TOTAL).increment(1);
            return Err(EngineError::ConcurrentLimitExceeded(limit));
        }
        let key = SlotKey::new(req.resource_id, req.date, req.slot);
        Ok((resource.capacity, self.store.slot_or_create(key)))
    }

    /// Decide placement against a snapshot of the slot.
    pub(super) async fn plan_create(
        &self,
        req: BookingRequest,
        window: UserWindow,
    ) -> Result<Planned<Booking>, EngineError> {
        let (capacity, slot) = self.create_preconditions(req, window)?;
        let guard = slot.read().await;
        let booking = decide_create(&guard, req, capacity)?;
        let expected_version = guard.version;
        drop(guard);
        Ok(Planned {
            slot,
            expected_version,
            decision: booking,
        })
    }

    pub(super) async fn commit_create(&self, planned: Planned<Booking>) -> Result<Booking, EngineError> {
        let mut guard = planned.slot.write().await;
        self.commit_booking(&mut guard, planned.expected_version, planned.decision)
            .await
    }

    async fn commit_booking(
        &self,
        slot: &mut SlotState,
        expected_version: u64,
        booking: Booking,
    ) -> Result<Booking, EngineError> {
        let key = booking.key();
        self.store
            .reserve_unique(booking.user_id, key, booking.id)
            .map_err(|_| EngineError::DuplicateBooking)?;
        let event = Event::BookingPlaced {
            booking: booking.clone(),
        };
        if let Err(e) = self.commit(slot, expected_version, &event).await {
            self.store.release_unique(booking.user_id, key, booking.id);
            return Err(e);
        }
        self.notify.publish(&Notification::BookingCreated {
            key,
            booking: booking.clone(),
        });
        Ok(booking)
    }

    /// Cancel a booking. Freeing a confirmed seat promotes the head of the
    /// waitlist; either way the remaining queue is left dense.
    pub async fn cancel_booking(
        &self,
        id: Ulid,
        requester: Requester,
    ) -> Result<CancelOutcome, EngineError> {
        let outcome = retry_on_conflict(
            self.config.max_write_attempts,
            "cancel_booking",
            move |exclusive| self.try_cancel(id, requester, exclusive),
        )
        .await?;

        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        let key = outcome.cancelled.key();
        debug!(booking = %id, %key, "booking cancelled");
        if let Some(promoted) = &outcome.promoted {
            metrics::counter!(observability::WAITLIST_PROMOTIONS_TOTAL).increment(1);
            info!(booking = %promoted.id, user = %promoted.user_id, %key, "promoted from waitlist");
        }
        Ok(outcome)
    }

    async fn try_cancel(
        &self,
        id: Ulid,
        requester: Requester,
        exclusive: bool,
    ) -> Result<CancelOutcome, EngineError> {
        let _gate = self.commit_gate.read().await;
        if !exclusive {
            let planned = self.plan_cancel(id, requester).await?;
            return self.commit_cancel(planned).await;
        }
        let slot = self.booking_slot(id)?;
        let mut guard = slot.write().await;
        let event = self.decide_cancel(&guard, id, requester)?;
        let expected = guard.version;
        self.commit_cancellation(&mut guard, expected, event).await
    }

    fn booking_slot(&self, id: Ulid) -> Result<SharedSlotState, EngineError> {
        let key = self.store.booking_key(&id).ok_or(EngineError::NotFound(id))?;
        self.store.slot(&key).ok_or(EngineError::NotFound(id))
    }

    /// Pick the promotion and renumbering against a snapshot of the slot.
    pub(super) async fn plan_cancel(
        &self,
        id: Ulid,
        requester: Requester,
    ) -> Result<Planned<Event>, EngineError> {
        let slot = self.booking_slot(id)?;
        let guard = slot.read().await;
        let event = self.decide_cancel(&guard, id, requester)?;
        let expected_version = guard.version;
        drop(guard);
        Ok(Planned {
            slot,
            expected_version,
            decision: event,
        })
    }

    pub(super) async fn commit_cancel(&self, planned: Planned<Event>) -> Result<CancelOutcome, EngineError> {
        let mut guard = planned.slot.write().await;
        self.commit_cancellation(&mut guard, planned.expected_version, planned.decision)
            .await
    }

    fn decide_cancel(
        &self,
        slot: &SlotState,
        id: Ulid,
        requester: Requester,
    ) -> Result<Event, EngineError> {
        let target = slot.get(id).ok_or(EngineError::NotFound(id))?;
        if let Requester::User(user_id) = requester
            && user_id != target.user_id
        {
            return Err(EngineError::Unauthorized(id));
        }
        if target.status == BookingStatus::Cancelled {
            return Err(EngineError::AlreadyCancelled(id));
        }

        // Soft-deleted resources keep their capacity for queued users.
        let capacity = self
            .store
            .resource(&slot.key.resource_id)
            .map_or(0, |r| r.capacity);
        let CancellationPlan {
            promoted,
            renumbered,
        } = plan_cancellation(slot, target, capacity);
        Ok(Event::BookingCancelled {
            id,
            key: slot.key,
            promoted,
            renumbered,
        })
    }

    async fn commit_cancellation(
        &self,
        slot: &mut SlotState,
        expected_version: u64,
        event: Event,
    ) -> Result<CancelOutcome, EngineError> {
        let Event::BookingCancelled { id, promoted, .. } = &event else {
            return Err(EngineError::Transient("expected a cancellation event".into()));
        };
        let (id, promoted_id) = (*id, *promoted);
        self.commit(slot, expected_version, &event).await?;

        let cancelled = slot.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        let promoted = promoted_id.and_then(|pid| slot.get(pid).cloned());
        self.notify.publish(&Notification::BookingCancelled {
            key: slot.key,
            cancelled: cancelled.clone(),
            promoted: promoted.clone(),
        });
        if let Some(booking) = &promoted {
            self.notify.publish(&Notification::WaitlistPromoted {
                booking: booking.clone(),
            });
        }
        Ok(CancelOutcome {
            cancelled,
            promoted,
        })
    }

    /// Restore waitlist positions on `key` to 1..N. Returns how many entries moved.
    pub async fn renumber_waitlist(&self, key: SlotKey) -> Result<usize, EngineError> {
        if self.store.slot(&key).is_none() {
            return Ok(0);
        }
        retry_on_conflict(
            self.config.max_write_attempts,
            "renumber_waitlist",
            move |exclusive| self.try_renumber(key, exclusive),
        )
        .await
    }

    async fn try_renumber(&self, key: SlotKey, exclusive: bool) -> Result<usize, EngineError> {
        let _gate = self.commit_gate.read().await;
        let Some(slot) = self.store.slot(&key) else {
            return Ok(0);
        };
        let planned = if exclusive {
            None
        } else {
            let snapshot = slot.read().await;
            Some((plan_renumber(waitlist_order(&snapshot)), snapshot.version))
        };
        if planned.as_ref().is_some_and(|(renumbered, _)| renumbered.is_empty()) {
            return Ok(0);
        }

        let mut guard = slot.write().await;
        let (renumbered, expected_version) = match planned {
            Some(planned) => planned,
            None => (plan_renumber(waitlist_order(&guard)), guard.version),
        };
        if renumbered.is_empty() {
            return Ok(0);
        }
        let moved = renumbered.len();
        let event = Event::WaitlistRenumbered { key, renumbered };
        self.commit(&mut guard, expected_version, &event).await?;
        debug!(%key, moved, "waitlist renumbered");
        Ok(moved)
    }

    // ── Resource directory and settings ──────────────────────

    /// Create or update a resource. Capacity changes only affect later decisions.
    pub async fn upsert_resource(
        &self,
        id: Ulid,
        name: String,
        description: Option<String>,
        capacity: u32,
    ) -> Result<Resource, EngineError> {
        validate_resource_fields(&name, description.as_deref(), capacity)?;
        let name = name.trim().to_string();

        let _gate = self.commit_gate.read().await;
        let _dir = self.directory_lock.lock().await;
        let existing = self.store.resource(&id);
        if existing.is_none() && self.store.resource_count() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.store.name_taken(&name, id) {
            return Err(EngineError::NameTaken(name));
        }

        let event = Event::ResourceUpserted {
            id,
            name,
            description,
            capacity,
        };
        self.persist_directory(&event).await?;
        info!(resource = %id, capacity, created = existing.is_none(), "resource upserted");
        let resource = self.store.resource(&id).ok_or(EngineError::NotFound(id))?;
        self.notify.publish(&Notification::ResourceUpdated {
            resource: resource.clone(),
        });
        Ok(resource)
    }

    /// Soft delete. Existing bookings stay; new ones are refused.
    pub async fn deactivate_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let _dir = self.directory_lock.lock().await;
        let resource = self.store.resource(&id).ok_or(EngineError::NotFound(id))?;
        if !resource.active {
            return Ok(());
        }
        self.persist_directory(&Event::ResourceDeactivated { id }).await?;
        info!(resource = %id, "resource deactivated");
        if let Some(resource) = self.store.resource(&id) {
            self.notify.publish(&Notification::ResourceUpdated { resource });
        }
        Ok(())
    }

    pub async fn set_setting(&self, key: &str, value: u32) -> Result<(), EngineError> {
        validate_setting(key, value)?;
        let _gate = self.commit_gate.read().await;
        let _dir = self.directory_lock.lock().await;
        self.persist_directory(&Event::SettingChanged {
            key: key.to_string(),
            value,
        })
        .await?;
        info!(key, value, "setting changed");
        Ok(())
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut events = Vec::new();
        let mut resources = self.store.resources();
        resources.sort_by_key(|r| r.id);
        for r in resources {
            events.push(Event::ResourceUpserted {
                id: r.id,
                name: r.name,
                description: r.description,
                capacity: r.capacity,
            });
            if !r.active {
                events.push(Event::ResourceDeactivated { id: r.id });
            }
        }
        let mut settings = self.store.settings();
        settings.sort();
        for (key, value) in settings {
            events.push(Event::SettingChanged { key, value });
        }

        let mut slots = Vec::new();
        for slot in self.store.slots() {
            slots.push(slot.read_owned().await);
        }
        slots.sort_by_key(|s| s.key);
        for slot in &slots {
            for booking in &slot.bookings {
                events.push(Event::BookingPlaced {
                    booking: booking.clone(),
                });
            }
        }
        drop(slots);

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Transient("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Transient("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    fn active_resource(&self, id: Ulid) -> Result<Resource, EngineError> {
        self.store
            .resource(&id)
            .filter(|r| r.active)
            .ok_or(EngineError::ResourceUnavailable(id))
    }
}

/// Placement for `req` on the slot as it stands.
fn decide_create(slot: &SlotState, req: BookingRequest, capacity: u32) -> Result<Booking, EngineError> {
    if slot.active_for_user(req.user_id).is_some() {
        return Err(EngineError::DuplicateBooking);
    }
    if slot.bookings.len() >= MAX_BOOKINGS_PER_SLOT {
        return Err(EngineError::LimitExceeded("too many bookings on slot"));
    }
    let (status, waitlist_position) = decide_placement(slot, capacity);
    Ok(Booking {
        id: req.id,
        user_id: req.user_id,
        resource_id: req.resource_id,
        date: req.date,
        slot: req.slot,
        status,
        waitlist_position,
        created_at: now_ms(),
    })
}
