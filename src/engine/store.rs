use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;

pub type SharedSlotState = Arc<RwLock<SlotState>>;

/// In-memory booking store, resource directory and settings table.
///
/// Slot state is sharded per (resource, date, slot) so writers on different
/// keys never contend. The secondary indexes are maintained by `apply_*` and
/// must only be touched while the owning slot's write lock is held.
pub struct BookingStore {
    resources: DashMap<Ulid, Resource>,
    settings: DashMap<String, u32>,
    slots: DashMap<SlotKey, SharedSlotState>,
    /// booking id → key
    booking_keys: DashMap<Ulid, SlotKey>,
    /// Unique index over non-cancelled (user, key).
    active: DashMap<(Ulid, SlotKey), Ulid>,
    /// Non-cancelled booking ids per user time window, across resources.
    windows: DashMap<UserWindow, HashSet<Ulid>>,
    window_locks: DashMap<UserWindow, Arc<Mutex<()>>>,
}

impl Default for BookingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BookingStore {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            settings: DashMap::new(),
            slots: DashMap::new(),
            booking_keys: DashMap::new(),
            active: DashMap::new(),
            windows: DashMap::new(),
            window_locks: DashMap::new(),
        }
    }

    /// Rebuild from a replayed log. Slots are assembled unshared first, so no
    /// lock is taken while replaying.
    pub fn from_events(events: &[Event]) -> Self {
        let store = Self::new();
        let mut slots: HashMap<SlotKey, SlotState> = HashMap::new();
        for event in events {
            match event.slot_key() {
                Some(key) => {
                    let slot = slots.entry(key).or_insert_with(|| SlotState::new(key));
                    store.apply_booking_event(slot, event);
                }
                None => store.apply_directory_event(event),
            }
        }
        for (key, slot) in slots {
            store.slots.insert(key, Arc::new(RwLock::new(slot)));
        }
        store
    }

    // ── Resource directory ───────────────────────────────────

    pub fn resource(&self, id: &Ulid) -> Option<Resource> {
        self.resources.get(id).map(|r| r.value().clone())
    }

    pub fn resources(&self) -> Vec<Resource> {
        self.resources.iter().map(|r| r.value().clone()).collect()
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Case-insensitive name clash with another active resource.
    pub fn name_taken(&self, name: &str, except: Ulid) -> bool {
        self.resources
            .iter()
            .any(|r| r.id != except && r.active && r.name.eq_ignore_ascii_case(name))
    }

    // ── Settings ─────────────────────────────────────────────

    pub fn setting(&self, key: &str) -> Option<u32> {
        self.settings.get(key).map(|v| *v.value())
    }

    pub fn settings(&self) -> Vec<(String, u32)> {
        self.settings
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    // ── Slots and indexes ────────────────────────────────────

    pub fn slot(&self, key: &SlotKey) -> Option<SharedSlotState> {
        self.slots.get(key).map(|e| e.value().clone())
    }

    pub fn slot_or_create(&self, key: SlotKey) -> SharedSlotState {
        self.slots
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(SlotState::new(key))))
            .value()
            .clone()
    }

    pub fn slots(&self) -> Vec<SharedSlotState> {
        self.slots.iter().map(|e| e.value().clone()).collect()
    }

    pub fn booking_key(&self, id: &Ulid) -> Option<SlotKey> {
        self.booking_keys.get(id).map(|e| *e.value())
    }

    /// Non-cancelled bookings the user holds in this window, across resources.
    pub fn window_count(&self, window: &UserWindow) -> usize {
        self.windows.get(window).map_or(0, |set| set.len())
    }

    /// Mutex serializing concurrent-limit checks for one user window.
    pub fn window_lock(&self, window: UserWindow) -> Arc<Mutex<()>> {
        self.window_locks
            .entry(window)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Drop the window's mutex once nobody but the map holds it.
    pub fn release_window_lock(&self, window: &UserWindow) {
        self.window_locks
            .remove_if(window, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn window_lock_count(&self) -> usize {
        self.window_locks.len()
    }

    /// Claim the unique (user, key) slot for `id`. On clash returns the holder.
    pub fn reserve_unique(&self, user_id: Ulid, key: SlotKey, id: Ulid) -> Result<(), Ulid> {
        match self.active.entry((user_id, key)) {
            Entry::Occupied(held) if *held.get() == id => Ok(()),
            Entry::Occupied(held) => Err(*held.get()),
            Entry::Vacant(slot) => {
                slot.insert(id);
                Ok(())
            }
        }
    }

    pub fn release_unique(&self, user_id: Ulid, key: SlotKey, id: Ulid) {
        self.active.remove_if(&(user_id, key), |_, held| *held == id);
    }

    /// (key, booking id) of every non-cancelled booking the user holds.
    pub fn user_active(&self, user_id: Ulid) -> Vec<(SlotKey, Ulid)> {
        self.active
            .iter()
            .filter(|e| e.key().0 == user_id)
            .map(|e| (e.key().1, *e.value()))
            .collect()
    }

    // ── Event application ────────────────────────────────────

    pub fn apply_directory_event(&self, event: &Event) {
        match event {
            Event::ResourceUpserted {
                id,
                name,
                description,
                capacity,
            } => {
                self.resources.insert(
                    *id,
                    Resource {
                        id: *id,
                        name: name.clone(),
                        description: description.clone(),
                        capacity: *capacity,
                        active: true,
                    },
                );
            }
            Event::ResourceDeactivated { id } => {
                if let Some(mut r) = self.resources.get_mut(id) {
                    r.active = false;
                }
            }
            Event::SettingChanged { key, value } => {
                self.settings.insert(key.clone(), *value);
            }
            Event::BookingPlaced { .. }
            | Event::BookingCancelled { .. }
            | Event::WaitlistRenumbered { .. } => {}
        }
    }

    /// Apply a booking event to its slot (caller holds the slot's write lock).
    pub fn apply_booking_event(&self, slot: &mut SlotState, event: &Event) {
        match event {
            Event::BookingPlaced { booking } => {
                self.booking_keys.insert(booking.id, slot.key);
                if booking.is_active() {
                    self.index_active(booking);
                }
                slot.bookings.push(booking.clone());
            }
            Event::BookingCancelled {
                id,
                promoted,
                renumbered,
                ..
            } => {
                if let Some(b) = slot.get_mut(*id) {
                    b.status = BookingStatus::Cancelled;
                    b.waitlist_position = None;
                    let (user_id, key, window) = (b.user_id, b.key(), b.window());
                    self.unindex_active(user_id, key, window, *id);
                }
                if let Some(pid) = promoted
                    && let Some(b) = slot.get_mut(*pid)
                {
                    b.status = BookingStatus::Confirmed;
                    b.waitlist_position = None;
                }
                set_positions(slot, renumbered);
            }
            Event::WaitlistRenumbered { renumbered, .. } => set_positions(slot, renumbered),
            Event::ResourceUpserted { .. }
            | Event::ResourceDeactivated { .. }
            | Event::SettingChanged { .. } => return,
        }
        slot.version += 1;
    }

    fn index_active(&self, booking: &Booking) {
        self.active
            .insert((booking.user_id, booking.key()), booking.id);
        self.windows
            .entry(booking.window())
            .or_default()
            .insert(booking.id);
    }

    fn unindex_active(&self, user_id: Ulid, key: SlotKey, window: UserWindow, id: Ulid) {
        self.release_unique(user_id, key, id);
        if let Some(mut set) = self.windows.get_mut(&window) {
            set.remove(&id);
        }
        self.windows.remove_if(&window, |_, set| set.is_empty());
    }
}

fn set_positions(slot: &mut SlotState, positions: &[(Ulid, u32)]) {
    for (id, pos) in positions {
        if let Some(b) = slot.get_mut(*id) {
            b.waitlist_position = Some(*pos);
        }
    }
}
