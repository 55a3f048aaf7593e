use super::*;
use super::validate::today;
use crate::notify::{Notification, Topic};
use crate::wal::Wal;

use chrono::{Days, NaiveDate};
use ulid::Ulid;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(path: PathBuf) -> Engine {
    Engine::new(path, Arc::new(NotifyHub::new()), AllocatorConfig::default()).unwrap()
}

fn days_ahead(n: u64) -> NaiveDate {
    today().checked_add_days(Days::new(n)).unwrap()
}

fn yesterday() -> NaiveDate {
    today().checked_sub_days(Days::new(1)).unwrap()
}

fn request(user_id: Ulid, resource_id: Ulid, date: NaiveDate, slot: u8) -> BookingRequest {
    BookingRequest {
        id: Ulid::new(),
        user_id,
        resource_id,
        date,
        slot,
    }
}

async fn add_resource(engine: &Engine, name: &str, capacity: u32) -> Ulid {
    let id = Ulid::new();
    engine
        .upsert_resource(id, name.to_string(), None, capacity)
        .await
        .unwrap();
    id
}

fn positions(bookings: &[Booking]) -> Vec<(BookingStatus, Option<u32>)> {
    bookings
        .iter()
        .map(|b| (b.status, b.waitlist_position))
        .collect()
}

/// Invariants every successful operation leaves behind on one key.
async fn assert_slot_invariants(engine: &Engine, key: &SlotKey) {
    let capacity = engine.resource(&key.resource_id).unwrap().capacity;
    let bookings = engine.slot_bookings(key).await;
    let confirmed = bookings
        .iter()
        .filter(|b| b.status == BookingStatus::Confirmed)
        .count() as u32;
    assert!(confirmed <= capacity, "{confirmed} confirmed over capacity {capacity}");

    let mut queue: Vec<u32> = bookings
        .iter()
        .filter(|b| b.status == BookingStatus::Waitlist)
        .map(|b| b.waitlist_position.unwrap())
        .collect();
    queue.sort();
    assert_eq!(queue, (1..=queue.len() as u32).collect::<Vec<_>>());

    for b in &bookings {
        assert_eq!(
            b.waitlist_position.is_some(),
            b.status == BookingStatus::Waitlist
        );
    }

    let mut users: Vec<Ulid> = bookings.iter().map(|b| b.user_id).collect();
    users.sort();
    users.dedup();
    assert_eq!(users.len(), bookings.len(), "user holds two bookings on one key");
}

// ── Scenarios ────────────────────────────────────────────

struct Fixture {
    engine: Engine,
    key: SlotKey,
    users: [Ulid; 4],
    ids: [Ulid; 4],
}

/// Capacity 2, four users booking the same key in order.
async fn scenario_a(name: &str) -> Fixture {
    let engine = new_engine(test_wal_path(name));
    let resource = add_resource(&engine, "Bench", 2).await;
    let date = days_ahead(3);
    let users = [Ulid::new(), Ulid::new(), Ulid::new(), Ulid::new()];
    let mut ids = [Ulid::nil(); 4];
    for (i, user) in users.iter().enumerate() {
        let out = engine
            .create_booking(request(*user, resource, date, 1))
            .await
            .unwrap();
        ids[i] = out.booking.id;
    }
    Fixture {
        engine,
        key: SlotKey::new(resource, date, 1),
        users,
        ids,
    }
}

#[tokio::test]
async fn scenario_a_fills_capacity_then_queues() {
    let f = scenario_a("scenario_a.wal").await;
    let bookings = f.engine.slot_bookings(&f.key).await;
    assert_eq!(
        positions(&bookings),
        vec![
            (BookingStatus::Confirmed, None),
            (BookingStatus::Confirmed, None),
            (BookingStatus::Waitlist, Some(1)),
            (BookingStatus::Waitlist, Some(2)),
        ]
    );
    assert_eq!(bookings[2].user_id, f.users[2]);
    assert_eq!(bookings[3].user_id, f.users[3]);
    assert_slot_invariants(&f.engine, &f.key).await;
}

#[tokio::test]
async fn create_reports_placement_message() {
    let engine = new_engine(test_wal_path("create_message.wal"));
    let resource = add_resource(&engine, "Press", 1).await;
    let date = days_ahead(1);
    let first = engine
        .create_booking(request(Ulid::new(), resource, date, 2))
        .await
        .unwrap();
    assert_eq!(first.message, "Booking confirmed successfully!");
    let second = engine
        .create_booking(request(Ulid::new(), resource, date, 2))
        .await
        .unwrap();
    assert_eq!(second.message, "Added to waitlist at position 1");
}

#[tokio::test]
async fn scenario_b_cancel_promotes_head_and_renumbers() {
    let f = scenario_a("scenario_b.wal").await;
    let out = f
        .engine
        .cancel_booking(f.ids[0], Requester::User(f.users[0]))
        .await
        .unwrap();
    assert_eq!(out.cancelled.status, BookingStatus::Cancelled);
    assert_eq!(out.cancelled.waitlist_position, None);
    let promoted = out.promoted.unwrap();
    assert_eq!(promoted.id, f.ids[2]);
    assert_eq!(promoted.status, BookingStatus::Confirmed);
    assert_eq!(promoted.waitlist_position, None);

    let u4 = f.engine.booking(&f.ids[3]).await.unwrap();
    assert_eq!(u4.status, BookingStatus::Waitlist);
    assert_eq!(u4.waitlist_position, Some(1));
    assert_slot_invariants(&f.engine, &f.key).await;
}

#[tokio::test]
async fn scenario_c_cancelling_waitlisted_never_promotes() {
    let f = scenario_a("scenario_c.wal").await;
    f.engine
        .cancel_booking(f.ids[0], Requester::User(f.users[0]))
        .await
        .unwrap();
    let out = f
        .engine
        .cancel_booking(f.ids[3], Requester::User(f.users[3]))
        .await
        .unwrap();
    assert_eq!(out.cancelled.status, BookingStatus::Cancelled);
    assert!(out.promoted.is_none());

    let avail = f.engine.slot_availability(&f.key, None).await.unwrap();
    assert_eq!(avail.confirmed, 2);
    assert_eq!(avail.waitlisted, 0);
    assert_slot_invariants(&f.engine, &f.key).await;
}

#[tokio::test]
async fn scenario_d_concurrent_limit_spans_resources() {
    let engine = new_engine(test_wal_path("scenario_d.wal"));
    let user = Ulid::new();
    let date = days_ahead(2);
    for i in 0..3 {
        let r = add_resource(&engine, &format!("Room {i}"), 5).await;
        engine.create_booking(request(user, r, date, 1)).await.unwrap();
    }
    let fourth = add_resource(&engine, "Room 3", 5).await;
    let err = engine
        .create_booking(request(user, fourth, date, 1))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::ConcurrentLimitExceeded(3));

    // Another slot on the same date is a different window.
    engine.create_booking(request(user, fourth, date, 2)).await.unwrap();
}

#[tokio::test]
async fn scenario_e_past_date_rejected() {
    let engine = new_engine(test_wal_path("scenario_e.wal"));
    let r = add_resource(&engine, "Desk", 1).await;
    for slot in [1, 8] {
        let err = engine
            .create_booking(request(Ulid::new(), r, yesterday(), slot))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::InvalidDate(yesterday()));
    }
    engine
        .create_booking(request(Ulid::new(), r, today(), 1))
        .await
        .unwrap();
}

// ── Creation preconditions ───────────────────────────────

#[tokio::test]
async fn preconditions_checked_in_order() {
    let engine = new_engine(test_wal_path("precondition_order.wal"));
    let missing = Ulid::new();
    let err = engine
        .create_booking(request(Ulid::new(), missing, yesterday(), 0))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::ResourceUnavailable(missing));

    let r = add_resource(&engine, "Saw", 1).await;
    let err = engine
        .create_booking(request(Ulid::new(), r, yesterday(), 0))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::InvalidDate(yesterday()));

    let err = engine
        .create_booking(request(Ulid::new(), r, days_ahead(1), 9))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::InvalidSlot(9));
}

#[tokio::test]
async fn duplicate_booking_rejected_until_cancelled() {
    let engine = new_engine(test_wal_path("duplicate.wal"));
    let r = add_resource(&engine, "Loom", 1).await;
    let user = Ulid::new();
    let date = days_ahead(4);

    let first = engine.create_booking(request(user, r, date, 3)).await.unwrap();
    let err = engine
        .create_booking(request(user, r, date, 3))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::DuplicateBooking);

    engine
        .cancel_booking(first.booking.id, Requester::User(user))
        .await
        .unwrap();
    let again = engine.create_booking(request(user, r, date, 3)).await.unwrap();
    assert_eq!(again.booking.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn waitlisted_booking_counts_toward_limit() {
    let engine = new_engine(test_wal_path("waitlist_counts.wal"));
    engine.set_setting("max_concurrent_bookings", 1).await.unwrap();
    let date = days_ahead(1);
    let busy = add_resource(&engine, "Busy", 1).await;
    let other = add_resource(&engine, "Other", 1).await;
    engine
        .create_booking(request(Ulid::new(), busy, date, 5))
        .await
        .unwrap();

    let user = Ulid::new();
    let queued = engine.create_booking(request(user, busy, date, 5)).await.unwrap();
    assert_eq!(queued.booking.status, BookingStatus::Waitlist);
    let err = engine
        .create_booking(request(user, other, date, 5))
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::ConcurrentLimitExceeded(1));
}

#[tokio::test]
async fn reused_booking_id_rejected() {
    let engine = new_engine(test_wal_path("reused_id.wal"));
    let r = add_resource(&engine, "Anvil", 2).await;
    let req = request(Ulid::new(), r, days_ahead(1), 1);
    engine.create_booking(req).await.unwrap();
    let clash = BookingRequest {
        user_id: Ulid::new(),
        ..req
    };
    assert_eq!(
        engine.create_booking(clash).await.unwrap_err(),
        EngineError::AlreadyExists(req.id)
    );
}

#[tokio::test]
async fn raised_limit_setting_applies_immediately() {
    let engine = new_engine(test_wal_path("raised_limit.wal"));
    assert_eq!(engine.max_concurrent_bookings(), 3);
    engine.set_setting("max_concurrent_bookings", 4).await.unwrap();
    assert_eq!(engine.max_concurrent_bookings(), 4);

    let user = Ulid::new();
    let date = days_ahead(2);
    for i in 0..4 {
        let r = add_resource(&engine, &format!("Bay {i}"), 1).await;
        engine.create_booking(request(user, r, date, 4)).await.unwrap();
    }
}

#[tokio::test]
async fn configured_default_limit_used_without_setting() {
    let config = AllocatorConfig {
        default_max_concurrent: 1,
        ..AllocatorConfig::default()
    };
    let engine = Engine::new(
        test_wal_path("configured_default.wal"),
        Arc::new(NotifyHub::new()),
        config,
    )
    .unwrap();
    let user = Ulid::new();
    let date = days_ahead(1);
    let a = add_resource(&engine, "A", 1).await;
    let b = add_resource(&engine, "B", 1).await;
    engine.create_booking(request(user, a, date, 1)).await.unwrap();
    assert_eq!(
        engine
            .create_booking(request(user, b, date, 1))
            .await
            .unwrap_err(),
        EngineError::ConcurrentLimitExceeded(1)
    );
}

// ── Cancellation ─────────────────────────────────────────

#[tokio::test]
async fn cancel_failures() {
    let f = scenario_a("cancel_failures.wal").await;
    let missing = Ulid::new();
    assert_eq!(
        f.engine
            .cancel_booking(missing, Requester::Privileged)
            .await
            .unwrap_err(),
        EngineError::NotFound(missing)
    );
    assert_eq!(
        f.engine
            .cancel_booking(f.ids[0], Requester::User(f.users[1]))
            .await
            .unwrap_err(),
        EngineError::Unauthorized(f.ids[0])
    );
    f.engine
        .cancel_booking(f.ids[0], Requester::Privileged)
        .await
        .unwrap();
    assert_eq!(
        f.engine
            .cancel_booking(f.ids[0], Requester::User(f.users[0]))
            .await
            .unwrap_err(),
        EngineError::AlreadyCancelled(f.ids[0])
    );
}

#[tokio::test]
async fn promotion_is_fifo_across_cancellations() {
    let engine = new_engine(test_wal_path("fifo.wal"));
    let r = add_resource(&engine, "Kayak", 1).await;
    let date = days_ahead(5);
    let mut ids = Vec::new();
    for _ in 0..5 {
        let out = engine
            .create_booking(request(Ulid::new(), r, date, 6))
            .await
            .unwrap();
        ids.push(out.booking.id);
    }
    for next in 1..5 {
        let out = engine
            .cancel_booking(ids[next - 1], Requester::Privileged)
            .await
            .unwrap();
        assert_eq!(out.promoted.unwrap().id, ids[next]);
        assert_slot_invariants(&engine, &SlotKey::new(r, date, 6)).await;
    }
}

#[tokio::test]
async fn cancelling_middle_of_queue_compacts_positions() {
    let engine = new_engine(test_wal_path("middle_cancel.wal"));
    let r = add_resource(&engine, "Canoe", 1).await;
    let date = days_ahead(1);
    let key = SlotKey::new(r, date, 7);
    let mut ids = Vec::new();
    for _ in 0..5 {
        let out = engine
            .create_booking(request(Ulid::new(), r, date, 7))
            .await
            .unwrap();
        ids.push(out.booking.id);
    }
    // Queue is ids[1..]; drop position 2.
    engine.cancel_booking(ids[2], Requester::Privileged).await.unwrap();
    let queue: Vec<(Ulid, Option<u32>)> = engine
        .slot_bookings(&key)
        .await
        .into_iter()
        .filter(|b| b.status == BookingStatus::Waitlist)
        .map(|b| (b.id, b.waitlist_position))
        .collect();
    assert_eq!(
        queue,
        vec![(ids[1], Some(1)), (ids[3], Some(2)), (ids[4], Some(3))]
    );
}

#[tokio::test]
async fn cancel_without_queue_just_frees_seat() {
    let engine = new_engine(test_wal_path("free_seat.wal"));
    let r = add_resource(&engine, "Piano", 1).await;
    let date = days_ahead(1);
    let user = Ulid::new();
    let b = engine.create_booking(request(user, r, date, 1)).await.unwrap();
    let out = engine
        .cancel_booking(b.booking.id, Requester::User(user))
        .await
        .unwrap();
    assert!(out.promoted.is_none());
    let next = engine
        .create_booking(request(Ulid::new(), r, date, 1))
        .await
        .unwrap();
    assert_eq!(next.booking.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn promotion_notifies_promoted_user() {
    let f = scenario_a("notify_promotion.wal").await;
    let mut promoted_rx = f.engine.notify.subscribe(Topic::User(f.users[2]));
    let mut slot_rx = f.engine.notify.subscribe(Topic::Slot(f.key));

    f.engine
        .cancel_booking(f.ids[0], Requester::User(f.users[0]))
        .await
        .unwrap();

    match promoted_rx.recv().await.unwrap() {
        Notification::WaitlistPromoted { booking } => {
            assert_eq!(booking.id, f.ids[2]);
            assert_eq!(booking.status, BookingStatus::Confirmed);
        }
        other => panic!("unexpected {other:?}"),
    }
    match slot_rx.recv().await.unwrap() {
        Notification::BookingCancelled {
            cancelled,
            promoted,
            ..
        } => {
            assert_eq!(cancelled.id, f.ids[0]);
            assert_eq!(promoted.map(|b| b.id), Some(f.ids[2]));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn create_notifies_resource_topic() {
    let engine = new_engine(test_wal_path("notify_create.wal"));
    let r = add_resource(&engine, "Lab", 1).await;
    let mut rx = engine.notify.subscribe(Topic::Resource(r));
    let out = engine
        .create_booking(request(Ulid::new(), r, days_ahead(1), 3))
        .await
        .unwrap();
    match rx.recv().await.unwrap() {
        Notification::BookingCreated { booking, .. } => assert_eq!(booking, out.booking),
        other => panic!("unexpected {other:?}"),
    }
}

// ── Resource directory ───────────────────────────────────

#[tokio::test]
async fn deactivated_resource_refuses_new_bookings_but_keeps_queue() {
    let engine = new_engine(test_wal_path("deactivate.wal"));
    let r = add_resource(&engine, "Drill", 1).await;
    let date = days_ahead(1);
    let first = engine
        .create_booking(request(Ulid::new(), r, date, 2))
        .await
        .unwrap();
    let queued = engine
        .create_booking(request(Ulid::new(), r, date, 2))
        .await
        .unwrap();

    engine.deactivate_resource(r).await.unwrap();
    engine.deactivate_resource(r).await.unwrap();
    assert_eq!(
        engine
            .create_booking(request(Ulid::new(), r, date, 2))
            .await
            .unwrap_err(),
        EngineError::ResourceUnavailable(r)
    );
    assert!(engine.list_resources().is_empty());
    assert!(!engine.resource(&r).unwrap().active);

    let out = engine
        .cancel_booking(first.booking.id, Requester::Privileged)
        .await
        .unwrap();
    assert_eq!(out.promoted.unwrap().id, queued.booking.id);
}

#[tokio::test]
async fn capacity_decrease_grandfathers_confirmed() {
    let engine = new_engine(test_wal_path("shrink.wal"));
    let r = add_resource(&engine, "Court", 2).await;
    let date = days_ahead(1);
    let key = SlotKey::new(r, date, 3);
    let a = engine.create_booking(request(Ulid::new(), r, date, 3)).await.unwrap();
    let b = engine.create_booking(request(Ulid::new(), r, date, 3)).await.unwrap();
    let c = engine.create_booking(request(Ulid::new(), r, date, 3)).await.unwrap();
    assert_eq!(c.booking.waitlist_position, Some(1));

    engine
        .upsert_resource(r, "Court".into(), None, 1)
        .await
        .unwrap();
    let avail = engine.slot_availability(&key, None).await.unwrap();
    assert_eq!(avail.confirmed, 2);
    assert_eq!(avail.available_spots, 0);

    // Still over capacity after this one: no promotion.
    let out = engine
        .cancel_booking(a.booking.id, Requester::Privileged)
        .await
        .unwrap();
    assert!(out.promoted.is_none());

    let out = engine
        .cancel_booking(b.booking.id, Requester::Privileged)
        .await
        .unwrap();
    assert_eq!(out.promoted.unwrap().id, c.booking.id);
    assert_slot_invariants(&engine, &key).await;
}

#[tokio::test]
async fn capacity_increase_affects_later_decisions_only() {
    let engine = new_engine(test_wal_path("grow.wal"));
    let r = add_resource(&engine, "Boat", 1).await;
    let date = days_ahead(1);
    engine.create_booking(request(Ulid::new(), r, date, 1)).await.unwrap();
    let queued = engine.create_booking(request(Ulid::new(), r, date, 1)).await.unwrap();

    engine.upsert_resource(r, "Boat".into(), None, 2).await.unwrap();
    let still = engine.booking(&queued.booking.id).await.unwrap();
    assert_eq!(still.waitlist_position, Some(1));

    let late = engine.create_booking(request(Ulid::new(), r, date, 1)).await.unwrap();
    assert_eq!(late.booking.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn resource_validation_and_name_uniqueness() {
    let engine = new_engine(test_wal_path("resource_validation.wal"));
    add_resource(&engine, "Studio", 1).await;
    assert_eq!(
        engine
            .upsert_resource(Ulid::new(), "studio".into(), None, 1)
            .await
            .unwrap_err(),
        EngineError::NameTaken("studio".into())
    );
    assert!(matches!(
        engine.upsert_resource(Ulid::new(), "Big".into(), None, 51).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        engine.upsert_resource(Ulid::new(), String::new(), None, 1).await,
        Err(EngineError::LimitExceeded(_))
    ));
    let id = Ulid::new();
    let created = engine
        .upsert_resource(id, "  Annex ".into(), Some("north wing".into()), 50)
        .await
        .unwrap();
    assert_eq!(created.name, "Annex");
    assert_eq!(created.description.as_deref(), Some("north wing"));
}

#[tokio::test]
async fn list_resources_sorted_by_name() {
    let engine = new_engine(test_wal_path("list_sorted.wal"));
    add_resource(&engine, "zeta", 1).await;
    add_resource(&engine, "Alpha", 1).await;
    let hidden = add_resource(&engine, "beta", 1).await;
    engine.deactivate_resource(hidden).await.unwrap();
    let names: Vec<String> = engine.list_resources().into_iter().map(|r| r.name).collect();
    assert_eq!(names, vec!["Alpha".to_string(), "zeta".to_string()]);
}

#[tokio::test]
async fn unknown_setting_rejected() {
    let engine = new_engine(test_wal_path("unknown_setting.wal"));
    assert_eq!(
        engine.set_setting("slot_minutes", 30).await.unwrap_err(),
        EngineError::UnknownSetting("slot_minutes".into())
    );
    assert_eq!(
        engine.settings(),
        vec![("max_concurrent_bookings".to_string(), 3)]
    );
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn slot_availability_reports_user_view() {
    let f = scenario_a("availability.wal").await;
    let avail = f
        .engine
        .slot_availability(&f.key, Some(f.users[3]))
        .await
        .unwrap();
    assert_eq!(avail.capacity, 2);
    assert_eq!(avail.confirmed, 2);
    assert_eq!(avail.waitlisted, 2);
    assert_eq!(avail.available_spots, 0);
    assert!(!avail.is_available);
    assert_eq!(avail.user_booking.unwrap().id, f.ids[3]);
    assert_eq!(avail.can_book_more, Some(true));

    let empty_key = SlotKey::new(f.key.resource_id, f.key.date, 2);
    let avail = f.engine.slot_availability(&empty_key, None).await.unwrap();
    assert_eq!(avail.available_spots, 2);
    assert!(avail.is_available);
    assert_eq!(avail.can_book_more, None);

    let bad = SlotKey::new(f.key.resource_id, f.key.date, 0);
    assert_eq!(
        f.engine.slot_availability(&bad, None).await.unwrap_err(),
        EngineError::InvalidSlot(0)
    );
}

#[tokio::test]
async fn user_bookings_hide_cancelled_and_past() {
    let path = test_wal_path("user_bookings.wal");
    let user = Ulid::new();
    let resource = Ulid::new();
    let past = Booking {
        id: Ulid::new(),
        user_id: user,
        resource_id: resource,
        date: yesterday(),
        slot: 1,
        status: BookingStatus::Confirmed,
        waitlist_position: None,
        created_at: 0,
    };
    {
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&Event::ResourceUpserted {
            id: resource,
            name: "Grill".into(),
            description: None,
            capacity: 2,
        })
        .unwrap();
        wal.append(&Event::BookingPlaced {
            booking: past.clone(),
        })
        .unwrap();
    }
    let engine = new_engine(path);
    let later = engine
        .create_booking(request(user, resource, days_ahead(2), 1))
        .await
        .unwrap();
    let sooner = engine
        .create_booking(request(user, resource, days_ahead(1), 4))
        .await
        .unwrap();
    let gone = engine
        .create_booking(request(user, resource, days_ahead(1), 2))
        .await
        .unwrap();
    engine
        .cancel_booking(gone.booking.id, Requester::User(user))
        .await
        .unwrap();

    let upcoming: Vec<Ulid> = engine
        .user_bookings(user, false)
        .await
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(upcoming, vec![sooner.booking.id, later.booking.id]);

    let all: Vec<Ulid> = engine
        .user_bookings(user, true)
        .await
        .into_iter()
        .map(|b| b.id)
        .collect();
    assert_eq!(all, vec![past.id, sooner.booking.id, later.booking.id]);
}

#[tokio::test]
async fn booking_stats_per_resource() {
    let f = scenario_a("stats.wal").await;
    let idle = add_resource(&f.engine, "Idle", 1).await;
    f.engine
        .cancel_booking(f.ids[3], Requester::Privileged)
        .await
        .unwrap();

    let stats = f.engine.booking_stats(Some(f.key.resource_id), None, None).await;
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].total, 3);
    assert_eq!(stats[0].confirmed, 2);
    assert_eq!(stats[0].waitlisted, 1);

    let outside = f
        .engine
        .booking_stats(None, Some(days_ahead(10)), None)
        .await;
    assert_eq!(outside.len(), 2);
    assert!(outside.iter().all(|s| s.total == 0));
    assert!(outside.iter().any(|s| s.resource_id == idle));
}

#[tokio::test]
async fn resource_schedule_covers_every_slot_in_range() {
    let engine = new_engine(test_wal_path("schedule.wal"));
    let r = add_resource(&engine, "Studio", 1).await;
    let (d1, d2) = (days_ahead(1), days_ahead(2));
    let me = Ulid::new();
    let mine = engine
        .create_booking(request(me, r, d1, 3))
        .await
        .unwrap()
        .booking;
    let queued = engine
        .create_booking(request(Ulid::new(), r, d1, 3))
        .await
        .unwrap()
        .booking;
    engine
        .create_booking(request(Ulid::new(), r, d2, 8))
        .await
        .unwrap();

    let schedule = engine.resource_schedule(r, d1, d2, Some(me)).await.unwrap();
    assert_eq!(schedule.len(), 16);
    assert_eq!(schedule[0].availability.key, SlotKey::new(r, d1, 1));
    assert_eq!(schedule[0].availability.available_spots, 1);

    let busy = &schedule[2];
    assert_eq!(busy.availability.key, SlotKey::new(r, d1, 3));
    assert_eq!(busy.availability.confirmed, 1);
    assert_eq!(busy.availability.waitlisted, 1);
    assert!(!busy.availability.is_available);
    assert_eq!(busy.availability.user_booking.as_ref(), Some(&mine));
    assert_eq!(
        busy.bookings.iter().map(|b| b.id).collect::<Vec<_>>(),
        vec![mine.id, queued.id]
    );

    let last = &schedule[15];
    assert_eq!(last.availability.key, SlotKey::new(r, d2, 8));
    assert_eq!(last.availability.confirmed, 1);
    assert_eq!(last.availability.user_booking, None);
    assert_eq!(schedule.iter().filter(|c| c.bookings.is_empty()).count(), 14);
}

#[tokio::test]
async fn resource_schedule_edges() {
    let engine = new_engine(test_wal_path("schedule_edges.wal"));
    let r = add_resource(&engine, "Darkroom", 2).await;
    let (d1, d2) = (days_ahead(1), days_ahead(2));

    assert!(engine.resource_schedule(r, d2, d1, None).await.unwrap().is_empty());
    let too_far = days_ahead(1 + crate::limits::MAX_SCHEDULE_DAYS);
    assert_eq!(
        engine.resource_schedule(r, d1, too_far, None).await.unwrap_err(),
        EngineError::LimitExceeded("schedule range too long")
    );
    let missing = Ulid::new();
    assert_eq!(
        engine
            .resource_schedule(missing, d1, d1, None)
            .await
            .unwrap_err(),
        EngineError::NotFound(missing)
    );

    engine.deactivate_resource(r).await.unwrap();
    let schedule = engine.resource_schedule(r, d1, d1, None).await.unwrap();
    assert_eq!(schedule.len(), 8);
    assert!(schedule.iter().all(|c| c.availability.can_book_more.is_none()));
}

#[tokio::test]
async fn resource_changes_notify_resource_topic() {
    let engine = new_engine(test_wal_path("notify_resource.wal"));
    let r = add_resource(&engine, "Forge", 2).await;
    let mut rx = engine.notify.subscribe(Topic::Resource(r));

    engine
        .upsert_resource(r, "Forge".into(), Some("Coal fired".into()), 4)
        .await
        .unwrap();
    engine.deactivate_resource(r).await.unwrap();
    engine.deactivate_resource(r).await.unwrap();

    match rx.recv().await.unwrap() {
        Notification::ResourceUpdated { resource } => {
            assert_eq!(resource.capacity, 4);
            assert!(resource.active);
        }
        other => panic!("unexpected {other:?}"),
    }
    match rx.recv().await.unwrap() {
        Notification::ResourceUpdated { resource } => assert!(!resource.active),
        other => panic!("unexpected {other:?}"),
    }
    assert!(rx.try_recv().is_err());
}

// ── Renumbering ──────────────────────────────────────────

#[tokio::test]
async fn renumber_repairs_gaps_and_is_idempotent() {
    let path = test_wal_path("renumber.wal");
    let resource = Ulid::new();
    let date = days_ahead(1);
    let key = SlotKey::new(resource, date, 2);
    let mk = |status, pos, created_at| Booking {
        id: Ulid::new(),
        user_id: Ulid::new(),
        resource_id: resource,
        date,
        slot: 2,
        status,
        waitlist_position: pos,
        created_at,
    };
    let confirmed = mk(BookingStatus::Confirmed, None, 1);
    let third = mk(BookingStatus::Waitlist, Some(5), 2);
    let first = mk(BookingStatus::Waitlist, Some(2), 3);
    let second = mk(BookingStatus::Waitlist, Some(2), 4);
    {
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&Event::ResourceUpserted {
            id: resource,
            name: "Gapped".into(),
            description: None,
            capacity: 1,
        })
        .unwrap();
        for b in [&confirmed, &third, &first, &second] {
            wal.append(&Event::BookingPlaced { booking: b.clone() })
                .unwrap();
        }
    }
    let engine = new_engine(path.clone());
    assert_eq!(engine.renumber_waitlist(key).await.unwrap(), 2);
    assert_eq!(engine.renumber_waitlist(key).await.unwrap(), 0);
    assert_eq!(
        engine.renumber_waitlist(SlotKey::new(resource, date, 3)).await.unwrap(),
        0
    );

    let order: Vec<(Ulid, Option<u32>)> = engine
        .slot_bookings(&key)
        .await
        .into_iter()
        .skip(1)
        .map(|b| (b.id, b.waitlist_position))
        .collect();
    assert_eq!(
        order,
        vec![(first.id, Some(1)), (second.id, Some(2)), (third.id, Some(3))]
    );
    drop(engine);

    let replayed = new_engine(path);
    assert_slot_invariants(&replayed, &key).await;
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_never_exceed_capacity() {
    let engine = Arc::new(new_engine(test_wal_path("concurrent_creates.wal")));
    let r = add_resource(&engine, "Hot desk", 3).await;
    let date = days_ahead(1);

    let mut handles = Vec::new();
    for _ in 0..24 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_booking(request(Ulid::new(), r, date, 1)).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let key = SlotKey::new(r, date, 1);
    let avail = engine.slot_availability(&key, None).await.unwrap();
    assert_eq!(avail.confirmed, 3);
    assert_eq!(avail.waitlisted, 21);
    assert_slot_invariants(&engine, &key).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cross_resource_requests_respect_limit() {
    let engine = Arc::new(new_engine(test_wal_path("concurrent_limit.wal")));
    let user = Ulid::new();
    let date = days_ahead(1);
    let mut resources = Vec::new();
    for i in 0..10 {
        resources.push(add_resource(&engine, &format!("Pod {i}"), 2).await);
    }

    let mut handles = Vec::new();
    for r in resources {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_booking(request(user, r, date, 8)).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e, EngineError::ConcurrentLimitExceeded(3)),
        }
    }
    assert_eq!(ok, 3);
    assert_eq!(engine.user_bookings(user, false).await.len(), 3);
    assert_eq!(engine.store.window_lock_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_same_key_requests_book_once() {
    let engine = Arc::new(new_engine(test_wal_path("concurrent_dup.wal")));
    let r = add_resource(&engine, "Sauna", 5).await;
    let user = Ulid::new();
    let date = days_ahead(1);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_booking(request(user, r, date, 2)).await
        }));
    }
    let mut ok = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert_eq!(e, EngineError::DuplicateBooking),
        }
    }
    assert_eq!(ok, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cancellations_promote_distinct_users() {
    let engine = Arc::new(new_engine(test_wal_path("concurrent_cancel.wal")));
    let r = add_resource(&engine, "Ferry", 2).await;
    let date = days_ahead(1);
    let key = SlotKey::new(r, date, 5);
    let mut ids = Vec::new();
    for _ in 0..8 {
        let out = engine
            .create_booking(request(Ulid::new(), r, date, 5))
            .await
            .unwrap();
        ids.push(out.booking.id);
    }

    let mut handles = Vec::new();
    for id in [ids[0], ids[1], ids[5]] {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.cancel_booking(id, Requester::Privileged).await
        }));
    }
    let mut promoted = Vec::new();
    for h in handles {
        if let Some(p) = h.await.unwrap().unwrap().promoted {
            promoted.push(p.id);
        }
    }
    promoted.sort();
    promoted.dedup();
    assert_eq!(promoted.len(), 2);

    let avail = engine.slot_availability(&key, None).await.unwrap();
    assert_eq!(avail.confirmed, 2);
    assert_eq!(avail.waitlisted, 3);
    assert_slot_invariants(&engine, &key).await;
}

// ── Retry ────────────────────────────────────────────────

#[tokio::test]
async fn retry_recovers_from_transient_conflicts() {
    let key = SlotKey::new(Ulid::new(), days_ahead(1), 1);
    let calls = std::sync::atomic::AtomicU32::new(0);
    let result = retry_on_conflict(3, "test", |exclusive| {
        let n = calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        async move {
            if n < 2 {
                assert!(!exclusive);
                Err(EngineError::WriteConflict(key))
            } else {
                assert!(exclusive);
                Ok(n)
            }
        }
    })
    .await;
    assert_eq!(result, Ok(2));
}

#[tokio::test]
async fn retry_gives_up_as_transient() {
    let key = SlotKey::new(Ulid::new(), days_ahead(1), 1);
    let calls = std::sync::atomic::AtomicU32::new(0);
    let result: Result<(), EngineError> = retry_on_conflict(3, "test", |_| {
        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        async move { Err(EngineError::WriteConflict(key)) }
    })
    .await;
    assert!(matches!(result, Err(EngineError::Transient(_))));
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);

    let other: Result<(), EngineError> =
        retry_on_conflict(3, "test", |_| async { Err(EngineError::DuplicateBooking) }).await;
    assert_eq!(other, Err(EngineError::DuplicateBooking));
}

#[tokio::test]
async fn stale_create_plan_fails_conditional_commit() {
    let engine = new_engine(test_wal_path("stale_create.wal"));
    let r = add_resource(&engine, "Kayak", 1).await;
    let date = days_ahead(1);
    let key = SlotKey::new(r, date, 6);
    let first = request(Ulid::new(), r, date, 6);
    let second = request(Ulid::new(), r, date, 6);
    let window = |req: &BookingRequest| UserWindow {
        user_id: req.user_id,
        date: req.date,
        slot: req.slot,
    };

    // Both decide against the empty slot.
    let plan_first = engine.plan_create(first, window(&first)).await.unwrap();
    let plan_second = engine.plan_create(second, window(&second)).await.unwrap();
    engine.commit_create(plan_first).await.unwrap();
    assert_eq!(
        engine.commit_create(plan_second).await.unwrap_err(),
        EngineError::WriteConflict(key)
    );
    assert_eq!(engine.slot_bookings(&key).await.len(), 1);
    assert!(engine.booking(&second.id).await.is_none());

    // Replanning sees the taken seat and queues.
    let out = engine.create_booking(second).await.unwrap();
    assert_eq!(out.booking.status, BookingStatus::Waitlist);
    assert_eq!(out.booking.waitlist_position, Some(1));
    assert_slot_invariants(&engine, &key).await;
}

#[tokio::test]
async fn stale_cancel_plans_cannot_promote_the_same_booking() {
    let f = scenario_a("stale_cancel.wal").await;
    let plan_a = f
        .engine
        .plan_cancel(f.ids[0], Requester::Privileged)
        .await
        .unwrap();
    let plan_b = f
        .engine
        .plan_cancel(f.ids[1], Requester::Privileged)
        .await
        .unwrap();

    let first = f.engine.commit_cancel(plan_a).await.unwrap();
    assert_eq!(first.promoted.unwrap().id, f.ids[2]);
    assert_eq!(
        f.engine.commit_cancel(plan_b).await.unwrap_err(),
        EngineError::WriteConflict(f.key)
    );
    assert_eq!(
        f.engine.booking(&f.ids[1]).await.unwrap().status,
        BookingStatus::Confirmed
    );

    let second = f
        .engine
        .cancel_booking(f.ids[1], Requester::Privileged)
        .await
        .unwrap();
    assert_eq!(second.promoted.unwrap().id, f.ids[3]);
    assert_slot_invariants(&f.engine, &f.key).await;
}

#[tokio::test]
async fn window_locks_do_not_outlive_requests() {
    let engine = new_engine(test_wal_path("window_locks.wal"));
    let r1 = add_resource(&engine, "Loom", 1).await;
    let r2 = add_resource(&engine, "Spindle", 1).await;
    let user = Ulid::new();
    let date = days_ahead(1);

    engine.create_booking(request(user, r1, date, 4)).await.unwrap();
    assert_eq!(
        engine
            .create_booking(request(user, r1, date, 4))
            .await
            .unwrap_err(),
        EngineError::DuplicateBooking
    );
    engine.set_setting("max_concurrent_bookings", 1).await.unwrap();
    assert_eq!(
        engine
            .create_booking(request(user, r2, date, 4))
            .await
            .unwrap_err(),
        EngineError::ConcurrentLimitExceeded(1)
    );
    for slot in 1..=3 {
        engine
            .create_booking(request(Ulid::new(), r2, date, slot))
            .await
            .unwrap();
    }
    assert_eq!(engine.store.window_lock_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slot_notifications_follow_commit_order() {
    let engine = Arc::new(new_engine(test_wal_path("notify_order.wal")));
    let r = add_resource(&engine, "Kiosk", 2).await;
    let date = days_ahead(1);
    let key = SlotKey::new(r, date, 7);
    let mut rx = engine.notify.subscribe(Topic::Slot(key));

    let n = 16;
    let mut handles = Vec::new();
    for _ in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_booking(request(Ulid::new(), r, date, 7)).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..n {
        match rx.recv().await.unwrap() {
            Notification::BookingCreated { booking, .. } => seen.push(booking.waitlist_position),
            other => panic!("unexpected {other:?}"),
        }
    }
    let expected: Vec<Option<u32>> = [None, None]
        .into_iter()
        .chain((1..=n as u32 - 2).map(Some))
        .collect();
    assert_eq!(seen, expected);
}

// ── WAL replay and compaction ────────────────────────────

#[tokio::test]
async fn replay_restores_positions_and_statuses() {
    let path = test_wal_path("replay.wal");
    let (key, before) = {
        let engine = new_engine(path.clone());
        let r = add_resource(&engine, "Replay", 2).await;
        let date = days_ahead(2);
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(
                engine
                    .create_booking(request(Ulid::new(), r, date, 1))
                    .await
                    .unwrap()
                    .booking
                    .id,
            );
        }
        engine.cancel_booking(ids[0], Requester::Privileged).await.unwrap();
        let key = SlotKey::new(r, date, 1);
        (key, engine.slot_bookings(&key).await)
    };

    let engine = new_engine(path);
    assert_eq!(engine.slot_bookings(&key).await, before);
    assert_slot_invariants(&engine, &key).await;
    // The queue tail carries on where it left off.
    let created = engine
        .create_booking(request(Ulid::new(), key.resource_id, key.date, 1))
        .await
        .unwrap();
    assert_eq!(created.booking.waitlist_position, Some(2));
}

#[tokio::test]
async fn torn_tail_does_not_swallow_later_commits() {
    use std::io::Write;

    let path = test_wal_path("torn_tail.wal");
    let r = {
        let engine = new_engine(path.clone());
        add_resource(&engine, "Plotter", 1).await
    };
    {
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        f.write_all(&[200u8, 0, 0, 0, 1, 2, 3]).unwrap();
    }

    let booked = {
        let engine = new_engine(path.clone());
        engine
            .create_booking(request(Ulid::new(), r, days_ahead(1), 2))
            .await
            .unwrap()
            .booking
    };

    let engine = new_engine(path);
    assert_eq!(engine.booking(&booked.id).await, Some(booked));
    assert_eq!(engine.resource(&r).unwrap().name, "Plotter");
}

#[tokio::test]
async fn compact_wal_preserves_state() {
    let path = test_wal_path("compact_state.wal");
    let engine = new_engine(path.clone());
    let r = add_resource(&engine, "Compact", 1).await;
    let date = days_ahead(1);
    let key = SlotKey::new(r, date, 4);
    engine.set_setting("max_concurrent_bookings", 2).await.unwrap();

    // Churn: book and cancel repeatedly.
    for _ in 0..10 {
        let user = Ulid::new();
        let b = engine.create_booking(request(user, r, date, 4)).await.unwrap();
        engine
            .cancel_booking(b.booking.id, Requester::User(user))
            .await
            .unwrap();
    }
    engine.create_booking(request(Ulid::new(), r, date, 4)).await.unwrap();
    engine.create_booking(request(Ulid::new(), r, date, 4)).await.unwrap();
    let before = engine.slot_bookings(&key).await;

    assert_eq!(engine.wal_appends_since_compact().await, 24);
    let size_before = std::fs::metadata(&path).unwrap().len();
    engine.compact_wal().await.unwrap();
    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(size_after < size_before);
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    assert_eq!(engine.slot_bookings(&key).await, before);

    engine.deactivate_resource(r).await.unwrap();
    drop(engine);

    let replayed = new_engine(path);
    assert_eq!(replayed.slot_bookings(&key).await, before);
    assert_eq!(replayed.max_concurrent_bookings(), 2);
    assert!(!replayed.resource(&r).unwrap().active);
}

#[tokio::test]
async fn group_commit_batches_concurrent_appends() {
    let path = test_wal_path("group_commit.wal");
    let engine = Arc::new(new_engine(path.clone()));
    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.upsert_resource(Ulid::new(), format!("R{i}"), None, 1).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_resources().len(), n);

    let replayed = new_engine(path);
    assert_eq!(replayed.list_resources().len(), n);
}
