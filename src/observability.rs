use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

// ── Allocation outcomes ─────────────────────────────────────────

/// Counter: bookings created. Labels: status (confirmed, waitlist).
pub const BOOKINGS_CREATED_TOTAL: &str = "slotbook_bookings_created_total";

/// Counter: bookings cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "slotbook_bookings_cancelled_total";

/// Counter: waitlisted bookings promoted to confirmed.
pub const WAITLIST_PROMOTIONS_TOTAL: &str = "slotbook_waitlist_promotions_total";

/// Counter: creations rejected by the per-user concurrent limit.
pub const CONCURRENT_LIMIT_REJECTIONS_TOTAL: &str = "slotbook_concurrent_limit_rejections_total";

/// Counter: conditional commits retried after a version mismatch. Labels: op.
pub const WRITE_CONFLICTS_TOTAL: &str = "slotbook_write_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertResource { .. } => "upsert_resource",
        Command::DeactivateResource { .. } => "deactivate_resource",
        Command::SelectResources { .. } => "select_resources",
        Command::InsertBooking { .. } => "insert_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectBookingById { .. } => "select_booking",
        Command::SelectUserBookings { .. } => "select_user_bookings",
        Command::SelectSlotBookings { .. } => "select_slot_bookings",
        Command::SelectSlotAvailability { .. } => "select_slot_availability",
        Command::SelectBookingStats { .. } => "select_booking_stats",
        Command::SelectResourceSchedule { .. } => "select_resource_schedule",
        Command::SelectSlotTimes => "select_slot_times",
        Command::SetSetting { .. } => "set_setting",
        Command::SelectSettings => "select_settings",
    }
}
