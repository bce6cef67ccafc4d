use std::net::SocketAddr;

use crate::wire::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests executed. Labels: command, status.
pub const REQUESTS_TOTAL: &str = "roomdesk_requests_total";

/// Histogram: request latency in seconds. Labels: command.
pub const REQUEST_DURATION_SECONDS: &str = "roomdesk_request_duration_seconds";

/// Counter: notification publish attempts. Labels: status.
pub const NOTIFICATIONS_TOTAL: &str = "roomdesk_notifications_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomdesk_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomdesk_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomdesk_connections_rejected_total";

/// Gauge: live rooms.
pub const ROOMS_ACTIVE: &str = "roomdesk_rooms_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomdesk_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomdesk_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::CreateRoom { .. } => "create_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::CreateBooking { .. } => "create_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::RescheduleBooking { .. } => "reschedule_booking",
        Command::ApproveBooking { .. } => "approve_booking",
        Command::DeclineBooking { .. } => "decline_booking",
        Command::CancelBookingWithReason { .. } => "cancel_booking_with_reason",
        Command::GetRoom { .. } => "get_room",
        Command::AllRooms => "all_rooms",
        Command::RoomsByType { .. } => "rooms_by_type",
        Command::AvailableRooms { .. } => "available_rooms",
        Command::BookingsByUser { .. } => "bookings_by_user",
        Command::GetBooking { .. } => "get_booking",
    }
}
