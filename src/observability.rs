use std::net::SocketAddr;

use anyhow::Context;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: commands executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "rental_commands_total";

/// Histogram: command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "rental_command_duration_seconds";

/// Counter: pending reservations placed.
pub const RESERVATIONS_CREATED_TOTAL: &str = "rental_reservations_created_total";

/// Counter: confirmation attempts. Labels: outcome.
pub const CONFIRMATIONS_TOTAL: &str = "rental_confirmations_total";

/// Counter: requests refused for lack of stock. Labels: stage (create, confirm).
pub const CAPACITY_REJECTIONS_TOTAL: &str = "rental_capacity_rejections_total";

/// Counter: notifications that were not delivered. Labels: kind.
pub const DISPATCH_FAILURES_TOTAL: &str = "rental_dispatch_failures_total";

/// Counter: commands refused by the per-IP limiter.
pub const RATE_LIMITED_TOTAL: &str = "rental_rate_limited_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "rental_connections_active";
pub const CONNECTIONS_TOTAL: &str = "rental_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "rental_connections_rejected_total";

/// Gauge: tenants with a loaded engine.
pub const TENANTS_ACTIVE: &str = "rental_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rental_wal_flush_duration_seconds";

/// Histogram: events per WAL flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "rental_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> anyhow::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus metrics exporter")?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::Use { .. } => "use",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
        Command::InsertTenant { .. } => "insert_tenant",
        Command::DeleteTenant { .. } => "delete_tenant",
        Command::UpdateSettings { .. } => "update_settings",
        Command::InsertItem { .. } => "insert_item",
        Command::DeleteItem { .. } => "delete_item",
        Command::SelectItems => "select_items",
        Command::SelectSlots => "select_slots",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectReservations { .. } => "select_reservations",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::InsertConfirmation { .. } => "insert_confirmation",
        Command::InsertStatusChange { .. } => "insert_status_change",
        Command::InsertPayment { .. } => "insert_payment",
        Command::InsertLinkRequest { .. } => "insert_link_request",
        Command::DeleteReservation { .. } => "delete_reservation",
    }
}
