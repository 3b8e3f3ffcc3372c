use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fleetline_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fleetline_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "fleetline_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "fleetline_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fleetline_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "fleetline_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fleetline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fleetline_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const COMPACTIONS_TOTAL: &str = "fleetline_compactions_total";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: writes rejected by an overlapping row.
pub const CONFLICTS_TOTAL: &str = "fleetline_conflicts_total";

/// Counter: assignment lifecycle events. Labels: outcome.
pub const ASSIGNMENTS_TOTAL: &str = "fleetline_assignments_total";

/// Counter: rental creation attempts. Labels: outcome.
pub const RENTALS_TOTAL: &str = "fleetline_rentals_total";

/// Counter: rental status changes. Labels: to.
pub const RENTAL_TRANSITIONS_TOTAL: &str = "fleetline_rental_transitions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::RegisterVehicle(_) => "register_vehicle",
        Command::RecordMileage { .. } => "record_mileage",
        Command::ArchiveVehicle { .. } => "archive_vehicle",
        Command::UpsertCustomer(_) => "upsert_customer",
        Command::OpenState { .. } => "open_state",
        Command::CloseState { .. } => "close_state",
        Command::Assign(_) => "assign",
        Command::AssignMany(_) => "assign_many",
        Command::ExtendAssignment { .. } => "extend_assignment",
        Command::RevokeAssignment { .. } => "revoke_assignment",
        Command::CloseAssignment { .. } => "close_assignment",
        Command::CreateBlock(_) => "create_block",
        Command::FinishBlock { .. } => "finish_block",
        Command::CreateRental(_) => "create_rental",
        Command::AmendRental { .. } => "amend_rental",
        Command::TransitionRental { .. } => "transition_rental",
        Command::SetFinalAmount { .. } => "set_final_amount",
        Command::SnapshotFee { .. } => "snapshot_fee",
        Command::AddCharge { .. } => "add_charge",
        Command::SetFeeRate(_) => "set_fee_rate",
        Command::CreatePriceList(_) => "create_pricelist",
        Command::AddSeason { .. } => "add_season",
        Command::AddTier { .. } => "add_tier",
        Command::SetPriceListStatus { .. } => "set_pricelist_status",
        Command::SelectVehicles { .. } => "select_vehicles",
        Command::SelectCustomers { .. } => "select_customers",
        Command::SelectStates { .. } => "select_states",
        Command::SelectAssignments { .. } => "select_assignments",
        Command::SelectBlocks { .. } => "select_blocks",
        Command::SelectRentals { .. } => "select_rentals",
        Command::SelectCharges { .. } => "select_charges",
        Command::SelectPriceLists { .. } => "select_pricelists",
        Command::SelectSeasons { .. } => "select_seasons",
        Command::SelectTiers { .. } => "select_tiers",
        Command::SelectQuote { .. } => "select_quote",
        Command::SelectContractLedger { .. } => "select_contract_ledger",
        Command::SelectFeeRates { .. } => "select_fee_rates",
        Command::SelectConflicts { .. } => "select_conflicts",
    }
}
