use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "ratebook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "ratebook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "ratebook_connections_active";
pub const CONNECTIONS_TOTAL: &str = "ratebook_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "ratebook_connections_rejected_total";

pub const WAL_FLUSH_DURATION_SECONDS: &str = "ratebook_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "ratebook_wal_flush_batch_size";

// ── Timeline metrics ────────────────────────────────────────────

pub const RATES_CREATED_TOTAL: &str = "ratebook_rates_created_total";

/// Counter: active rates retired by a split.
pub const SPLITS_TOTAL: &str = "ratebook_splits_total";

/// Counter: adjacent pairs collapsed by merge sweeps.
pub const MERGES_TOTAL: &str = "ratebook_merges_total";

pub const QUOTES_TOTAL: &str = "ratebook_quotes_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertRate { .. } => "insert_rate",
        Command::BatchInsertRates { .. } => "batch_insert_rates",
        Command::UpdateRate { .. } => "update_rate",
        Command::CloseRate { .. } => "close_rate",
        Command::DeleteRate { .. } => "delete_rate",
        Command::SelectRates { .. } => "select_rates",
        Command::SelectQuote { .. } => "select_quote",
        Command::ExportRates { .. } => "export_rates",
        Command::ImportRates { .. } => "import_rates",
    }
}
