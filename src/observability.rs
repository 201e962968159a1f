use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking creation requests. Labels: outcome.
pub const BOOKINGS_REQUESTED_TOTAL: &str = "labbook_bookings_requested_total";

/// Counter: lifecycle transitions applied. Labels: action.
pub const TRANSITIONS_TOTAL: &str = "labbook_transitions_total";

/// Counter: conflicts detected (creation, edit, recurrence).
pub const CONFLICTS_DETECTED_TOTAL: &str = "labbook_conflicts_detected_total";

/// Counter: policy violations raised. Labels: rule.
pub const POLICY_VIOLATIONS_TOTAL: &str = "labbook_policy_violations_total";

/// Counter: recurrence occurrences skipped due to conflicts.
pub const RECURRENCE_SKIPS_TOTAL: &str = "labbook_recurrence_skips_total";

/// Counter: approved bookings auto-completed by the sweeper.
pub const SWEEPER_COMPLETIONS_TOTAL: &str = "labbook_sweeper_completions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "labbook_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (entries per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "labbook_journal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is
/// None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Install the default fmt tracing subscriber. Embedding applications that
/// bring their own subscriber should skip this.
pub fn init_tracing() {
    tracing_subscriber::fmt::init();
}
