//! Metric names and descriptions.
//!
//! Recorded through the `metrics` facade (`counter!`, `gauge!`). Without an
//! installed recorder every call is a no-op.
//!
//! # Naming
//!
//! - prefix: `reconhive_`
//! - suffix: `_total` for counters, nothing for gauges

// ─── label keys ────────────────────────────────────────────────────

/// Module label key
pub const LABEL_MODULE: &str = "module";

/// Event kind label key (URL, FINDING, ...)
pub const LABEL_KIND: &str = "kind";

// ─── dispatcher ────────────────────────────────────────────────────

/// Events accepted by the dispatcher (counter, label: kind)
pub const EVENTS_SUBMITTED_TOTAL: &str = "reconhive_events_submitted_total";

/// Handler invocations started (counter, label: module)
pub const EVENTS_DISPATCHED_TOTAL: &str = "reconhive_events_dispatched_total";

/// FINDING / VULNERABILITY events accepted (counter)
pub const FINDINGS_TOTAL: &str = "reconhive_findings_total";

/// Handler errors and panics (counter, label: module)
pub const MODULE_FAILURES_TOTAL: &str = "reconhive_module_failures_total";

/// Events in flight (gauge)
pub const EVENTS_IN_FLIGHT: &str = "reconhive_events_in_flight";

// ─── process sessions ──────────────────────────────────────────────

/// Tool sessions started (counter)
pub const PROCESS_SESSIONS_STARTED_TOTAL: &str = "reconhive_process_sessions_started_total";

/// Tool sessions force-killed after the grace period (counter)
pub const PROCESS_SESSIONS_KILLED_TOTAL: &str = "reconhive_process_sessions_killed_total";

/// Live tool sessions (gauge)
pub const PROCESS_SESSIONS_LIVE: &str = "reconhive_process_sessions_live";

// ─── lifecycle ─────────────────────────────────────────────────────

/// Scans that reached a terminal phase (counter, label: outcome)
pub const SCANS_COMPLETED_TOTAL: &str = "reconhive_scans_completed_total";

/// Outcome label key
pub const LABEL_OUTCOME: &str = "outcome";

/// Registers descriptions for every metric.
///
/// Call once after installing a recorder.
pub fn describe_metrics() {
    use metrics::{describe_counter, describe_gauge};

    describe_counter!(EVENTS_SUBMITTED_TOTAL, "Events accepted by the dispatcher");
    describe_counter!(EVENTS_DISPATCHED_TOTAL, "Module handler invocations started");
    describe_counter!(FINDINGS_TOTAL, "FINDING and VULNERABILITY events accepted");
    describe_counter!(MODULE_FAILURES_TOTAL, "Module handler errors and panics");
    describe_gauge!(EVENTS_IN_FLIGHT, "Events submitted but not fully handled");
    describe_counter!(PROCESS_SESSIONS_STARTED_TOTAL, "External tool sessions started");
    describe_counter!(
        PROCESS_SESSIONS_KILLED_TOTAL,
        "External tool sessions killed after the grace period"
    );
    describe_gauge!(PROCESS_SESSIONS_LIVE, "External tool sessions still running");
    describe_counter!(SCANS_COMPLETED_TOTAL, "Scans that reached a terminal phase");
}
