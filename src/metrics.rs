//! Prometheus metrics for the session pool and command dispatch
//!
//! All metrics live in the default registry and are served on `/metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram,
    register_histogram_vec, Counter, CounterVec, Encoder, Gauge, Histogram, HistogramVec,
    TextEncoder,
};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Session Pool Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Sessions the pool is accountable for (idle + leased + opening).
    pub static ref POOL_LIVE_SESSIONS: Gauge = register_gauge!(
        "scvmm_pool_live_sessions",
        "Live remote sessions in the pool"
    ).expect("failed to register POOL_LIVE_SESSIONS metric");

    /// Sessions waiting in the idle queue.
    pub static ref POOL_IDLE_SESSIONS: Gauge = register_gauge!(
        "scvmm_pool_idle_sessions",
        "Idle remote sessions ready for a command"
    ).expect("failed to register POOL_IDLE_SESSIONS metric");

    /// Sessions currently leased to a command.
    pub static ref POOL_BORROWED_SESSIONS: Gauge = register_gauge!(
        "scvmm_pool_borrowed_sessions",
        "Remote sessions currently leased"
    ).expect("failed to register POOL_BORROWED_SESSIONS metric");

    /// Time spent waiting for a session lease.
    pub static ref SESSION_ACQUIRE_DURATION: Histogram = register_histogram!(
        "scvmm_session_acquire_duration_seconds",
        "Time to acquire a session from the pool",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]
    ).expect("failed to register SESSION_ACQUIRE_DURATION metric");

    pub static ref SESSIONS_OPENED_TOTAL: Counter = register_counter!(
        "scvmm_sessions_opened_total",
        "Remote sessions opened"
    ).expect("failed to register SESSIONS_OPENED_TOTAL metric");

    /// Sessions thrown away after a connection-level failure.
    pub static ref SESSIONS_DISCARDED_TOTAL: Counter = register_counter!(
        "scvmm_sessions_discarded_total",
        "Remote sessions discarded as unusable"
    ).expect("failed to register SESSIONS_DISCARDED_TOTAL metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Dispatch Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Dispatches by command and outcome.
    ///
    /// Labels:
    /// - command: "list", "start", "save", "shutdown", "poweroff"
    /// - outcome: "ok", "partial", "submitted", "template_unavailable",
    ///   "invalid_argument", "unavailable", "timeout", "upstream_error"
    pub static ref DISPATCH_TOTAL: CounterVec = register_counter_vec!(
        "scvmm_dispatch_total",
        "Command dispatches by outcome",
        &["command", "outcome"]
    ).expect("failed to register DISPATCH_TOTAL metric");

    /// Remote execution time, measured until the host answers.
    pub static ref INVOKE_DURATION: HistogramVec = register_histogram_vec!(
        "scvmm_invoke_duration_seconds",
        "Remote command execution time",
        &["command"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 60.0]
    ).expect("failed to register INVOKE_DURATION metric");
}

/// Render the default registry in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
