//! Prometheus metrics for the sync agent.
//!
//! All metrics use the default Prometheus registry:
//! - Histograms: *_seconds (for latency)
//! - Counters: *_total (for counts)

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

lazy_static! {
    // ==================== LATENCY METRICS ====================

    pub static ref REMOTE_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "sync_agent_remote_call_duration_seconds",
        "Time spent in remote sink calls",
        &["operation", "status"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .unwrap();
    pub static ref CHECKPOINT_DURATION: HistogramVec = register_histogram_vec!(
        "sync_agent_checkpoint_duration_seconds",
        "Time spent persisting watermarks and stamps",
        &["operation"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    )
    .unwrap();

    // ==================== ERROR COUNTERS ====================
    pub static ref PARSE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sync_agent_parse_errors_total",
        "Log lines skipped by error type",
        &["error_type"]
    )
    .unwrap();
    pub static ref DELIVERY_RETRIES_TOTAL: IntCounter = register_int_counter!(
        "sync_agent_delivery_retries_total",
        "Delivery attempts that failed and were retried"
    )
    .unwrap();
    pub static ref DELIVERY_FAILURES_TOTAL: IntCounter = register_int_counter!(
        "sync_agent_delivery_failures_total",
        "Drain cycles whose delivery exhausted every retry"
    )
    .unwrap();
    pub static ref CHECKPOINT_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sync_agent_checkpoint_errors_total",
        "Watermark and stamp journal write errors",
        &["operation"]
    )
    .unwrap();

    // ==================== THROUGHPUT METRICS ====================
    pub static ref RECORDS_DETECTED_TOTAL: IntCounter = register_int_counter!(
        "sync_agent_records_detected_total",
        "Valid records read past the watermark"
    )
    .unwrap();
    pub static ref RECORDS_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        "sync_agent_records_delivered_total",
        "Records confirmed delivered and committed"
    )
    .unwrap();
    pub static ref CHANGE_NOTIFICATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "sync_agent_change_notifications_total",
        "Change notifications by outcome",
        &["outcome"]
    )
    .unwrap();

    // ==================== GAUGE METRICS ====================
    pub static ref WATERMARK_LINE: IntGauge = register_int_gauge!(
        "sync_agent_watermark_line",
        "Line count of the last committed watermark"
    )
    .unwrap();
}
