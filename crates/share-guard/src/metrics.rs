use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, HistogramOpts, HistogramVec, TextEncoder};

use crate::error::Result;

lazy_static! {
    pub static ref SHARES_SUBMITTED: Counter = Counter::new(
        "share_guard_shares_submitted_total",
        "Total number of shares submitted for validation"
    ).expect("valid metric definition");

    pub static ref SHARES_ACCEPTED: Counter = Counter::new(
        "share_guard_shares_accepted_total",
        "Total number of shares accepted"
    ).expect("valid metric definition");

    pub static ref SHARES_REJECTED: Counter = Counter::new(
        "share_guard_shares_rejected_total",
        "Total number of shares rejected"
    ).expect("valid metric definition");

    pub static ref VALIDATION_ERRORS: Counter = Counter::new(
        "share_guard_errors_total",
        "Total number of validations that ended in a stage timeout or failure"
    ).expect("valid metric definition");

    pub static ref FRAUD_REPORTS: Counter = Counter::new(
        "share_guard_fraud_reports_total",
        "Total number of fraud detections"
    ).expect("valid metric definition");

    pub static ref STAGE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("share_guard_stage_duration_seconds", "Time spent in each pipeline stage"),
        &["stage"]
    ).expect("valid metric definition");
}

pub fn register_metrics() -> Result<()> {
    prometheus::register(Box::new(SHARES_SUBMITTED.clone()))?;
    prometheus::register(Box::new(SHARES_ACCEPTED.clone()))?;
    prometheus::register(Box::new(SHARES_REJECTED.clone()))?;
    prometheus::register(Box::new(VALIDATION_ERRORS.clone()))?;
    prometheus::register(Box::new(FRAUD_REPORTS.clone()))?;
    prometheus::register(Box::new(STAGE_DURATION.clone()))?;
    Ok(())
}

pub fn metrics_handler() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
