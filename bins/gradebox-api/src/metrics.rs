// Prometheus counters exposed on GET /metrics
use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

lazy_static! {
    pub static ref SUBMISSIONS: IntCounterVec = register_int_counter_vec!(
        "gradebox_submissions_total",
        "Submissions received, by outcome",
        &["outcome"]
    )
    .expect("submissions counter registers once");
    pub static ref POLLS: IntCounterVec = register_int_counter_vec!(
        "gradebox_polls_total",
        "Status polls, by resulting submission status",
        &["status"]
    )
    .expect("polls counter registers once");
}

/// Request was refused by validation
pub const OUTCOME_REJECTED: &str = "rejected";
/// Request was valid but could not be stored or queued
pub const OUTCOME_FAILED: &str = "failed";
pub const OUTCOME_ACCEPTED: &str = "accepted";

pub fn record_submission(outcome: &str) {
    SUBMISSIONS.with_label_values(&[outcome]).inc();
}

pub fn record_poll(status: &str) {
    POLLS.with_label_values(&[status]).inc();
}

/// Render every registered metric in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
