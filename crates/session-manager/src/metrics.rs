//! Refresh and retry metrics
//!
//! Recorded through the `metrics` facade; the gateway installs the
//! Prometheus recorder. Without a recorder these calls are no-ops.
//!
//! - `session_refresh_total` (counter): label `outcome` (`success`, `failure`, `discarded`)
//! - `session_refresh_waiters` (histogram): callers served by one refresh
//! - `session_retries_total` (counter): requests retried after a 401

/// Record the outcome of one refresh exchange and how many callers it served.
pub fn record_refresh(outcome: &'static str, waiters: usize) {
    metrics::counter!("session_refresh_total", "outcome" => outcome).increment(1);
    metrics::histogram!("session_refresh_waiters").record(waiters as f64);
}

/// Record one retry after an authorization failure.
pub fn record_retry() {
    metrics::counter!("session_retries_total").increment(1);
}
