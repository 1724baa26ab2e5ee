//! Firestore client metrics.
//!
//! Standardized metrics for monitoring the client:
//! - Request counters and latency by method and status code
//! - Retry counters
//! - Transaction attempts and outcomes
//! - Bulk writer throughput and current rate limit
//! - Client pool size

use metrics::{counter, gauge, histogram};

// =============================================================================
// Metric Names
// =============================================================================

/// Metric name constants for consistency.
pub mod names {
    /// Total Firestore requests by method and status code.
    pub const REQUESTS_TOTAL: &str = "firestore_requests_total";

    /// Total retry attempts by operation.
    pub const RETRIES_TOTAL: &str = "firestore_retries_total";

    /// Request latency in seconds by method.
    pub const LATENCY_SECONDS: &str = "firestore_latency_seconds";

    /// Transaction attempts by outcome (committed, retried, failed).
    pub const TRANSACTION_ATTEMPTS_TOTAL: &str = "firestore_transaction_attempts_total";

    /// Bulk writer operations by outcome (success, retry, failure).
    pub const BULK_WRITER_OPS_TOTAL: &str = "firestore_bulk_writer_ops_total";

    /// Current bulk writer rate limit in operations per second.
    pub const BULK_WRITER_RATE: &str = "firestore_bulk_writer_ops_per_second";

    /// Number of transport clients in the pool.
    pub const POOL_CLIENTS: &str = "firestore_pool_clients";
}

// =============================================================================
// Recording Functions
// =============================================================================

/// Record metrics for a completed request.
pub fn record_request(method: &str, status: &str, latency_ms: f64) {
    counter!(
        names::REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        names::LATENCY_SECONDS,
        "method" => method.to_string()
    )
    .record(latency_ms / 1000.0);
}

/// Record a retry attempt.
pub fn record_retry(operation: &str) {
    counter!(
        names::RETRIES_TOTAL,
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record the end of one transaction attempt.
pub fn record_transaction_attempt(outcome: &'static str) {
    counter!(names::TRANSACTION_ATTEMPTS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record bulk writer operation outcomes.
pub fn record_bulk_writer_ops(outcome: &'static str, count: u64) {
    counter!(names::BULK_WRITER_OPS_TOTAL, "outcome" => outcome).increment(count);
}

/// Publish the bulk writer's current rate limit.
pub fn record_bulk_writer_rate(ops_per_second: f64) {
    gauge!(names::BULK_WRITER_RATE).set(ops_per_second);
}

/// Publish the current pool size.
pub fn record_pool_size(clients: usize) {
    gauge!(names::POOL_CLIENTS).set(clients as f64);
}

// =============================================================================
// Tests
// =============================================================================
