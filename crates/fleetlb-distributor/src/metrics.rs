//! Metrics for the distributor engine.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `fleetlb_distributors` | Gauge | - | Live distributors in the registry |
//! | `fleetlb_distributor_registered_slots` | Gauge | `lb_id` | Bound slots per distributor |
//! | `fleetlb_distributor_operations_total` | Counter | `operation`, `result` | Engine operations |
//! | `fleetlb_distributor_failures_total` | Counter | `operation`, `kind` | Failures by kind |
//!
//! Metrics go through the `metrics` facade; without an installed recorder
//! every call is a no-op.

use metrics::{counter, gauge};

use crate::error::ErrorKind;

/// Metric names as constants for consistency.
pub mod names {
    /// Gauge: live distributors.
    pub const DISTRIBUTORS: &str = "fleetlb_distributors";
    /// Gauge: bound slots per distributor.
    pub const REGISTERED_SLOTS: &str = "fleetlb_distributor_registered_slots";
    /// Counter: engine operations.
    pub const OPERATIONS_TOTAL: &str = "fleetlb_distributor_operations_total";
    /// Counter: engine failures.
    pub const FAILURES_TOTAL: &str = "fleetlb_distributor_failures_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Engine operation name.
    pub const OPERATION: &str = "operation";
    /// Operation result (ok, error).
    pub const RESULT: &str = "result";
    /// Failure kind (usage, limit, instance, fatal).
    pub const KIND: &str = "kind";
    /// Load balancer id.
    pub const LB_ID: &str = "lb_id";
}

/// Records distributor engine metrics.
#[derive(Debug, Clone, Default)]
pub struct DistributorMetrics;

impl DistributorMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Sets the live distributor gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_distributors(&self, count: usize) {
        gauge!(names::DISTRIBUTORS).set(count as f64);
    }

    /// Sets the bound slot gauge of one distributor.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_registered_slots(&self, lb_id: &str, count: usize) {
        gauge!(names::REGISTERED_SLOTS, labels::LB_ID => lb_id.to_string()).set(count as f64);
    }

    /// Records a successful operation.
    pub fn record_success(&self, operation: &'static str) {
        counter!(
            names::OPERATIONS_TOTAL,
            labels::OPERATION => operation,
            labels::RESULT => "ok",
        )
        .increment(1);
    }

    /// Records a failed operation.
    pub fn record_failure(&self, operation: &'static str, kind: ErrorKind) {
        counter!(
            names::OPERATIONS_TOTAL,
            labels::OPERATION => operation,
            labels::RESULT => "error",
        )
        .increment(1);
        counter!(
            names::FAILURES_TOTAL,
            labels::OPERATION => operation,
            labels::KIND => kind.as_str(),
        )
        .increment(1);
    }
}
