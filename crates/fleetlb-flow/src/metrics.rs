//! Metrics for flow execution.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `fleetlb_flow_task_executions_total` | Counter | `task`, `outcome` | Task executions |
//! | `fleetlb_flow_task_reverts_total` | Counter | `task`, `outcome` | Task reverts |
//! | `fleetlb_flow_duration_seconds` | Histogram | `flow`, `outcome` | Flow run duration |
//! | `fleetlb_flow_decisions_total` | Counter | `decision`, `branch` | Decision branches taken |
//! | `fleetlb_flow_spare_amphorae` | Gauge | - | Spare pool size after a fill |

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use crate::task::RevertOutcome;

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: task executions.
    pub const TASK_EXECUTIONS_TOTAL: &str = "fleetlb_flow_task_executions_total";
    /// Counter: task reverts.
    pub const TASK_REVERTS_TOTAL: &str = "fleetlb_flow_task_reverts_total";
    /// Histogram: flow run duration in seconds.
    pub const FLOW_DURATION_SECONDS: &str = "fleetlb_flow_duration_seconds";
    /// Counter: decision branches taken.
    pub const DECISIONS_TOTAL: &str = "fleetlb_flow_decisions_total";
    /// Gauge: spare amphorae.
    pub const SPARE_AMPHORAE: &str = "fleetlb_flow_spare_amphorae";
}

/// Label keys used across metrics.
pub mod labels {
    /// Task name.
    pub const TASK: &str = "task";
    /// Flow name.
    pub const FLOW: &str = "flow";
    /// Outcome (success, failure, or a revert outcome).
    pub const OUTCOME: &str = "outcome";
    /// Decision name.
    pub const DECISION: &str = "decision";
    /// Branch taken (true, false).
    pub const BRANCH: &str = "branch";
}

/// Records flow engine metrics.
#[derive(Debug, Clone, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records one task execution.
    pub fn record_execution(&self, task: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        counter!(
            names::TASK_EXECUTIONS_TOTAL,
            labels::TASK => task.to_string(),
            labels::OUTCOME => outcome,
        )
        .increment(1);
    }

    /// Records one task revert.
    pub fn record_revert(&self, task: &str, outcome: RevertOutcome) {
        counter!(
            names::TASK_REVERTS_TOTAL,
            labels::TASK => task.to_string(),
            labels::OUTCOME => outcome.as_str(),
        )
        .increment(1);
    }

    /// Records a finished flow run.
    pub fn observe_flow(&self, flow: &str, success: bool, elapsed: Duration) {
        let outcome = if success { "success" } else { "failure" };
        histogram!(
            names::FLOW_DURATION_SECONDS,
            labels::FLOW => flow.to_string(),
            labels::OUTCOME => outcome,
        )
        .record(elapsed.as_secs_f64());
    }

    /// Records a decision branch.
    pub fn record_decision(&self, decision: &str, taken: bool) {
        counter!(
            names::DECISIONS_TOTAL,
            labels::DECISION => decision.to_string(),
            labels::BRANCH => if taken { "true" } else { "false" },
        )
        .increment(1);
    }

    /// Sets the spare pool gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn set_spare_amphorae(&self, count: usize) {
        gauge!(names::SPARE_AMPHORAE).set(count as f64);
    }
}
