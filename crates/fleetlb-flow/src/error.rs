//! Error types for the orchestration domain.

use crate::drivers::DriverError;

/// The result type used throughout fleetlb-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or running flows.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A flow needs store values nothing seeds or provides.
    #[error("flow '{flow}' has unsatisfied requirements: {missing:?}")]
    UnsatisfiedRequirements {
        /// The flow or task whose inputs are missing.
        flow: String,
        /// Store names nothing provides.
        missing: Vec<String>,
    },

    /// Two branches of a parallel flow provide the same store name.
    #[error("parallel flow '{flow}' provides '{name}' from more than one branch")]
    ParallelConflict {
        /// The parallel flow.
        flow: String,
        /// The contested store name.
        name: String,
    },

    /// A decision branch does not provide every declared output.
    #[error("decision '{decision}' branch '{branch}' does not provide {missing:?}")]
    MismatchedDecisionOutputs {
        /// The decision node.
        decision: String,
        /// Which branch (`true` or `false`).
        branch: &'static str,
        /// Declared outputs the branch does not provide.
        missing: Vec<String>,
    },

    /// A decision reads a value its predecessor does not provide.
    #[error("decision '{decision}' reads '{key}' which its predecessor does not provide")]
    UndeclaredDecisionKey {
        /// The decision node.
        decision: String,
        /// The store name.
        key: String,
    },

    /// A task read a store value that is not present.
    #[error("store value '{name}' is missing")]
    MissingValue {
        /// The store name.
        name: String,
    },

    /// A store value has a different type than the reader expects.
    #[error("store value '{name}' is not a {expected}")]
    TypeMismatch {
        /// The store name.
        name: String,
        /// The expected Rust type.
        expected: &'static str,
    },

    /// A task failed; the flow reverted what had already run.
    #[error("task '{task}' failed: {source}")]
    TaskFailed {
        /// The failed task.
        task: String,
        /// The original failure.
        #[source]
        source: Box<Error>,
    },

    /// A compute instance went to ERROR while building.
    #[error("compute instance {compute_id} failed to build")]
    ComputeBuild {
        /// The compute instance.
        compute_id: String,
    },

    /// A compute instance did not become ACTIVE within the retry bound.
    #[error("compute instance {compute_id} not active after {attempts} attempts")]
    ComputeWaitTimeout {
        /// The compute instance.
        compute_id: String,
        /// Polls performed.
        attempts: u32,
    },

    /// Ports stayed attached past the detach timeout.
    #[error("ports of compute instance {compute_id} still attached after {timeout_secs}s: {ports:?}")]
    PortDetachTimeout {
        /// The compute instance.
        compute_id: String,
        /// The configured timeout in seconds.
        timeout_secs: u64,
        /// Ports still attached.
        ports: Vec<String>,
    },

    /// A request was rejected before any flow ran.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Why the request was rejected.
        message: String,
    },

    /// Configuration is malformed or incomplete.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },

    /// An internal invariant was violated.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the problem.
        message: String,
    },

    /// A repository operation failed.
    #[error("repository error: {0}")]
    Repository(#[from] fleetlb_core::Error),

    /// A compute, network, amphora or certificate driver failed.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// The distributor rejected an operation.
    #[error("distributor error: {0}")]
    Distributor(#[from] fleetlb_distributor::Error),
}

impl Error {
    /// Creates a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates an invalid request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns the innermost error, unwrapping task failures.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::TaskFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns the name of the task that failed, if any.
    #[must_use]
    pub fn failed_task(&self) -> Option<&str> {
        match self {
            Self::TaskFailed { task, .. } => Some(task),
            _ => None,
        }
    }
}
