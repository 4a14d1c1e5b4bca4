//! Error types for the distributor engine.
//!
//! Engine failures are reported as [`Error`], whose [`ErrorKind`] tells the
//! caller how to react. Raw switch command failures are [`SwitchError`]s and
//! are classified by the engine according to where they happened.

use fleetlb_core::LoadBalancerId;

/// The result type used throughout fleetlb-distributor.
pub type Result<T> = std::result::Result<T, Error>;

/// The result type of switch commands.
pub type SwitchResult<T> = std::result::Result<T, SwitchError>;

/// How a caller should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input. Safe to retry with corrected input.
    Usage,
    /// A capacity ceiling was reached. Free resources before retrying.
    Limit,
    /// One distributor is broken. Recycle its load balancer.
    Instance,
    /// The engine itself is suspect. Recycle the process.
    Fatal,
}

impl ErrorKind {
    /// Returns the kind as a metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Usage => "usage",
            Self::Limit => "limit",
            Self::Instance => "instance",
            Self::Fatal => "fatal",
        }
    }
}

/// A switch command failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("switch command `{command}` failed: {message}")]
pub struct SwitchError {
    /// The command that failed.
    pub command: String,
    /// Failure output.
    pub message: String,
}

impl SwitchError {
    /// Creates a new switch error.
    #[must_use]
    pub fn new(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            message: message.into(),
        }
    }
}

/// Errors reported by the distributor engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request was malformed or cannot be satisfied as given.
    #[error("usage error: {message}")]
    Usage {
        /// What was wrong with the request.
        message: String,
    },

    /// No distributor exists for the load balancer.
    #[error("no distributor for load balancer {lb_id}")]
    NotFound {
        /// The load balancer that was looked up.
        lb_id: LoadBalancerId,
    },

    /// A capacity ceiling was reached.
    #[error("limit reached: {message}")]
    Limit {
        /// Which ceiling was hit.
        message: String,
    },

    /// One distributor is broken.
    #[error("distributor for load balancer {lb_id} failed: {message}")]
    Instance {
        /// The affected load balancer.
        lb_id: LoadBalancerId,
        /// Description of the failure.
        message: String,
        /// The switch failure behind it, if any.
        #[source]
        source: Option<SwitchError>,
    },

    /// Bridge metadata could not be decoded.
    #[error("corrupt metadata on bridge {bridge}: {message}")]
    CorruptMetadata {
        /// The bridge carrying the metadata.
        bridge: String,
        /// What could not be decoded.
        message: String,
    },

    /// The engine is unusable.
    #[error("fatal distributor engine error: {message}")]
    Fatal {
        /// Description of the failure.
        message: String,
        /// The switch failure behind it, if any.
        #[source]
        source: Option<SwitchError>,
    },
}

impl Error {
    /// Creates a usage error.
    #[must_use]
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    /// Creates a limit error.
    #[must_use]
    pub fn limit(message: impl Into<String>) -> Self {
        Self::Limit {
            message: message.into(),
        }
    }

    /// Creates an instance error.
    #[must_use]
    pub fn instance(
        lb_id: LoadBalancerId,
        message: impl Into<String>,
        source: Option<SwitchError>,
    ) -> Self {
        Self::Instance {
            lb_id,
            message: message.into(),
            source,
        }
    }

    /// Creates a fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>, source: Option<SwitchError>) -> Self {
        Self::Fatal {
            message: message.into(),
            source,
        }
    }

    /// Returns how a caller should react to this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Usage { .. } | Self::NotFound { .. } => ErrorKind::Usage,
            Self::Limit { .. } => ErrorKind::Limit,
            Self::Instance { .. } | Self::CorruptMetadata { .. } => ErrorKind::Instance,
            Self::Fatal { .. } => ErrorKind::Fatal,
        }
    }
}
