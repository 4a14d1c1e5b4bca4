//! Logging initialization and span constructors.
//!
//! Every fleetlb process calls [`init_logging`] once at startup. Flow runs
//! and distributor operations open spans through [`flow_span`] and
//! [`distributor_span`] so their log lines carry the same fields everywhere.

use std::str::FromStr;
use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::Error;

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            other => Err(Error::InvalidInput(format!("unknown log format '{other}'"))),
        }
    }
}

/// Initializes the logging subsystem.
///
/// Safe to call multiple times; subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `fleetlb_distributor=debug`)
///
/// # Example
///
/// ```rust
/// use fleetlb_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for one flow run.
///
/// ```rust
/// use fleetlb_core::observability::flow_span;
///
/// let span = flow_span("create-amphora", "3f0c9a1e");
/// let _guard = span.enter();
/// ```
#[must_use]
pub fn flow_span(flow: &str, run_id: &str) -> Span {
    tracing::info_span!("flow", flow = flow, run_id = run_id)
}

/// Creates a span for a distributor operation on one load balancer.
#[must_use]
pub fn distributor_span(operation: &str, lb_id: &str) -> Span {
    tracing::info_span!("distributor", op = operation, lb_id = lb_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn spans_accept_events() {
        let span = flow_span("failover", "run-1");
        let _guard = span.enter();
        let inner = distributor_span("register_amphora", "lb-1");
        let _inner = inner.enter();
        tracing::info!("message inside nested spans");
    }

    #[test]
    fn log_format_parses_case_insensitively() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
