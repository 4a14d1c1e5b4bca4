//! Shared test utilities for fleetlb tests.
//!
//! This crate provides:
//! - [`TestContext`]: In-memory repositories, recording noop drivers and a
//!   booted distributor engine over an in-memory switch
//! - Factory functions for creating load balancers, amphorae and listeners
//! - Custom assertion helpers
//!
//! # Example
//!
//! ```rust,ignore
//! use fleetlb_test_utils::{TestContext, LoadBalancerFactory};
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let ctx = TestContext::new().await;
//!     let lb = ctx.seed_lb(LoadBalancerFactory::active_active(2)).await;
//!     ctx.manager().create_active_active_load_balancer(lb.id).await.unwrap();
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]

pub mod assertions;
pub mod fixtures;

pub use assertions::*;
pub use fixtures::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("fleetlb=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
