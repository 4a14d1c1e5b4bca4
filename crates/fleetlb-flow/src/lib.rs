//! # fleetlb-flow
//!
//! Orchestration for the amphora and distributor lifecycle.
//!
//! Work is expressed as [`Task`]s composed into a [`Flow`] AST and run by a
//! [`FlowEngine`]:
//!
//! - **Store**: Tasks exchange values through a run-scoped [`FlowStore`]
//!   addressed by typed [`Key`]s
//! - **Flows**: Sequences, parallel groups and decisions. A flow is validated
//!   against the seeded store before anything runs
//! - **Engine**: Runs leaf tasks on a bounded worker pool, journals every
//!   success and reverts the journal newest first when a task fails
//! - **Drivers**: Compute, network, amphora, distributor and certificate
//!   capabilities, selected by name from a [`DriverRegistry`]
//! - **Library**: The task library in [`tasks`], the flow builders in
//!   [`flows`], and the [`ClusterManager`] that runs them
//!
//! ## Example
//!
//! ```rust,no_run
//! use fleetlb_flow::{ClusterManager, Services};
//!
//! # async fn example() -> fleetlb_flow::Result<()> {
//! let manager = ClusterManager::new(Services::noop());
//! let amphora_id = manager.create_spare_amphora().await?;
//! manager.rotate_amphora_cert(amphora_id).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod agent_config;
pub mod cluster_manager;
pub mod config;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod flow;
pub mod flows;
pub mod keys;
pub mod metrics;
pub mod services;
pub mod store;
pub mod task;
pub mod tasks;

pub use cluster_manager::ClusterManager;
pub use config::{ControllerConfig, Transport};
pub use drivers::{DriverContext, DriverError, DriverRegistry};
pub use engine::FlowEngine;
pub use error::{Error, Result};
pub use flow::{Decision, Flow};
pub use services::Services;
pub use store::{FlowStore, Key};
pub use task::{RevertOutcome, Task, TaskContext, TaskNode};
