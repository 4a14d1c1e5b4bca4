//! # fleetlb-core
//!
//! Core abstractions shared by every fleetlb component.
//!
//! This crate provides the foundational types used by the distributor control
//! engine and the orchestration engine:
//!
//! - **Identifiers**: Strongly-typed ids for amphorae, load balancers and the
//!   rest of the persisted entities
//! - **Status model**: Provisioning, operating, amphora and distributor status
//!   enums with their wire names
//! - **Entity records**: Plain records returned by the repository layer
//! - **Repositories**: Typed get/create/update/delete interfaces and an
//!   in-memory backend
//! - **Observability**: Logging initialization and span constructors
//!
//! ## Example
//!
//! ```rust
//! use fleetlb_core::prelude::*;
//!
//! let amphora = Amphora::new(AmphoraId::generate());
//! assert_eq!(amphora.status, AmphoraStatus::PendingCreate);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod env;
pub mod error;
pub mod id;
pub mod model;
pub mod observability;
pub mod repository;
pub mod status;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{
        AmphoraId, DistributorId, HealthMonitorId, L7PolicyId, L7RuleId, ListenerId,
        LoadBalancerId, MemberId, PoolId,
    };
    pub use crate::model::{
        Amphora, AmphoraCluster, AmphoraHealth, DistributorRecord, Entity, HealthMonitor,
        L7Policy, L7Rule, Listener, ListenerProtocol, LoadBalancer, Member, Pool,
        StatusEntity, Vip, VrrpGroup,
    };
    pub use crate::repository::{AmphoraRepository, Repositories, Repository, RepositoryFor};
    pub use crate::status::{
        AmphoraRole, AmphoraStatus, DistributorStatus, OperatingStatus, ProvisioningStatus,
        Topology,
    };
}

pub use error::{Error, Result};
pub use id::{
    AmphoraId, DistributorId, HealthMonitorId, L7PolicyId, L7RuleId, ListenerId, LoadBalancerId,
    MemberId, PoolId,
};
pub use model::{
    Amphora, AmphoraCluster, AmphoraHealth, DistributorRecord, Entity, HealthMonitor, L7Policy,
    L7Rule, Listener, ListenerProtocol, LoadBalancer, Member, Pool, StatusEntity, Vip, VrrpGroup,
};
pub use observability::{LogFormat, init_logging};
pub use repository::{AmphoraRepository, Repositories, Repository, RepositoryFor};
pub use status::{
    AmphoraRole, AmphoraStatus, DistributorStatus, OperatingStatus, ProvisioningStatus, Topology,
};
