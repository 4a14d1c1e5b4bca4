//! # fleetlb-distributor
//!
//! Control engine for the traffic distributors of active-active load
//! balancers.
//!
//! A distributor is one OVS bridge per load balancer. VIP traffic entering
//! the bridge hits a hash-select group whose buckets point at a fixed pool of
//! destination groups, one per slot. A free slot drops; a bound slot rewrites
//! the MAC addresses and sends the frame back out towards its amphora.
//!
//! ## Modules
//!
//! - [`switch`]: The capability trait the engine drives, plus the
//!   `ovs-vsctl`/`ovs-ofctl` implementation ([`ovs`]) and an in-memory one
//!   ([`memory`])
//! - [`openflow`]: Group and flow specifications rendered in `ovs-ofctl` syntax
//! - [`metadata`]: The bridge `external_ids` recovery format
//! - [`distributor`]: Per-load-balancer slot bookkeeping
//! - [`engine`]: The process-wide registry, boot state and every operation
//! - [`server`]: The HTTP surface consumed by the orchestration layer
//!
//! ## Failure Kinds
//!
//! Every failure is one of four [`ErrorKind`]s: usage (fix the input),
//! limit (free capacity first), instance (recycle this load balancer) and
//! fatal (recycle the process).

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod distributor;
pub mod engine;
pub mod error;
pub mod memory;
pub mod metadata;
pub mod metrics;
pub mod openflow;
pub mod ovs;
pub mod server;
pub mod switch;

pub use config::DistributorConfig;
pub use distributor::{Destination, Distributor, SlotBinding, SlotTable};
pub use engine::{
    DistributorEngine, DistributorInfo, PlugVipRequest, ProvisionState, RegisterRequest,
    StatusReport, UnregisterRequest, ACTIVE_ACTIVE_ALGORITHM,
};
pub use error::{Error, ErrorKind, Result, SwitchError};
pub use memory::MemorySwitch;
pub use ovs::OvsSwitch;
pub use switch::Switch;
