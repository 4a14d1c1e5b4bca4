//! Store names shared by the task and flow libraries.

use std::collections::BTreeMap;

use fleetlb_core::{
    Amphora, AmphoraCluster, AmphoraId, AmphoraRole, DistributorId, DistributorRecord, Listener,
    LoadBalancer, LoadBalancerId,
};
use fleetlb_distributor::DistributorInfo;

use crate::drivers::{AmphoraNetworkConfig, Certificate, NetworkDelta, Port};
use crate::store::Key;

/// Amphora being worked on.
pub const AMPHORA_ID: Key<AmphoraId> = Key::new("amphora_id");
/// Latest record of the amphora being worked on.
pub const AMPHORA: Key<Amphora> = Key::new("amphora");
/// Compute instance backing the amphora.
pub const COMPUTE_ID: Key<String> = Key::new("compute_id");
/// Server certificate issued to the amphora.
pub const SERVER_PEM: Key<Certificate> = Key::new("server_pem");
/// Role the amphora takes in its load balancer.
pub const ROLE: Key<AmphoraRole> = Key::new("role");
/// Spare claimed from the pool, if any.
pub const ALLOCATED_AMPHORA_ID: Key<Option<AmphoraId>> = Key::new("allocated_amphora_id");
/// MAC of the amphora's VIP interface.
pub const AMPHORA_MAC: Key<String> = Key::new("amphora_mac");

/// Amphora being replaced by a failover.
pub const FAILED_AMPHORA_ID: Key<AmphoraId> = Key::new("failed_amphora_id");
/// Record of the amphora being replaced.
pub const FAILED_AMPHORA: Key<Amphora> = Key::new("failed_amphora");

/// Load balancer being worked on.
pub const LOADBALANCER_ID: Key<LoadBalancerId> = Key::new("loadbalancer_id");
/// Latest record of the load balancer.
pub const LOADBALANCER: Key<LoadBalancer> = Key::new("loadbalancer");
/// Listeners of the load balancer.
pub const LISTENERS: Key<Vec<Listener>> = Key::new("listeners");
/// Amphorae the network tasks act on.
pub const AMPHORAE: Key<Vec<Amphora>> = Key::new("amphorae");
/// VIP plug results, per amphora.
pub const AMPHORAE_NETWORK_CONFIG: Key<BTreeMap<AmphoraId, AmphoraNetworkConfig>> =
    Key::new("amphorae_network_config");
/// Member network changes, per amphora.
pub const DELTAS: Key<BTreeMap<AmphoraId, NetworkDelta>> = Key::new("deltas");
/// Ports plugged for member networks, per amphora.
pub const ADDED_PORTS: Key<BTreeMap<AmphoraId, Vec<Port>>> = Key::new("added_ports");
/// Server group amphorae of one load balancer are placed in.
pub const SERVER_GROUP_ID: Key<String> = Key::new("server_group_id");

/// Distributor row serving the load balancer.
pub const DISTRIBUTOR: Key<DistributorRecord> = Key::new("distributor");
/// Id of the distributor row.
pub const DISTRIBUTOR_ID: Key<DistributorId> = Key::new("distributor_id");
/// Live distributor reported by the distributor agent.
pub const DISTRIBUTOR_INFO: Key<DistributorInfo> = Key::new("distributor_info");
/// Cluster association of an active-active load balancer.
pub const CLUSTER: Key<AmphoraCluster> = Key::new("amphora_cluster");
/// Cluster algorithm tag.
pub const CLUSTER_ALG_TYPE: Key<String> = Key::new("cluster_alg_type");
/// Slot count of the distributor.
pub const CLUSTER_MIN_SIZE: Key<u32> = Key::new("cluster_min_size");
/// Distributor slot index.
pub const CLUSTER_SLOT: Key<u32> = Key::new("cluster_slot");
/// Amphora occupying a slot, if it is allocated.
pub const SLOT_AMPHORA: Key<Option<Amphora>> = Key::new("slot_amphora");
