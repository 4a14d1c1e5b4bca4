//! Entity records returned by the repository layer.
//!
//! Records are plain data: no business rules live here beyond the
//! [`Entity`] identity contract and the [`StatusEntity`] status accessors
//! used by the generic status-transition tasks.

use std::fmt;
use std::hash::Hash;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{
    AmphoraId, DistributorId, HealthMonitorId, L7PolicyId, L7RuleId, ListenerId,
    LoadBalancerId, MemberId, PoolId,
};
use crate::status::{
    AmphoraRole, AmphoraStatus, OperatingStatus, ProvisioningStatus, Topology,
};

/// A persisted record with a typed identity.
pub trait Entity: Clone + fmt::Debug + Send + Sync + 'static {
    /// Identifier type.
    type Id: Copy + Ord + Hash + fmt::Display + fmt::Debug + Send + Sync + 'static;

    /// Entity kind used in errors, logs and metric labels.
    const KIND: &'static str;

    /// Returns the record's identifier.
    fn id(&self) -> Self::Id;
}

/// A record carrying provisioning and operating status columns.
pub trait StatusEntity: Entity {
    /// Current provisioning status.
    fn provisioning_status(&self) -> ProvisioningStatus;

    /// Overwrites the provisioning status.
    fn set_provisioning_status(&mut self, status: ProvisioningStatus);

    /// Overwrites the operating status. Records without one ignore it.
    fn set_operating_status(&mut self, _status: OperatingStatus) {}
}

macro_rules! entity {
    ($ty:ty, $id:ty, $field:ident, $kind:literal) => {
        impl Entity for $ty {
            type Id = $id;
            const KIND: &'static str = $kind;

            fn id(&self) -> $id {
                self.$field
            }
        }
    };
}

macro_rules! status_entity {
    ($ty:ty) => {
        impl StatusEntity for $ty {
            fn provisioning_status(&self) -> ProvisioningStatus {
                self.provisioning_status
            }

            fn set_provisioning_status(&mut self, status: ProvisioningStatus) {
                self.provisioning_status = status;
            }

            fn set_operating_status(&mut self, status: OperatingStatus) {
                self.operating_status = status;
            }
        }
    };
}

/// The virtual IP of a load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vip {
    /// The VIP address.
    pub ip_address: IpAddr,
    /// Network port holding the address.
    pub port_id: Option<String>,
    /// Subnet of the VIP.
    pub subnet_id: Option<String>,
    /// Network of the VIP.
    pub network_id: Option<String>,
}

impl Vip {
    /// Creates a VIP with only its address set.
    #[must_use]
    pub const fn new(ip_address: IpAddr) -> Self {
        Self {
            ip_address,
            port_id: None,
            subnet_id: None,
            network_id: None,
        }
    }
}

/// A load balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancer {
    /// Identifier.
    pub id: LoadBalancerId,
    /// Display name.
    pub name: String,
    /// Topology the load balancer was created with.
    pub topology: Topology,
    /// Provisioning status.
    pub provisioning_status: ProvisioningStatus,
    /// Operating status.
    pub operating_status: OperatingStatus,
    /// Virtual IP.
    pub vip: Vip,
    /// Listeners attached to the load balancer.
    pub listener_ids: Vec<ListenerId>,
    /// Pools attached to the load balancer.
    pub pool_ids: Vec<PoolId>,
    /// Anti-affinity server group, when one was created.
    pub server_group_id: Option<String>,
    /// Distributor serving an active-active load balancer.
    pub distributor_id: Option<DistributorId>,
    /// Requested active amphora count for active-active topologies.
    pub cluster_size: Option<u32>,
}

impl LoadBalancer {
    /// Creates a load balancer in `PENDING_CREATE`.
    #[must_use]
    pub fn new(id: LoadBalancerId, vip: Vip, topology: Topology) -> Self {
        Self {
            id,
            name: String::new(),
            topology,
            provisioning_status: ProvisioningStatus::PendingCreate,
            operating_status: OperatingStatus::Offline,
            vip,
            listener_ids: Vec::new(),
            pool_ids: Vec::new(),
            server_group_id: None,
            distributor_id: None,
            cluster_size: None,
        }
    }
}

entity!(LoadBalancer, LoadBalancerId, id, "load_balancer");
status_entity!(LoadBalancer);

/// An amphora: one load-balancing appliance instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Amphora {
    /// Identifier.
    pub id: AmphoraId,
    /// Compute instance backing the amphora.
    pub compute_id: Option<String>,
    /// Lifecycle status.
    pub status: AmphoraStatus,
    /// Load balancer the amphora is allocated to.
    pub load_balancer_id: Option<LoadBalancerId>,
    /// Role within the load balancer topology.
    pub role: Option<AmphoraRole>,
    /// Management network address.
    pub lb_network_ip: Option<IpAddr>,
    /// Address on the VIP network.
    pub vrrp_ip: Option<IpAddr>,
    /// HA address shared by the topology.
    pub ha_ip: Option<IpAddr>,
    /// Port holding `vrrp_ip`.
    pub vrrp_port_id: Option<String>,
    /// Port holding `ha_ip`.
    pub ha_port_id: Option<String>,
    /// Interface carrying VRRP traffic inside the amphora.
    pub vrrp_interface: Option<String>,
    /// VRRP router id.
    pub vrrp_id: Option<u8>,
    /// VRRP priority.
    pub vrrp_priority: Option<u8>,
    /// Expiration of the amphora's server certificate.
    pub cert_expiration: Option<DateTime<Utc>>,
    /// Set while a certificate rotation is in progress.
    pub cert_busy: bool,
    /// Distributor slot held by an active-active member.
    pub cluster_slot: Option<u32>,
}

impl Amphora {
    /// Creates an amphora record in `PENDING_CREATE`.
    #[must_use]
    pub const fn new(id: AmphoraId) -> Self {
        Self {
            id,
            compute_id: None,
            status: AmphoraStatus::PendingCreate,
            load_balancer_id: None,
            role: None,
            lb_network_ip: None,
            vrrp_ip: None,
            ha_ip: None,
            vrrp_port_id: None,
            ha_port_id: None,
            vrrp_interface: None,
            vrrp_id: None,
            vrrp_priority: None,
            cert_expiration: None,
            cert_busy: false,
            cluster_slot: None,
        }
    }

    /// Returns true if the amphora is a spare waiting in the pool.
    #[must_use]
    pub fn is_spare(&self) -> bool {
        self.status == AmphoraStatus::Ready && self.load_balancer_id.is_none()
    }
}

entity!(Amphora, AmphoraId, id, "amphora");

/// Listener protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ListenerProtocol {
    /// Plain TCP.
    Tcp,
    /// HTTP.
    Http,
    /// HTTPS passthrough.
    Https,
    /// TLS-terminated HTTPS.
    TerminatedHttps,
    /// UDP.
    Udp,
}

/// A listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listener {
    /// Identifier.
    pub id: ListenerId,
    /// Owning load balancer.
    pub load_balancer_id: LoadBalancerId,
    /// Protocol.
    pub protocol: ListenerProtocol,
    /// Port the listener accepts on.
    pub protocol_port: u16,
    /// Default pool.
    pub default_pool_id: Option<PoolId>,
    /// Provisioning status.
    pub provisioning_status: ProvisioningStatus,
    /// Operating status.
    pub operating_status: OperatingStatus,
}

impl Listener {
    /// Creates a listener in `PENDING_CREATE`.
    #[must_use]
    pub const fn new(
        id: ListenerId,
        load_balancer_id: LoadBalancerId,
        protocol: ListenerProtocol,
        protocol_port: u16,
    ) -> Self {
        Self {
            id,
            load_balancer_id,
            protocol,
            protocol_port,
            default_pool_id: None,
            provisioning_status: ProvisioningStatus::PendingCreate,
            operating_status: OperatingStatus::Offline,
        }
    }
}

entity!(Listener, ListenerId, id, "listener");
status_entity!(Listener);

/// A pool of members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    /// Identifier.
    pub id: PoolId,
    /// Owning load balancer.
    pub load_balancer_id: LoadBalancerId,
    /// Balancing algorithm name.
    pub lb_algorithm: String,
    /// Provisioning status.
    pub provisioning_status: ProvisioningStatus,
    /// Operating status.
    pub operating_status: OperatingStatus,
}

entity!(Pool, PoolId, id, "pool");
status_entity!(Pool);

/// A backend member of a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Identifier.
    pub id: MemberId,
    /// Owning pool.
    pub pool_id: PoolId,
    /// Backend address.
    pub address: IpAddr,
    /// Backend port.
    pub protocol_port: u16,
    /// Subnet the member lives on; drives network plugging.
    pub subnet_id: Option<String>,
    /// Provisioning status.
    pub provisioning_status: ProvisioningStatus,
    /// Operating status.
    pub operating_status: OperatingStatus,
}

entity!(Member, MemberId, id, "member");
status_entity!(Member);

/// A pool health monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitor {
    /// Identifier.
    pub id: HealthMonitorId,
    /// Monitored pool.
    pub pool_id: PoolId,
    /// Probe type (`HTTP`, `TCP`, `PING` ...).
    pub monitor_type: String,
    /// Seconds between probes.
    pub delay: u32,
    /// Provisioning status.
    pub provisioning_status: ProvisioningStatus,
    /// Operating status.
    pub operating_status: OperatingStatus,
}

entity!(HealthMonitor, HealthMonitorId, id, "health_monitor");
status_entity!(HealthMonitor);

/// An L7 policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L7Policy {
    /// Identifier.
    pub id: L7PolicyId,
    /// Owning listener.
    pub listener_id: ListenerId,
    /// Action (`REJECT`, `REDIRECT_TO_POOL` ...).
    pub action: String,
    /// Evaluation order.
    pub position: u32,
    /// Provisioning status.
    pub provisioning_status: ProvisioningStatus,
    /// Operating status.
    pub operating_status: OperatingStatus,
}

entity!(L7Policy, L7PolicyId, id, "l7policy");
status_entity!(L7Policy);

/// An L7 rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct L7Rule {
    /// Identifier.
    pub id: L7RuleId,
    /// Owning policy.
    pub l7policy_id: L7PolicyId,
    /// Rule type (`PATH`, `HOST_NAME` ...).
    pub rule_type: String,
    /// Compared value.
    pub value: String,
    /// Provisioning status.
    pub provisioning_status: ProvisioningStatus,
    /// Operating status.
    pub operating_status: OperatingStatus,
}

entity!(L7Rule, L7RuleId, id, "l7rule");
status_entity!(L7Rule);

/// VRRP settings shared by the amphorae of one load balancer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VrrpGroup {
    /// Owning load balancer.
    pub load_balancer_id: LoadBalancerId,
    /// VRRP group name.
    pub vrrp_group_name: String,
    /// Authentication type.
    pub vrrp_auth_type: String,
    /// Authentication secret.
    pub vrrp_auth_pass: String,
    /// Advertisement interval in seconds.
    pub advert_int: u32,
}

entity!(VrrpGroup, LoadBalancerId, load_balancer_id, "vrrp_group");

/// Health bookkeeping for one amphora.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmphoraHealth {
    /// Amphora being tracked.
    pub amphora_id: AmphoraId,
    /// Last heartbeat.
    pub last_update: DateTime<Utc>,
    /// Set while the amphora is excluded from health checks.
    pub busy: bool,
}

entity!(AmphoraHealth, AmphoraId, amphora_id, "amphora_health");

/// Database row describing a distributor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorRecord {
    /// Identifier.
    pub id: DistributorId,
    /// Display name.
    pub name: String,
    /// Provisioning status.
    pub provisioning_status: ProvisioningStatus,
    /// Operating status.
    pub operating_status: OperatingStatus,
    /// MAC of the external interface facing the VIP network.
    pub frontend_mac: Option<String>,
    /// Whether several load balancers share the distributor.
    pub shared: bool,
    /// Load balancers served by the distributor.
    pub load_balancer_ids: Vec<LoadBalancerId>,
}

impl DistributorRecord {
    /// Creates a record in `PENDING_CREATE`.
    #[must_use]
    pub fn new(id: DistributorId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            provisioning_status: ProvisioningStatus::PendingCreate,
            operating_status: OperatingStatus::Offline,
            frontend_mac: None,
            shared: false,
            load_balancer_ids: Vec::new(),
        }
    }
}

entity!(DistributorRecord, DistributorId, id, "distributor");
status_entity!(DistributorRecord);

/// Association between an active-active load balancer and its distributor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmphoraCluster {
    /// Owning load balancer.
    pub load_balancer_id: LoadBalancerId,
    /// Distributor serving the cluster.
    pub distributor_id: DistributorId,
    /// Number of ACTIVE_ACTIVE amphorae.
    pub cluster_size: u32,
    /// Provisioning status.
    pub provisioning_status: ProvisioningStatus,
}

entity!(AmphoraCluster, LoadBalancerId, load_balancer_id, "amphora_cluster");

impl StatusEntity for AmphoraCluster {
    fn provisioning_status(&self) -> ProvisioningStatus {
        self.provisioning_status
    }

    fn set_provisioning_status(&mut self, status: ProvisioningStatus) {
        self.provisioning_status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn spare_requires_ready_and_unbound() {
        let mut amp = Amphora::new(AmphoraId::generate());
        assert!(!amp.is_spare());
        amp.status = AmphoraStatus::Ready;
        assert!(amp.is_spare());
        amp.load_balancer_id = Some(LoadBalancerId::generate());
        assert!(!amp.is_spare());
    }

    #[test]
    fn status_entity_sets_both_columns() {
        let vip = Vip::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
        let mut lb = LoadBalancer::new(LoadBalancerId::generate(), vip, Topology::Single);
        lb.set_provisioning_status(ProvisioningStatus::Error);
        lb.set_operating_status(OperatingStatus::Error);
        assert_eq!(lb.provisioning_status(), ProvisioningStatus::Error);
        assert_eq!(lb.operating_status, OperatingStatus::Error);
    }

    #[test]
    fn kinds_are_distinct() {
        assert_ne!(LoadBalancer::KIND, Listener::KIND);
        assert_eq!(Amphora::KIND, "amphora");
    }
}
