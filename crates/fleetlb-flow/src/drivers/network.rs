//! Network capability and the recording noop driver.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use fleetlb_core::{Amphora, AmphoraId, LoadBalancer};

use super::{DriverError, DriverResult, FailureSet};

/// A subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    /// Subnet id.
    pub id: String,
    /// Owning network.
    pub network_id: String,
    /// CIDR.
    pub cidr: String,
    /// Gateway address.
    pub gateway: Option<IpAddr>,
}

/// A port on a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Port id.
    pub id: String,
    /// Network the port is on.
    pub network_id: String,
    /// Port MAC.
    pub mac_address: String,
    /// Fixed address.
    pub ip_address: Option<IpAddr>,
}

/// Network identity an amphora gets when the VIP is plugged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmphoraNetworkConfig {
    /// Amphora.
    pub amphora_id: AmphoraId,
    /// Base VRRP port address.
    pub vrrp_ip: Option<IpAddr>,
    /// VIP address.
    pub ha_ip: IpAddr,
    /// Base VRRP port.
    pub vrrp_port_id: String,
    /// VIP port.
    pub ha_port_id: String,
    /// VIP subnet.
    pub vip_subnet: Subnet,
}

/// Networks an amphora has to gain and lose.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDelta {
    /// Amphora.
    pub amphora_id: Option<AmphoraId>,
    /// Compute instance.
    pub compute_id: String,
    /// Networks to plug.
    pub add_networks: Vec<String>,
    /// Networks to unplug.
    pub delete_networks: Vec<String>,
}

/// Network backend.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Plugs the load balancer VIP into an amphora.
    async fn plug_vip(
        &self,
        lb: &LoadBalancer,
        amphora: &Amphora,
    ) -> DriverResult<AmphoraNetworkConfig>;

    /// Removes the VIP from an amphora.
    async fn unplug_vip(&self, lb: &LoadBalancer, amphora: &Amphora) -> DriverResult<()>;

    /// Attaches a compute instance to a network and returns the new port.
    async fn plug_network(&self, compute_id: &str, network_id: &str) -> DriverResult<Port>;

    /// Detaches a compute instance from a network.
    async fn unplug_network(&self, compute_id: &str, network_id: &str) -> DriverResult<()>;

    /// Looks up a subnet.
    async fn get_subnet(&self, subnet_id: &str) -> DriverResult<Subnet>;

    /// Looks up a port.
    async fn get_port(&self, port_id: &str) -> DriverResult<Port>;

    /// Lists the networks a compute instance is attached to.
    async fn plugged_networks(&self, compute_id: &str) -> DriverResult<Vec<String>>;

    /// Lists the ports still attached to a compute instance.
    async fn attached_ports(&self, compute_id: &str) -> DriverResult<Vec<String>>;
}

#[derive(Debug, Default)]
struct NoopNetworkState {
    next_port: u32,
    plugged: BTreeMap<String, BTreeSet<String>>,
    ports: BTreeMap<String, Port>,
    vips: BTreeSet<AmphoraId>,
    sticky_ports: BTreeMap<String, (u32, Vec<String>)>,
}

/// Network driver that keeps attachments in memory.
#[derive(Debug, Default)]
pub struct NoopNetworkDriver {
    state: Mutex<NoopNetworkState>,
    failures: FailureSet,
}

impl NoopNetworkDriver {
    /// Creates an empty driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes an operation fail, by trait method name.
    pub fn fail(&self, operation: &'static str) {
        self.failures.fail(operation);
    }

    /// Undoes [`fail`](Self::fail).
    pub fn heal(&self, operation: &'static str) {
        self.failures.heal(operation);
    }

    /// Keeps `ports` attached to `compute_id` for `polls` detach polls.
    /// `u32::MAX` keeps them forever.
    pub fn hold_ports(&self, compute_id: &str, ports: Vec<String>, polls: u32) {
        self.lock()
            .sticky_ports
            .insert(compute_id.to_string(), (polls, ports));
    }

    /// Returns true if the VIP is plugged into the amphora.
    #[must_use]
    pub fn vip_plugged(&self, amphora_id: AmphoraId) -> bool {
        self.lock().vips.contains(&amphora_id)
    }

    /// Returns the networks plugged into a compute instance.
    #[must_use]
    pub fn networks_of(&self, compute_id: &str) -> Vec<String> {
        self.lock()
            .plugged
            .get(compute_id)
            .map(|nets| nets.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NoopNetworkState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn vip_subnet(lb: &LoadBalancer) -> Subnet {
    let subnet_id = lb
        .vip
        .subnet_id
        .clone()
        .unwrap_or_else(|| "vip-subnet".to_string());
    subnet_for(&subnet_id, Some(lb.vip.ip_address))
}

fn subnet_for(subnet_id: &str, address: Option<IpAddr>) -> Subnet {
    let cidr = match address {
        Some(IpAddr::V4(v4)) => {
            let [a, b, c, _] = v4.octets();
            format!("{a}.{b}.{c}.0/24")
        }
        Some(IpAddr::V6(v6)) => {
            let segments = v6.segments();
            format!(
                "{:x}:{:x}:{:x}:{:x}::/64",
                segments[0], segments[1], segments[2], segments[3]
            )
        }
        None => "10.0.0.0/24".to_string(),
    };
    Subnet {
        id: subnet_id.to_string(),
        network_id: format!("net-{subnet_id}"),
        cidr,
        gateway: None,
    }
}

#[async_trait]
impl NetworkDriver for NoopNetworkDriver {
    async fn plug_vip(
        &self,
        lb: &LoadBalancer,
        amphora: &Amphora,
    ) -> DriverResult<AmphoraNetworkConfig> {
        self.failures.check("network", "plug_vip")?;
        let mut state = self.lock();
        state.vips.insert(amphora.id);
        Ok(AmphoraNetworkConfig {
            amphora_id: amphora.id,
            vrrp_ip: amphora.vrrp_ip,
            ha_ip: lb.vip.ip_address,
            vrrp_port_id: amphora
                .vrrp_port_id
                .clone()
                .unwrap_or_else(|| format!("vrrp-{}", amphora.id)),
            ha_port_id: lb
                .vip
                .port_id
                .clone()
                .unwrap_or_else(|| format!("vip-{}", lb.id)),
            vip_subnet: vip_subnet(lb),
        })
    }

    async fn unplug_vip(&self, _lb: &LoadBalancer, amphora: &Amphora) -> DriverResult<()> {
        self.failures.check("network", "unplug_vip")?;
        self.lock().vips.remove(&amphora.id);
        Ok(())
    }

    async fn plug_network(&self, compute_id: &str, network_id: &str) -> DriverResult<Port> {
        self.failures.check("network", "plug_network")?;
        let mut state = self.lock();
        state.next_port += 1;
        let index = state.next_port;
        let port = Port {
            id: format!("port-{index}"),
            network_id: network_id.to_string(),
            mac_address: format!("fa:16:3e:00:{:02x}:{:02x}", (index >> 8) & 0xff, index & 0xff),
            ip_address: None,
        };
        state.ports.insert(port.id.clone(), port.clone());
        state
            .plugged
            .entry(compute_id.to_string())
            .or_default()
            .insert(network_id.to_string());
        Ok(port)
    }

    async fn unplug_network(&self, compute_id: &str, network_id: &str) -> DriverResult<()> {
        self.failures.check("network", "unplug_network")?;
        if let Some(nets) = self.lock().plugged.get_mut(compute_id) {
            nets.remove(network_id);
        }
        Ok(())
    }

    async fn get_subnet(&self, subnet_id: &str) -> DriverResult<Subnet> {
        self.failures.check("network", "get_subnet")?;
        Ok(subnet_for(subnet_id, None))
    }

    async fn get_port(&self, port_id: &str) -> DriverResult<Port> {
        self.failures.check("network", "get_port")?;
        self.lock()
            .ports
            .get(port_id)
            .cloned()
            .ok_or_else(|| DriverError::not_found("port", port_id))
    }

    async fn plugged_networks(&self, compute_id: &str) -> DriverResult<Vec<String>> {
        self.failures.check("network", "plugged_networks")?;
        Ok(self.networks_of(compute_id))
    }

    async fn attached_ports(&self, compute_id: &str) -> DriverResult<Vec<String>> {
        self.failures.check("network", "attached_ports")?;
        let mut state = self.lock();
        let Some((polls, ports)) = state.sticky_ports.get_mut(compute_id) else {
            return Ok(Vec::new());
        };
        if *polls == 0 {
            state.sticky_ports.remove(compute_id);
            return Ok(Vec::new());
        }
        if *polls != u32::MAX {
            *polls -= 1;
        }
        Ok(ports.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetlb_core::{LoadBalancerId, Topology, Vip};
    use std::net::Ipv4Addr;

    fn lb() -> LoadBalancer {
        let vip = Vip::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)));
        LoadBalancer::new(LoadBalancerId::generate(), vip, Topology::ActiveActive)
    }

    #[tokio::test]
    async fn vip_plug_reports_subnet_of_vip() {
        let driver = NoopNetworkDriver::new();
        let lb = lb();
        let amp = Amphora::new(AmphoraId::generate());
        let config = driver.plug_vip(&lb, &amp).await.unwrap();
        assert_eq!(config.vip_subnet.cidr, "203.0.113.0/24");
        assert!(driver.vip_plugged(amp.id));
        driver.unplug_vip(&lb, &amp).await.unwrap();
        assert!(!driver.vip_plugged(amp.id));
    }

    #[tokio::test]
    async fn held_ports_detach_after_polls() {
        let driver = NoopNetworkDriver::new();
        driver.hold_ports("c-1", vec!["p-1".into()], 1);
        assert_eq!(driver.attached_ports("c-1").await.unwrap(), vec!["p-1"]);
        assert!(driver.attached_ports("c-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn plugged_networks_track_plug_and_unplug() {
        let driver = NoopNetworkDriver::new();
        let port = driver.plug_network("c-1", "net-a").await.unwrap();
        assert_eq!(driver.get_port(&port.id).await.unwrap(), port);
        assert_eq!(driver.plugged_networks("c-1").await.unwrap(), vec!["net-a"]);
        driver.unplug_network("c-1", "net-a").await.unwrap();
        assert!(driver.plugged_networks("c-1").await.unwrap().is_empty());
    }
}
