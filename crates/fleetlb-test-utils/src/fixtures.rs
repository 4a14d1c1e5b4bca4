//! Pre-built test fixtures for common test scenarios.
//!
//! Provides a wired [`TestContext`] and factory functions that create
//! entities with sensible defaults.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use fleetlb_core::repository::memory::InMemoryAmphoraRepository;
use fleetlb_core::{
    Amphora, AmphoraId, AmphoraRole, AmphoraStatus, Listener, ListenerId, ListenerProtocol,
    LoadBalancer, LoadBalancerId, ProvisioningStatus, Repositories, Repository, Topology, Vip,
};
use fleetlb_distributor::{DistributorConfig, DistributorEngine, MemorySwitch};
use fleetlb_flow::drivers::{
    LocalDistributorDriver, NoopAmphoraDriver, NoopCertGenerator, NoopComputeDriver,
    NoopNetworkDriver,
};
use fleetlb_flow::{ClusterManager, ControllerConfig, FlowEngine, Services};

/// Interface the in-memory switch exposes to distributors.
pub const FRONTEND_IFACE: &str = "eth1";
/// MAC of [`FRONTEND_IFACE`].
pub const FRONTEND_MAC: &str = "02:00:00:00:00:aa";

/// Test context wiring in-memory repositories, noop drivers and a booted
/// distributor engine over an in-memory switch.
///
/// Driver handles are kept concretely typed so tests can inject failures
/// and inspect recorded calls.
pub struct TestContext {
    /// Repositories.
    pub repos: Repositories,
    /// The amphora repository behind `repos.amphorae`, with its write log.
    pub amphora_rows: Arc<InMemoryAmphoraRepository>,
    /// Compute backend.
    pub compute: Arc<NoopComputeDriver>,
    /// Network backend.
    pub network: Arc<NoopNetworkDriver>,
    /// Amphora agent transport.
    pub amphora: Arc<NoopAmphoraDriver>,
    /// Certificate issuer.
    pub certs: Arc<NoopCertGenerator>,
    /// Switch under the distributor engine.
    pub switch: Arc<MemorySwitch>,
    /// Distributor engine.
    pub distributor: Arc<DistributorEngine>,
    /// Controller configuration.
    pub config: ControllerConfig,
}

impl TestContext {
    /// Creates a context with the default test configuration.
    ///
    /// # Panics
    ///
    /// Panics if the distributor engine fails to boot.
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    /// Creates a context with a specific controller configuration.
    ///
    /// # Panics
    ///
    /// Panics if the distributor engine fails to boot.
    pub async fn with_config(config: ControllerConfig) -> Self {
        let switch = Arc::new(MemorySwitch::new());
        switch.add_interface(FRONTEND_IFACE, FRONTEND_MAC);
        let distributor = Arc::new(DistributorEngine::new(
            switch.clone(),
            DistributorConfig {
                port_read_retry_delay: std::time::Duration::from_millis(1),
                ..DistributorConfig::default()
            },
        ));
        distributor
            .start()
            .await
            .expect("distributor engine should boot");

        let amphora_rows = Arc::new(InMemoryAmphoraRepository::new());
        Self {
            repos: Repositories {
                amphorae: amphora_rows.clone(),
                ..Repositories::in_memory()
            },
            amphora_rows,
            compute: Arc::new(NoopComputeDriver::new()),
            network: Arc::new(NoopNetworkDriver::new()),
            amphora: Arc::new(NoopAmphoraDriver::new()),
            certs: Arc::new(NoopCertGenerator::new()),
            switch,
            distributor,
            config,
        }
    }

    /// Returns the services view of this context.
    #[must_use]
    pub fn services(&self) -> Services {
        Services {
            repos: self.repos.clone(),
            compute: self.compute.clone(),
            network: self.network.clone(),
            amphora: self.amphora.clone(),
            distributor: Arc::new(LocalDistributorDriver::new(self.distributor.clone())),
            certs: self.certs.clone(),
            config: Arc::new(self.config.clone()),
        }
    }

    /// Returns a flow engine over this context.
    #[must_use]
    pub fn engine(&self) -> FlowEngine {
        FlowEngine::new(self.services())
    }

    /// Returns a cluster manager over this context.
    #[must_use]
    pub fn manager(&self) -> ClusterManager {
        ClusterManager::new(self.services())
    }

    /// Persists a load balancer.
    ///
    /// # Panics
    ///
    /// Panics if the repository rejects it.
    pub async fn seed_lb(&self, lb: LoadBalancer) -> LoadBalancer {
        self.repos
            .load_balancers
            .create(lb.clone())
            .await
            .expect("seed load balancer");
        lb
    }

    /// Persists `count` active listeners and attaches them to a load
    /// balancer.
    ///
    /// # Panics
    ///
    /// Panics if the load balancer does not exist.
    pub async fn seed_listeners(&self, lb_id: LoadBalancerId, count: u16) -> Vec<Listener> {
        let mut lb = self
            .repos
            .load_balancers
            .require(lb_id)
            .await
            .expect("load balancer exists");
        let mut listeners = Vec::with_capacity(usize::from(count));
        for i in 0..count {
            let listener = ListenerFactory::active(lb_id, 80 + i);
            self.repos
                .listeners
                .create(listener.clone())
                .await
                .expect("seed listener");
            lb.listener_ids.push(listener.id);
            listeners.push(listener);
        }
        self.repos
            .load_balancers
            .update(lb)
            .await
            .expect("attach listeners");
        listeners
    }

    /// Persists an amphora.
    ///
    /// # Panics
    ///
    /// Panics if the repository rejects it.
    pub async fn seed_amphora(&self, amphora: Amphora) -> Amphora {
        self.repos
            .amphorae
            .create(amphora.clone())
            .await
            .expect("seed amphora");
        amphora
    }

    /// Reloads an amphora.
    ///
    /// # Panics
    ///
    /// Panics if it does not exist.
    pub async fn amphora(&self, id: AmphoraId) -> Amphora {
        self.repos.amphorae.require(id).await.expect("amphora exists")
    }

    /// Reloads a load balancer.
    ///
    /// # Panics
    ///
    /// Panics if it does not exist.
    pub async fn lb(&self, id: LoadBalancerId) -> LoadBalancer {
        self.repos
            .load_balancers
            .require(id)
            .await
            .expect("load balancer exists")
    }
}

/// Controller configuration for tests: certificate transport, no sleeps
/// and the in-memory switch's frontend MAC.
#[must_use]
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        amp_active_retries: 3,
        amp_active_wait: std::time::Duration::from_millis(1),
        port_detach_timeout: std::time::Duration::from_millis(50),
        port_detach_interval: std::time::Duration::from_millis(1),
        distributor_frontend_mac: Some(FRONTEND_MAC.to_string()),
        ..ControllerConfig::default()
    }
}

/// Factory for load balancers.
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    /// A single-topology load balancer on 203.0.113.10.
    #[must_use]
    pub fn single() -> LoadBalancer {
        Self::with_topology(Topology::Single)
    }

    /// An active-standby load balancer on 203.0.113.10.
    #[must_use]
    pub fn active_standby() -> LoadBalancer {
        Self::with_topology(Topology::ActiveStandby)
    }

    /// An active-active load balancer with `cluster_size` slots.
    #[must_use]
    pub fn active_active(cluster_size: u32) -> LoadBalancer {
        let mut lb = Self::with_topology(Topology::ActiveActive);
        lb.cluster_size = Some(cluster_size);
        lb
    }

    fn with_topology(topology: Topology) -> LoadBalancer {
        let vip = Vip::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)));
        let mut lb = LoadBalancer::new(LoadBalancerId::generate(), vip, topology);
        lb.name = format!("lb-{}", lb.id);
        lb
    }
}

/// Factory for amphorae.
pub struct AmphoraFactory;

impl AmphoraFactory {
    /// A READY spare with a compute instance.
    #[must_use]
    pub fn spare() -> Amphora {
        let id = AmphoraId::generate();
        let mut amp = Amphora::new(id);
        amp.status = AmphoraStatus::Ready;
        amp.compute_id = Some(format!("compute-{id}"));
        amp.lb_network_ip = Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)));
        amp
    }

    /// An ALLOCATED amphora serving `lb_id` with `role`.
    #[must_use]
    pub fn allocated(lb_id: LoadBalancerId, role: AmphoraRole) -> Amphora {
        let mut amp = Self::spare();
        amp.status = AmphoraStatus::Allocated;
        amp.load_balancer_id = Some(lb_id);
        amp.role = Some(role);
        amp.vrrp_priority = role.vrrp_priority();
        amp
    }
}

/// Factory for listeners.
pub struct ListenerFactory;

impl ListenerFactory {
    /// An ACTIVE TCP listener.
    #[must_use]
    pub fn active(lb_id: LoadBalancerId, port: u16) -> Listener {
        let mut listener = Listener::new(ListenerId::generate(), lb_id, ListenerProtocol::Tcp, port);
        listener.provisioning_status = ProvisioningStatus::Active;
        listener
    }
}
