//! Network tasks: VIP plug, member network deltas and port detachment.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::drivers::NetworkDelta;
use crate::error::{Error, Result};
use crate::keys::{
    ADDED_PORTS, AMPHORA, AMPHORAE, AMPHORAE_NETWORK_CONFIG, DELTAS, LOADBALANCER,
};
use crate::task::{RevertOutcome, Task, TaskContext};

/// Plugs the load balancer VIP into every amphora in the collection.
pub struct AmphoraePlugVip;

#[async_trait]
impl Task for AmphoraePlugVip {
    fn name(&self) -> &str {
        "amphorae-plug-vip"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER.name(), AMPHORAE.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORAE_NETWORK_CONFIG.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb = ctx.get(LOADBALANCER)?;
        let mut configs = BTreeMap::new();
        for amphora in ctx.get(AMPHORAE)? {
            let config = ctx.services().network.plug_vip(&lb, &amphora).await?;
            configs.insert(amphora.id, config);
        }
        tracing::info!(lb_id = %lb.id, amphorae = configs.len(), "VIP plugged");
        ctx.put(AMPHORAE_NETWORK_CONFIG, configs)
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        let (Ok(lb), Ok(amphorae)) = (ctx.get(LOADBALANCER), ctx.get(AMPHORAE)) else {
            return RevertOutcome::Skipped;
        };
        let mut outcome = RevertOutcome::Reverted;
        for amphora in &amphorae {
            let result = ctx.services().network.unplug_vip(&lb, amphora).await;
            if RevertOutcome::from_result(self.name(), result) == RevertOutcome::LoggedFailure {
                outcome = RevertOutcome::LoggedFailure;
            }
        }
        outcome
    }
}

/// Removes the load balancer VIP from every amphora in the collection.
pub struct AmphoraeUnplugVip;

#[async_trait]
impl Task for AmphoraeUnplugVip {
    fn name(&self) -> &str {
        "amphorae-unplug-vip"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER.name(), AMPHORAE.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb = ctx.get(LOADBALANCER)?;
        for amphora in ctx.get(AMPHORAE)? {
            ctx.services().network.unplug_vip(&lb, &amphora).await?;
        }
        Ok(())
    }
}

/// Computes which member networks each amphora must gain or lose.
///
/// Boot networks and the VIP network are never removed.
pub struct CalculateDelta;

#[async_trait]
impl Task for CalculateDelta {
    fn name(&self) -> &str {
        "calculate-delta"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER.name(), AMPHORAE.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![DELTAS.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb = ctx.get(LOADBALANCER)?;
        let network = &ctx.services().network;

        let mut desired = BTreeSet::new();
        for member in ctx.repos().members_for_lb(lb.id).await? {
            if let Some(subnet_id) = &member.subnet_id {
                desired.insert(network.get_subnet(subnet_id).await?.network_id);
            }
        }
        let mut protected: BTreeSet<String> =
            ctx.config().amp_boot_networks.iter().cloned().collect();
        protected.extend(lb.vip.network_id.clone());
        desired.retain(|net| !protected.contains(net));

        let mut deltas = BTreeMap::new();
        for amphora in ctx.get(AMPHORAE)? {
            let Some(compute_id) = amphora.compute_id.clone() else {
                continue;
            };
            let existing: BTreeSet<String> = network
                .plugged_networks(&compute_id)
                .await?
                .into_iter()
                .collect();
            let delta = NetworkDelta {
                amphora_id: Some(amphora.id),
                add_networks: desired.difference(&existing).cloned().collect(),
                delete_networks: existing
                    .difference(&desired)
                    .filter(|net| !protected.contains(*net))
                    .cloned()
                    .collect(),
                compute_id,
            };
            deltas.insert(amphora.id, delta);
        }
        ctx.put(DELTAS, deltas)
    }
}

/// Applies member network deltas.
pub struct HandleNetworkDeltas;

#[async_trait]
impl Task for HandleNetworkDeltas {
    fn name(&self) -> &str {
        "handle-network-deltas"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![DELTAS.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![ADDED_PORTS.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let network = &ctx.services().network;
        let mut added = BTreeMap::new();
        for (amphora_id, delta) in ctx.get(DELTAS)? {
            let mut ports = Vec::with_capacity(delta.add_networks.len());
            for net in &delta.add_networks {
                ports.push(network.plug_network(&delta.compute_id, net).await?);
            }
            for net in &delta.delete_networks {
                network.unplug_network(&delta.compute_id, net).await?;
            }
            added.insert(amphora_id, ports);
        }
        ctx.put(ADDED_PORTS, added)
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        let Ok(deltas) = ctx.get(DELTAS) else {
            return RevertOutcome::Skipped;
        };
        let mut outcome = RevertOutcome::Reverted;
        for delta in deltas.values() {
            for net in &delta.add_networks {
                let result = ctx
                    .services()
                    .network
                    .unplug_network(&delta.compute_id, net)
                    .await;
                if RevertOutcome::from_result(self.name(), result) == RevertOutcome::LoggedFailure {
                    outcome = RevertOutcome::LoggedFailure;
                }
            }
        }
        outcome
    }
}

/// Waits until every port of the amphora's compute instance is detached.
///
/// Polls every `port_detach_interval` until `port_detach_timeout` elapses;
/// ports still attached after that fail the flow.
pub struct WaitForPortDetach;

#[async_trait]
impl Task for WaitForPortDetach {
    fn name(&self) -> &str {
        "wait-for-port-detach"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let amphora = ctx.get(AMPHORA)?;
        let Some(compute_id) = amphora.compute_id else {
            return Ok(());
        };
        let timeout = ctx.config().port_detach_timeout;
        let interval = ctx.config().port_detach_interval;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let ports = ctx.services().network.attached_ports(&compute_id).await?;
            if ports.is_empty() {
                tracing::debug!(amphora_id = %amphora.id, %compute_id, "ports detached");
                return Ok(());
            }
            if tokio::time::Instant::now() + interval > deadline {
                return Err(Error::PortDetachTimeout {
                    compute_id,
                    timeout_secs: timeout.as_secs(),
                    ports,
                });
            }
            tracing::debug!(%compute_id, remaining = ports.len(), "waiting for ports to detach");
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::drivers::{NetworkDriver, NoopNetworkDriver};
    use crate::engine::FlowEngine;
    use crate::flow::Flow;
    use crate::services::Services;
    use crate::store::FlowStore;
    use fleetlb_core::{
        Amphora, AmphoraId, LoadBalancer, LoadBalancerId, Member, MemberId, OperatingStatus,
        Pool, PoolId, ProvisioningStatus, Topology, Vip,
    };
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    fn services(network: &Arc<NoopNetworkDriver>) -> Services {
        let mut services = Services::noop();
        services.network = Arc::clone(network) as Arc<dyn NetworkDriver>;
        services.config = Arc::new(ControllerConfig {
            amp_boot_networks: vec!["mgmt".into()],
            port_detach_timeout: Duration::from_millis(40),
            port_detach_interval: Duration::from_millis(5),
            ..ControllerConfig::default()
        });
        services
    }

    fn amphora(compute_id: &str) -> Amphora {
        let mut amp = Amphora::new(AmphoraId::generate());
        amp.compute_id = Some(compute_id.to_string());
        amp
    }

    async fn lb_with_member(services: &Services, subnet: &str) -> LoadBalancer {
        let vip = Vip::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)));
        let mut lb = LoadBalancer::new(LoadBalancerId::generate(), vip, Topology::Single);
        let pool = Pool {
            id: PoolId::generate(),
            load_balancer_id: lb.id,
            lb_algorithm: "ROUND_ROBIN".into(),
            provisioning_status: ProvisioningStatus::Active,
            operating_status: OperatingStatus::Online,
        };
        let member = Member {
            id: MemberId::generate(),
            pool_id: pool.id,
            address: IpAddr::V4(Ipv4Addr::new(10, 1, 0, 4)),
            protocol_port: 8080,
            subnet_id: Some(subnet.to_string()),
            provisioning_status: ProvisioningStatus::Active,
            operating_status: OperatingStatus::Online,
        };
        lb.pool_ids.push(pool.id);
        services.repos.pools.create(pool).await.unwrap();
        services.repos.members.create(member).await.unwrap();
        services.repos.load_balancers.create(lb.clone()).await.unwrap();
        lb
    }

    #[tokio::test]
    async fn delta_adds_member_networks_and_drops_stale_ones() {
        let network = Arc::new(NoopNetworkDriver::new());
        let services = services(&network);
        let lb = lb_with_member(&services, "members").await;
        network.plug_network("compute-1", "mgmt").await.unwrap();
        network.plug_network("compute-1", "stale").await.unwrap();

        let flow = Flow::sequence(
            "deltas",
            vec![Flow::task(CalculateDelta), Flow::task(HandleNetworkDeltas)],
        );
        let amp = amphora("compute-1");
        let store = FlowEngine::new(services)
            .run(
                &flow,
                FlowStore::new()
                    .with(LOADBALANCER, lb)
                    .with(AMPHORAE, vec![amp.clone()]),
            )
            .await
            .unwrap();

        let delta = &store.get(DELTAS).unwrap()[&amp.id];
        assert_eq!(delta.add_networks, vec!["net-members".to_string()]);
        assert_eq!(delta.delete_networks, vec!["stale".to_string()]);
        assert_eq!(store.get(ADDED_PORTS).unwrap()[&amp.id].len(), 1);

        let mut plugged = network.networks_of("compute-1");
        plugged.sort();
        assert_eq!(plugged, vec!["mgmt".to_string(), "net-members".to_string()]);
    }

    #[tokio::test]
    async fn port_detach_waits_for_release() {
        let network = Arc::new(NoopNetworkDriver::new());
        network.hold_ports("compute-1", vec!["port-a".into()], 2);
        FlowEngine::new(services(&network))
            .run(
                &Flow::task(WaitForPortDetach),
                FlowStore::new().with(AMPHORA, amphora("compute-1")),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn port_detach_times_out() {
        let network = Arc::new(NoopNetworkDriver::new());
        network.hold_ports("compute-1", vec!["port-a".into()], u32::MAX);
        let err = FlowEngine::new(services(&network))
            .run(
                &Flow::task(WaitForPortDetach),
                FlowStore::new().with(AMPHORA, amphora("compute-1")),
            )
            .await
            .unwrap_err();
        match err.root_cause() {
            Error::PortDetachTimeout { ports, .. } => assert_eq!(ports, &vec!["port-a".to_string()]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn vip_plug_revert_unplugs_every_amphora() {
        let network = Arc::new(NoopNetworkDriver::new());
        let services = services(&network);
        let vip = Vip::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)));
        let lb = LoadBalancer::new(LoadBalancerId::generate(), vip, Topology::ActiveActive);
        let amps = vec![amphora("compute-1"), amphora("compute-2")];

        let node = crate::task::TaskNode::new(AmphoraePlugVip);
        let store = FlowStore::new()
            .with(LOADBALANCER, lb)
            .with(AMPHORAE, amps.clone());
        let ctx = TaskContext::new(&node, &store, &services);
        node.task().execute(&ctx).await.unwrap();
        assert!(amps.iter().all(|a| network.vip_plugged(a.id)));

        assert_eq!(node.task().revert(&ctx).await, RevertOutcome::Reverted);
        assert!(amps.iter().all(|a| !network.vip_plugged(a.id)));
    }
}
