//! Distributor tasks.

use std::net::IpAddr;

use async_trait::async_trait;

use fleetlb_core::repository::update_with;
use fleetlb_core::{AmphoraId, LoadBalancerId, ProvisioningStatus};
use fleetlb_distributor::{ErrorKind, PlugVipRequest, RegisterRequest, UnregisterRequest};

use crate::error::{Error, Result};
use crate::keys::{
    AMPHORA, AMPHORAE, AMPHORA_MAC, CLUSTER_ALG_TYPE, CLUSTER_MIN_SIZE, CLUSTER_SLOT, DISTRIBUTOR,
    DISTRIBUTOR_INFO, LOADBALANCER,
};
use crate::task::{RevertOutcome, Task, TaskContext};

/// Creates the distributor datapath for a load balancer's VIP.
///
/// The frontend MAC comes from the distributor record, falling back to
/// `distributor_frontend_mac` in the controller configuration.
pub struct DistributorPostVipPlug;

#[async_trait]
impl Task for DistributorPostVipPlug {
    fn name(&self) -> &str {
        "distributor-post-vip-plug"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![
            LOADBALANCER.name(),
            DISTRIBUTOR.name(),
            CLUSTER_ALG_TYPE.name(),
            CLUSTER_MIN_SIZE.name(),
        ]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![DISTRIBUTOR_INFO.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb = ctx.get(LOADBALANCER)?;
        let record = ctx.get(DISTRIBUTOR)?;
        let mac = record
            .frontend_mac
            .clone()
            .or_else(|| ctx.config().distributor_frontend_mac.clone())
            .ok_or_else(|| {
                Error::config(format!(
                    "distributor {} has no frontend MAC and distributor_frontend_mac is unset",
                    record.id
                ))
            })?;
        let (subnet_cidr, gateway) = match &lb.vip.subnet_id {
            Some(subnet_id) => {
                let subnet = ctx.services().network.get_subnet(subnet_id).await?;
                (subnet.cidr, subnet.gateway)
            }
            None => (String::new(), None),
        };

        let info = ctx
            .services()
            .distributor
            .post_vip_plug(PlugVipRequest {
                lb_id: lb.id,
                vip: lb.vip.ip_address,
                mac,
                subnet_cidr,
                gateway,
                alg_type: ctx.get(CLUSTER_ALG_TYPE)?,
                min_size: ctx.get(CLUSTER_MIN_SIZE)?,
            })
            .await?;
        tracing::info!(lb_id = %lb.id, bridge = %info.bridge, size = info.size, "distributor plugged");
        ctx.put(DISTRIBUTOR_INFO, info)
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        let Ok(lb) = ctx.get(LOADBALANCER) else {
            return RevertOutcome::Skipped;
        };
        let result = ctx
            .repos()
            .mark_lb_and_listeners(lb.id, ProvisioningStatus::Error)
            .await;
        RevertOutcome::from_result(self.name(), result)
    }
}

/// Binds an amphora to a distributor slot and records the slot.
///
/// The slot is taken from an injected `cluster_slot`, then from the
/// amphora's recorded slot; without either the distributor picks the lowest
/// free slot.
pub struct RegisterAmphoraToDistributor;

#[async_trait]
impl Task for RegisterAmphoraToDistributor {
    fn name(&self) -> &str {
        "register-amphora-to-distributor"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER.name(), AMPHORA.name(), AMPHORA_MAC.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb = ctx.get(LOADBALANCER)?;
        let amphora = ctx.get(AMPHORA)?;
        let slot = ctx.get_opt(CLUSTER_SLOT)?.or(amphora.cluster_slot);
        let bound = ctx
            .services()
            .distributor
            .register_amphora(RegisterRequest {
                lb_id: lb.id,
                vip: Some(lb.vip.ip_address),
                amphora_id: amphora.id,
                amphora_mac: ctx.get(AMPHORA_MAC)?,
                slot,
            })
            .await?;
        update_with(&*ctx.repos().amphorae, amphora.id, |amp| {
            amp.cluster_slot = Some(bound);
        })
        .await?;
        tracing::info!(lb_id = %lb.id, amphora_id = %amphora.id, slot = bound, "amphora registered");
        Ok(())
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        let (Ok(lb), Ok(amphora)) = (ctx.get(LOADBALANCER), ctx.get(AMPHORA)) else {
            return RevertOutcome::Skipped;
        };
        let result = ctx
            .services()
            .distributor
            .unregister_amphora(UnregisterRequest {
                lb_id: lb.id,
                vip: Some(lb.vip.ip_address),
                amphora_id: amphora.id,
            })
            .await;
        match result {
            Ok(_) => RevertOutcome::Reverted,
            Err(err) if err.kind() == ErrorKind::Usage => RevertOutcome::Skipped,
            Err(err) => RevertOutcome::from_result(self.name(), Err(err)),
        }
    }
}

async fn unregister(
    ctx: &TaskContext<'_>,
    lb_id: LoadBalancerId,
    vip: IpAddr,
    amphora_id: AmphoraId,
) -> Result<()> {
    let result = ctx
        .services()
        .distributor
        .unregister_amphora(UnregisterRequest {
            lb_id,
            vip: Some(vip),
            amphora_id,
        })
        .await;
    match result {
        Ok(slot) => {
            tracing::info!(%lb_id, %amphora_id, slot, "amphora unregistered");
        }
        Err(err) if err.kind() == ErrorKind::Usage => {
            tracing::warn!(%lb_id, %amphora_id, error = %err, "amphora was not registered");
        }
        Err(err) => return Err(err.into()),
    }
    if ctx.repos().amphorae.get(amphora_id).await?.is_some() {
        update_with(&*ctx.repos().amphorae, amphora_id, |amp| amp.cluster_slot = None).await?;
    }
    Ok(())
}

/// Releases an amphora's distributor slot.
///
/// An amphora that is not registered (or a distributor that is gone) is
/// not an error.
pub struct UnregisterAmphoraFromDistributor;

#[async_trait]
impl Task for UnregisterAmphoraFromDistributor {
    fn name(&self) -> &str {
        "unregister-amphora-from-distributor"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER.name(), AMPHORA.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb = ctx.get(LOADBALANCER)?;
        let amphora = ctx.get(AMPHORA)?;
        unregister(ctx, lb.id, lb.vip.ip_address, amphora.id).await
    }
}

/// Releases the distributor slots of every amphora in the collection.
pub struct UnregisterAmphoraeFromDistributor;

#[async_trait]
impl Task for UnregisterAmphoraeFromDistributor {
    fn name(&self) -> &str {
        "unregister-amphorae-from-distributor"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER.name(), AMPHORAE.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb = ctx.get(LOADBALANCER)?;
        for amphora in ctx.get(AMPHORAE)? {
            unregister(ctx, lb.id, lb.vip.ip_address, amphora.id).await?;
        }
        Ok(())
    }
}

/// Removes the distributor datapath of a load balancer.
pub struct DistributorPreVipUnplug;

#[async_trait]
impl Task for DistributorPreVipUnplug {
    fn name(&self) -> &str {
        "distributor-pre-vip-unplug"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb = ctx.get(LOADBALANCER)?;
        match ctx
            .services()
            .distributor
            .pre_vip_unplug(lb.id, lb.vip.ip_address)
            .await
        {
            Ok(()) => Ok(()),
            Err(fleetlb_distributor::Error::NotFound { lb_id }) => {
                tracing::warn!(%lb_id, "distributor already gone");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{amphora_mac, DistributorDriver, NoopDistributorDriver};
    use crate::engine::FlowEngine;
    use crate::flow::Flow;
    use crate::services::Services;
    use crate::store::FlowStore;
    use crate::task::TaskNode;
    use fleetlb_core::{Amphora, DistributorId, DistributorRecord, LoadBalancer, Topology, Vip};
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn services(driver: &Arc<NoopDistributorDriver>) -> Services {
        let mut services = Services::noop();
        services.distributor = Arc::clone(driver) as Arc<dyn DistributorDriver>;
        services
    }

    fn lb() -> LoadBalancer {
        let vip = Vip::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 20)));
        LoadBalancer::new(LoadBalancerId::generate(), vip, Topology::ActiveActive)
    }

    fn record(mac: Option<&str>) -> DistributorRecord {
        let mut record = DistributorRecord::new(DistributorId::generate(), "dist");
        record.frontend_mac = mac.map(str::to_string);
        record
    }

    fn plug_store(lb: &LoadBalancer, record: DistributorRecord) -> FlowStore {
        FlowStore::new()
            .with(LOADBALANCER, lb.clone())
            .with(DISTRIBUTOR, record)
            .with(CLUSTER_ALG_TYPE, fleetlb_distributor::ACTIVE_ACTIVE_ALGORITHM.to_string())
            .with(CLUSTER_MIN_SIZE, 2)
    }

    #[tokio::test]
    async fn post_vip_plug_uses_record_mac() {
        let driver = Arc::new(NoopDistributorDriver::new());
        let lb = lb();
        let store = FlowEngine::new(services(&driver))
            .run(
                &Flow::task(DistributorPostVipPlug),
                plug_store(&lb, record(Some("02:00:00:00:00:bb"))),
            )
            .await
            .unwrap();
        let info = store.get(DISTRIBUTOR_INFO).unwrap();
        assert_eq!(info.mac, "02:00:00:00:00:bb");
        assert_eq!(info.size, 2);
    }

    #[tokio::test]
    async fn post_vip_plug_without_any_mac_is_a_config_error() {
        let driver = Arc::new(NoopDistributorDriver::new());
        let err = FlowEngine::new(services(&driver))
            .run(&Flow::task(DistributorPostVipPlug), plug_store(&lb(), record(None)))
            .await
            .unwrap_err();
        assert!(matches!(err.root_cause(), Error::Config { .. }));
    }

    #[tokio::test]
    async fn post_vip_plug_revert_marks_load_balancer_error() {
        let services = Services::noop();
        let lb = lb();
        services.repos.load_balancers.create(lb.clone()).await.unwrap();
        let node = TaskNode::new(DistributorPostVipPlug);
        let store = plug_store(&lb, record(None));
        let ctx = TaskContext::new(&node, &store, &services);
        assert_eq!(node.task().revert(&ctx).await, RevertOutcome::Reverted);
        let stored = services.repos.load_balancers.require(lb.id).await.unwrap();
        assert_eq!(stored.provisioning_status, ProvisioningStatus::Error);
    }

    #[tokio::test]
    async fn register_records_slot_and_revert_unregisters() {
        let driver = Arc::new(NoopDistributorDriver::new());
        let services = services(&driver);
        let lb = lb();
        let mut store = plug_store(&lb, record(Some("02:00:00:00:00:bb")));
        store = FlowEngine::new(services.clone())
            .run(&Flow::task(DistributorPostVipPlug), store)
            .await
            .unwrap();

        let amp = Amphora::new(AmphoraId::generate());
        services.repos.amphorae.create(amp.clone()).await.unwrap();
        let node = TaskNode::new(RegisterAmphoraToDistributor).inject(CLUSTER_SLOT, 1);
        let store = store
            .with(AMPHORA, amp.clone())
            .with(AMPHORA_MAC, amphora_mac(amp.id));
        let store = FlowEngine::new(services.clone())
            .run(&Flow::Task(node.clone()), store)
            .await
            .unwrap();
        let stored = services.repos.amphorae.require(amp.id).await.unwrap();
        assert_eq!(stored.cluster_slot, Some(1));
        assert_eq!(driver.status(lb.id).await.unwrap().registered, 1);

        let ctx = TaskContext::new(&node, &store, &services);
        assert_eq!(node.task().revert(&ctx).await, RevertOutcome::Reverted);
        assert_eq!(driver.status(lb.id).await.unwrap().registered, 0);
    }

    #[tokio::test]
    async fn unregister_tolerates_unknown_amphora() {
        let driver = Arc::new(NoopDistributorDriver::new());
        let lb = lb();
        let store = FlowEngine::new(services(&driver))
            .run(
                &Flow::task(DistributorPostVipPlug),
                plug_store(&lb, record(Some("02:00:00:00:00:bb"))),
            )
            .await
            .unwrap()
            .with(AMPHORAE, vec![Amphora::new(AmphoraId::generate())]);
        FlowEngine::new(services(&driver))
            .run(&Flow::task(UnregisterAmphoraeFromDistributor), store)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pre_vip_unplug_tolerates_missing_distributor() {
        let driver = Arc::new(NoopDistributorDriver::new());
        FlowEngine::new(services(&driver))
            .run(
                &Flow::task(DistributorPreVipUnplug),
                FlowStore::new().with(LOADBALANCER, lb()),
            )
            .await
            .unwrap();
    }
}
