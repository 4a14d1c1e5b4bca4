//! Repository tasks: status transitions, lookups and spare allocation.

use std::marker::PhantomData;

use async_trait::async_trait;

use fleetlb_core::repository::update_with;
use fleetlb_core::{
    Amphora, AmphoraStatus, OperatingStatus, ProvisioningStatus, Repositories,
    RepositoryFor, StatusEntity, VrrpGroup,
};

use crate::error::Result;
use crate::keys::{
    ALLOCATED_AMPHORA_ID, AMPHORA, AMPHORAE, AMPHORAE_NETWORK_CONFIG, AMPHORA_ID, COMPUTE_ID,
    FAILED_AMPHORA, LISTENERS, LOADBALANCER, LOADBALANCER_ID, ROLE,
};
use crate::store::Key;
use crate::task::{RevertOutcome, Task, TaskContext};

use super::amphora_to_error;

/// Sets the provisioning status of any status-carrying entity.
///
/// Revert writes ERROR to both status columns.
pub struct MarkStatus<E: StatusEntity> {
    name: String,
    id: Key<E::Id>,
    status: ProvisioningStatus,
    operating: Option<OperatingStatus>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: StatusEntity> MarkStatus<E> {
    /// Marks the entity whose id is stored under `id`.
    pub fn new(id: Key<E::Id>, status: ProvisioningStatus) -> Self {
        Self {
            name: format!("mark-{}-{}", E::KIND, status.as_str().to_ascii_lowercase()),
            id,
            status,
            operating: None,
            _entity: PhantomData,
        }
    }

    /// Also sets the operating status.
    #[must_use]
    pub fn with_operating(mut self, status: OperatingStatus) -> Self {
        self.operating = Some(status);
        self
    }

    /// `PENDING_CREATE`.
    pub fn pending_create(id: Key<E::Id>) -> Self {
        Self::new(id, ProvisioningStatus::PendingCreate)
    }

    /// `ACTIVE`.
    pub fn active(id: Key<E::Id>) -> Self {
        Self::new(id, ProvisioningStatus::Active)
    }

    /// `PENDING_DELETE`.
    pub fn pending_delete(id: Key<E::Id>) -> Self {
        Self::new(id, ProvisioningStatus::PendingDelete)
    }

    /// `DELETED`.
    pub fn deleted(id: Key<E::Id>) -> Self {
        Self::new(id, ProvisioningStatus::Deleted)
    }
}

#[async_trait]
impl<E> Task for MarkStatus<E>
where
    E: StatusEntity,
    Repositories: RepositoryFor<E>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![self.id.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let id = ctx.get(self.id)?;
        let (status, operating) = (self.status, self.operating);
        update_with(ctx.repos().of::<E>(), id, move |entity| {
            entity.set_provisioning_status(status);
            if let Some(operating) = operating {
                entity.set_operating_status(operating);
            }
        })
        .await?;
        tracing::debug!(kind = E::KIND, %id, status = %status, "status updated");
        Ok(())
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        let Ok(id) = ctx.get(self.id) else {
            return RevertOutcome::Skipped;
        };
        let result = update_with(ctx.repos().of::<E>(), id, |entity| {
            entity.set_provisioning_status(ProvisioningStatus::Error);
            entity.set_operating_status(OperatingStatus::Error);
        })
        .await
        .map(|_| ());
        RevertOutcome::from_result(&self.name, result)
    }
}

/// Sets the provisioning status of a load balancer and its listeners.
pub struct MarkLoadBalancerStatus {
    name: &'static str,
    status: ProvisioningStatus,
}

impl MarkLoadBalancerStatus {
    /// `ACTIVE`.
    #[must_use]
    pub const fn active() -> Self {
        Self {
            name: "mark-loadbalancer-active",
            status: ProvisioningStatus::Active,
        }
    }

    /// `PENDING_DELETE`.
    #[must_use]
    pub const fn pending_delete() -> Self {
        Self {
            name: "mark-loadbalancer-pending-delete",
            status: ProvisioningStatus::PendingDelete,
        }
    }

    /// `DELETED`.
    #[must_use]
    pub const fn deleted() -> Self {
        Self {
            name: "mark-loadbalancer-deleted",
            status: ProvisioningStatus::Deleted,
        }
    }
}

#[async_trait]
impl Task for MarkLoadBalancerStatus {
    fn name(&self) -> &str {
        self.name
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER_ID.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb_id = ctx.get(LOADBALANCER_ID)?;
        ctx.repos().mark_lb_and_listeners(lb_id, self.status).await?;
        tracing::info!(%lb_id, status = %self.status, "load balancer status updated");
        Ok(())
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        let Ok(lb_id) = ctx.get(LOADBALANCER_ID) else {
            return RevertOutcome::Skipped;
        };
        let result = ctx
            .repos()
            .mark_lb_and_listeners(lb_id, ProvisioningStatus::Error)
            .await;
        RevertOutcome::from_result(self.name, result)
    }
}

/// Creates an amphora row in `PENDING_CREATE`.
pub struct CreateAmphoraInDb;

#[async_trait]
impl Task for CreateAmphoraInDb {
    fn name(&self) -> &str {
        "create-amphora-in-db"
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let amphora = Amphora::new(fleetlb_core::AmphoraId::generate());
        let id = amphora.id;
        ctx.repos().amphorae.create(amphora).await?;
        tracing::info!(amphora_id = %id, "amphora row created");
        ctx.put(AMPHORA_ID, id)
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        amphora_to_error(ctx).await
    }
}

/// Sets an amphora's lifecycle status.
pub struct MarkAmphoraStatus {
    name: &'static str,
    status: AmphoraStatus,
}

impl MarkAmphoraStatus {
    /// `READY`.
    #[must_use]
    pub const fn ready() -> Self {
        Self {
            name: "mark-amphora-ready",
            status: AmphoraStatus::Ready,
        }
    }

    /// `ALLOCATED`.
    #[must_use]
    pub const fn allocated() -> Self {
        Self {
            name: "mark-amphora-allocated",
            status: AmphoraStatus::Allocated,
        }
    }

    /// `PENDING_DELETE`.
    #[must_use]
    pub const fn pending_delete() -> Self {
        Self {
            name: "mark-amphora-pending-delete",
            status: AmphoraStatus::PendingDelete,
        }
    }

    /// `DELETED`.
    #[must_use]
    pub const fn deleted() -> Self {
        Self {
            name: "mark-amphora-deleted",
            status: AmphoraStatus::Deleted,
        }
    }
}

#[async_trait]
impl Task for MarkAmphoraStatus {
    fn name(&self) -> &str {
        self.name
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let amphora_id = ctx.get(AMPHORA_ID)?;
        ctx.repos().mark_amphora(amphora_id, self.status).await?;
        tracing::info!(%amphora_id, status = %self.status, "amphora status updated");
        Ok(())
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        amphora_to_error(ctx).await
    }
}

/// Records the compute id and moves the amphora to `BOOTING`.
pub struct MarkAmphoraBooting;

#[async_trait]
impl Task for MarkAmphoraBooting {
    fn name(&self) -> &str {
        "mark-amphora-booting"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID.name(), COMPUTE_ID.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let amphora_id = ctx.get(AMPHORA_ID)?;
        let compute_id = ctx.get(COMPUTE_ID)?;
        update_with(&*ctx.repos().amphorae, amphora_id, |amp| {
            amp.status = AmphoraStatus::Booting;
            amp.compute_id = Some(compute_id);
        })
        .await?;
        Ok(())
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        amphora_to_error(ctx).await
    }
}

/// Reads the amphora's compute details into its record.
pub struct UpdateAmphoraComputeDetails;

#[async_trait]
impl Task for UpdateAmphoraComputeDetails {
    fn name(&self) -> &str {
        "update-amphora-compute-details"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID.name(), COMPUTE_ID.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORA.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let amphora_id = ctx.get(AMPHORA_ID)?;
        let compute_id = ctx.get(COMPUTE_ID)?;
        let details = ctx.services().compute.details(&compute_id).await?;
        let amphora = update_with(&*ctx.repos().amphorae, amphora_id, |amp| {
            amp.compute_id = Some(details.compute_id);
            amp.lb_network_ip = details.lb_network_ip;
        })
        .await?;
        ctx.put(AMPHORA, amphora)
    }
}

/// Reloads an amphora record.
pub struct ReloadAmphora;

#[async_trait]
impl Task for ReloadAmphora {
    fn name(&self) -> &str {
        "reload-amphora"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORA.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let amphora = ctx.repos().amphorae.require(ctx.get(AMPHORA_ID)?).await?;
        ctx.put(AMPHORA, amphora)
    }
}

/// Reloads a load balancer record.
pub struct ReloadLoadBalancer;

#[async_trait]
impl Task for ReloadLoadBalancer {
    fn name(&self) -> &str {
        "reload-loadbalancer"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER_ID.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![LOADBALANCER.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb = ctx
            .repos()
            .load_balancers
            .require(ctx.get(LOADBALANCER_ID)?)
            .await?;
        ctx.put(LOADBALANCER, lb)
    }
}

/// Loads the listeners of a load balancer.
pub struct GetListenersFromLoadBalancer;

#[async_trait]
impl Task for GetListenersFromLoadBalancer {
    fn name(&self) -> &str {
        "get-listeners-from-loadbalancer"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER_ID.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![LISTENERS.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let listeners = ctx
            .repos()
            .listeners_for_lb(ctx.get(LOADBALANCER_ID)?)
            .await?;
        ctx.put(LISTENERS, listeners)
    }
}

/// Loads the live amphorae of a load balancer.
pub struct GetAmphoraeFromLoadBalancer;

#[async_trait]
impl Task for GetAmphoraeFromLoadBalancer {
    fn name(&self) -> &str {
        "get-amphorae-from-loadbalancer"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER_ID.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORAE.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let amphorae = ctx
            .repos()
            .amphorae_for_lb(ctx.get(LOADBALANCER_ID)?)
            .await?;
        ctx.put(AMPHORAE, amphorae)
    }
}

/// Narrows the collection-based network tasks to one amphora.
pub struct CollectAmphora;

#[async_trait]
impl Task for CollectAmphora {
    fn name(&self) -> &str {
        "collect-amphora"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORAE.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        ctx.put(AMPHORAE, vec![ctx.get(AMPHORA)?])
    }
}

/// Claims a spare amphora for the load balancer, if the pool has one.
///
/// Provides `None` when the pool is empty; the decision after this task
/// picks between mapping the spare and building a new amphora.
pub struct MapLoadBalancerToAmphora;

#[async_trait]
impl Task for MapLoadBalancerToAmphora {
    fn name(&self) -> &str {
        "map-loadbalancer-to-amphora"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER_ID.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![ALLOCATED_AMPHORA_ID.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb_id = ctx.get(LOADBALANCER_ID)?;
        let allocated = ctx.repos().amphorae.allocate_spare(lb_id).await?;
        match &allocated {
            Some(amp) => tracing::info!(%lb_id, amphora_id = %amp.id, "allocated spare amphora"),
            None => tracing::info!(%lb_id, "no spare amphora available"),
        }
        ctx.put(ALLOCATED_AMPHORA_ID, allocated.map(|amp| amp.id))
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        let Ok(Some(amphora_id)) = ctx.get(ALLOCATED_AMPHORA_ID) else {
            return RevertOutcome::Skipped;
        };
        let result = ctx
            .repos()
            .mark_amphora(amphora_id, AmphoraStatus::Error)
            .await
            .map(|_| ());
        RevertOutcome::from_result(self.name(), result)
    }
}

/// Continues with the spare claimed by [`MapLoadBalancerToAmphora`].
pub struct UseAllocatedAmphora;

#[async_trait]
impl Task for UseAllocatedAmphora {
    fn name(&self) -> &str {
        "use-allocated-amphora"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![ALLOCATED_AMPHORA_ID.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let id = ctx
            .get(ALLOCATED_AMPHORA_ID)?
            .ok_or_else(|| crate::error::Error::internal("no amphora was allocated"))?;
        ctx.put(AMPHORA_ID, id)
    }
}

/// Binds a new amphora to the load balancer and marks it `ALLOCATED`.
pub struct MapAmphoraToLoadBalancer;

#[async_trait]
impl Task for MapAmphoraToLoadBalancer {
    fn name(&self) -> &str {
        "map-amphora-to-loadbalancer"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID.name(), LOADBALANCER_ID.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb_id = ctx.get(LOADBALANCER_ID)?;
        update_with(&*ctx.repos().amphorae, ctx.get(AMPHORA_ID)?, |amp| {
            amp.load_balancer_id = Some(lb_id);
            amp.status = AmphoraStatus::Allocated;
        })
        .await?;
        Ok(())
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        amphora_to_error(ctx).await
    }
}

/// Sets the amphora's role and VRRP priority. The role is injected.
pub struct MarkAmphoraRole;

#[async_trait]
impl Task for MarkAmphoraRole {
    fn name(&self) -> &str {
        "mark-amphora-role"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID.name(), ROLE.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORA.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let role = ctx.get(ROLE)?;
        let amphora = update_with(&*ctx.repos().amphorae, ctx.get(AMPHORA_ID)?, |amp| {
            amp.role = Some(role);
            amp.vrrp_priority = role.vrrp_priority();
        })
        .await?;
        tracing::info!(amphora_id = %amphora.id, role = %role, "amphora role set");
        ctx.put(AMPHORA, amphora)
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        let Ok(amphora_id) = ctx.get(AMPHORA_ID) else {
            return RevertOutcome::Skipped;
        };
        let result = update_with(&*ctx.repos().amphorae, amphora_id, |amp| {
            amp.role = None;
            amp.vrrp_priority = None;
        })
        .await
        .map(|_| ());
        RevertOutcome::from_result(self.name(), result)
    }
}

/// Copies the VRRP/HA identity and cluster slot of a failed amphora onto its
/// replacement.
pub struct CopyAmphoraNetworkIdentity;

#[async_trait]
impl Task for CopyAmphoraNetworkIdentity {
    fn name(&self) -> &str {
        "copy-amphora-network-identity"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![FAILED_AMPHORA.name(), AMPHORA_ID.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORA.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let failed = ctx.get(FAILED_AMPHORA)?;
        let amphora = update_with(&*ctx.repos().amphorae, ctx.get(AMPHORA_ID)?, |amp| {
            amp.vrrp_ip = failed.vrrp_ip;
            amp.ha_ip = failed.ha_ip;
            amp.vrrp_port_id.clone_from(&failed.vrrp_port_id);
            amp.ha_port_id.clone_from(&failed.ha_port_id);
            amp.vrrp_id = failed.vrrp_id;
            amp.cluster_slot = failed.cluster_slot;
        })
        .await?;
        ctx.put(AMPHORA, amphora)
    }
}

/// Writes the VIP plug results into the amphora records.
pub struct UpdateAmphoraeVipData;

#[async_trait]
impl Task for UpdateAmphoraeVipData {
    fn name(&self) -> &str {
        "update-amphorae-vip-data"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORAE_NETWORK_CONFIG.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORAE.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let configs = ctx.get(AMPHORAE_NETWORK_CONFIG)?;
        let mut amphorae = Vec::with_capacity(configs.len());
        for (amphora_id, config) in configs {
            let amphora = update_with(&*ctx.repos().amphorae, amphora_id, |amp| {
                amp.vrrp_ip = config.vrrp_ip;
                amp.ha_ip = Some(config.ha_ip);
                amp.vrrp_port_id = Some(config.vrrp_port_id);
                amp.ha_port_id = Some(config.ha_port_id);
            })
            .await?;
            amphorae.push(amphora);
        }
        ctx.put(AMPHORAE, amphorae)
    }
}

/// Creates the VRRP group of an active/standby load balancer if missing.
pub struct CreateVrrpGroupForLoadBalancer;

#[async_trait]
impl Task for CreateVrrpGroupForLoadBalancer {
    fn name(&self) -> &str {
        "create-vrrp-group-for-loadbalancer"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER_ID.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb_id = ctx.get(LOADBALANCER_ID)?;
        if ctx.repos().vrrp_groups.get(lb_id).await?.is_some() {
            return Ok(());
        }
        let simple = lb_id.as_uuid().simple().to_string();
        let group = VrrpGroup {
            load_balancer_id: lb_id,
            vrrp_group_name: simple.chars().take(16).collect(),
            vrrp_auth_type: "PASS".to_string(),
            vrrp_auth_pass: simple.chars().rev().take(7).collect(),
            advert_int: 1,
        };
        ctx.repos().vrrp_groups.create(group).await?;
        Ok(())
    }
}

/// Stops health checks of an amphora by marking its health row busy.
pub struct MarkAmphoraHealthBusy;

#[async_trait]
impl Task for MarkAmphoraHealthBusy {
    fn name(&self) -> &str {
        "mark-amphora-health-busy"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let amphora_id = ctx.get(AMPHORA_ID)?;
        let Some(mut health) = ctx.repos().amphora_health.get(amphora_id).await? else {
            tracing::debug!(%amphora_id, "no health row to suspend");
            return Ok(());
        };
        health.busy = true;
        ctx.repos().amphora_health.update(health).await?;
        Ok(())
    }
}

/// Marks every amphora in the collection `DELETED`.
pub struct MarkAmphoraeDeleted;

#[async_trait]
impl Task for MarkAmphoraeDeleted {
    fn name(&self) -> &str {
        "mark-amphorae-deleted"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORAE.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        for amphora in ctx.get(AMPHORAE)? {
            ctx.repos()
                .mark_amphora(amphora.id, AmphoraStatus::Deleted)
                .await?;
            ctx.repos().amphora_health.delete(amphora.id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FlowEngine;
    use crate::flow::Flow;
    use crate::services::Services;
    use crate::store::FlowStore;
    use crate::task::TaskNode;
    use fleetlb_core::{
        AmphoraHealth, AmphoraId, AmphoraRole, Listener, ListenerId, ListenerProtocol, LoadBalancer,
        LoadBalancerId, Pool, PoolId, Topology, Vip,
    };
    use std::net::{IpAddr, Ipv4Addr};

    fn fresh_health(amphora_id: AmphoraId) -> AmphoraHealth {
        AmphoraHealth {
            amphora_id,
            last_update: chrono::Utc::now(),
            busy: false,
        }
    }

    async fn seeded_lb(services: &Services) -> LoadBalancer {
        let vip = Vip::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)));
        let mut lb = LoadBalancer::new(LoadBalancerId::generate(), vip, Topology::Single);
        let listener = Listener::new(ListenerId::generate(), lb.id, ListenerProtocol::Http, 80);
        lb.listener_ids.push(listener.id);
        services.repos.listeners.create(listener).await.unwrap();
        services.repos.load_balancers.create(lb.clone()).await.unwrap();
        lb
    }

    #[tokio::test]
    async fn generic_mark_status_updates_any_entity() {
        let services = Services::noop();
        let lb_id = LoadBalancerId::generate();
        let pool = Pool {
            id: PoolId::generate(),
            load_balancer_id: lb_id,
            lb_algorithm: "ROUND_ROBIN".into(),
            provisioning_status: ProvisioningStatus::PendingCreate,
            operating_status: OperatingStatus::Offline,
        };
        services.repos.pools.create(pool.clone()).await.unwrap();

        const POOL_ID: Key<PoolId> = Key::new("pool_id");
        let task = MarkStatus::<Pool>::active(POOL_ID).with_operating(OperatingStatus::Online);
        assert_eq!(task.name(), "mark-pool-active");

        let engine = FlowEngine::new(services.clone());
        engine
            .run(&Flow::task(task), FlowStore::new().with(POOL_ID, pool.id))
            .await
            .unwrap();

        let stored = services.repos.pools.require(pool.id).await.unwrap();
        assert_eq!(stored.provisioning_status, ProvisioningStatus::Active);
        assert_eq!(stored.operating_status, OperatingStatus::Online);
    }

    #[tokio::test]
    async fn generic_revert_writes_error_columns() {
        let services = Services::noop();
        let lb = seeded_lb(&services).await;
        let listener_id = lb.listener_ids[0];

        const LISTENER_ID: Key<ListenerId> = Key::new("listener_id");
        let node = TaskNode::new(MarkStatus::<Listener>::active(LISTENER_ID));
        let store = FlowStore::new().with(LISTENER_ID, listener_id);
        let ctx = TaskContext::new(&node, &store, &services);

        assert_eq!(node.task().revert(&ctx).await, RevertOutcome::Reverted);
        let listener = services.repos.listeners.require(listener_id).await.unwrap();
        assert_eq!(listener.provisioning_status, ProvisioningStatus::Error);
        assert_eq!(listener.operating_status, OperatingStatus::Error);
    }

    #[tokio::test]
    async fn revert_tolerates_missing_rows() {
        let services = Services::noop();
        let node = TaskNode::new(MarkLoadBalancerStatus::active());
        let store = FlowStore::new().with(LOADBALANCER_ID, LoadBalancerId::generate());
        let ctx = TaskContext::new(&node, &store, &services);
        assert_eq!(node.task().revert(&ctx).await, RevertOutcome::LoggedFailure);
    }

    #[tokio::test]
    async fn load_balancer_status_cascades_to_listeners() {
        let services = Services::noop();
        let lb = seeded_lb(&services).await;
        FlowEngine::new(services.clone())
            .run(
                &Flow::task(MarkLoadBalancerStatus::active()),
                FlowStore::new().with(LOADBALANCER_ID, lb.id),
            )
            .await
            .unwrap();
        let listener = services
            .repos
            .listeners
            .require(lb.listener_ids[0])
            .await
            .unwrap();
        assert_eq!(listener.provisioning_status, ProvisioningStatus::Active);
    }

    #[tokio::test]
    async fn spare_allocation_reports_none_on_empty_pool() {
        let services = Services::noop();
        let store = FlowEngine::new(services)
            .run(
                &Flow::task(MapLoadBalancerToAmphora),
                FlowStore::new().with(LOADBALANCER_ID, LoadBalancerId::generate()),
            )
            .await
            .unwrap();
        assert_eq!(store.get(ALLOCATED_AMPHORA_ID).unwrap(), None);
    }

    #[tokio::test]
    async fn role_sets_vrrp_priority() {
        let services = Services::noop();
        let amp = Amphora::new(AmphoraId::generate());
        services.repos.amphorae.create(amp.clone()).await.unwrap();

        let node = TaskNode::new(MarkAmphoraRole).inject(ROLE, AmphoraRole::Master);
        let store = FlowEngine::new(services.clone())
            .run(&Flow::Task(node), FlowStore::new().with(AMPHORA_ID, amp.id))
            .await
            .unwrap();

        let stored = store.get(AMPHORA).unwrap();
        assert_eq!(stored.role, Some(AmphoraRole::Master));
        assert_eq!(stored.vrrp_priority, Some(100));
    }

    #[tokio::test]
    async fn vrrp_group_is_created_once() {
        let services = Services::noop();
        let lb_id = LoadBalancerId::generate();
        let engine = FlowEngine::new(services.clone());
        for _ in 0..2 {
            engine
                .run(
                    &Flow::task(CreateVrrpGroupForLoadBalancer),
                    FlowStore::new().with(LOADBALANCER_ID, lb_id),
                )
                .await
                .unwrap();
        }
        let group = services.repos.vrrp_groups.require(lb_id).await.unwrap();
        assert_eq!(group.vrrp_group_name.len(), 16);
        assert_eq!(services.repos.vrrp_groups.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn health_busy_suspends_existing_row() {
        let services = Services::noop();
        let id = AmphoraId::generate();
        services
            .repos
            .amphora_health
            .create(fresh_health(id))
            .await
            .unwrap();
        FlowEngine::new(services.clone())
            .run(
                &Flow::task(MarkAmphoraHealthBusy),
                FlowStore::new().with(AMPHORA_ID, id),
            )
            .await
            .unwrap();
        assert!(services.repos.amphora_health.require(id).await.unwrap().busy);
    }
}
