//! Active-active cluster bookkeeping.
//!
//! An active-active load balancer has one [`AmphoraCluster`] row tying it to
//! a [`DistributorRecord`]. Each ACTIVE_ACTIVE amphora holds one distributor
//! slot, recorded in `Amphora::cluster_slot`.

use async_trait::async_trait;

use fleetlb_core::repository::update_with;
use fleetlb_core::{
    AmphoraCluster, AmphoraStatus, DistributorId, DistributorRecord, LoadBalancerId,
    ProvisioningStatus, Repositories,
};
use fleetlb_distributor::config::MAX_CLUSTER_SIZE;

use crate::error::{Error, Result};
use crate::keys::{
    AMPHORAE, AMPHORA_ID, CLUSTER, CLUSTER_ALG_TYPE, CLUSTER_MIN_SIZE, CLUSTER_SLOT, DISTRIBUTOR,
    DISTRIBUTOR_ID, LOADBALANCER, LOADBALANCER_ID, SLOT_AMPHORA,
};
use crate::task::{RevertOutcome, Task, TaskContext};

/// Removes `lb_id` from a distributor record, deleting the record when no
/// load balancer is left and it is not shared.
async fn detach_load_balancer(
    repos: &Repositories,
    distributor_id: DistributorId,
    lb_id: LoadBalancerId,
) -> Result<()> {
    let Some(mut record) = repos.distributors.get(distributor_id).await? else {
        return Ok(());
    };
    record.load_balancer_ids.retain(|id| *id != lb_id);
    if record.load_balancer_ids.is_empty() && !record.shared {
        tracing::info!(%distributor_id, "deleting unused distributor record");
        repos.distributors.delete(distributor_id).await?;
    } else {
        repos.distributors.update(record).await?;
    }
    Ok(())
}

/// Resolves the distributor that will serve a load balancer.
///
/// Uses the one already recorded on the load balancer, else any ACTIVE
/// shared distributor, else creates a dedicated record.
pub struct GetOrCreateDistributor;

#[async_trait]
impl Task for GetOrCreateDistributor {
    fn name(&self) -> &str {
        "get-or-create-distributor"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![DISTRIBUTOR.name(), DISTRIBUTOR_ID.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb = ctx.get(LOADBALANCER)?;
        let repos = ctx.repos();

        let existing = match lb.distributor_id {
            Some(id) => repos.distributors.get(id).await?,
            None => None,
        };
        let existing = match existing {
            Some(record) => Some(record),
            None => repos.distributors.list().await?.into_iter().find(|record| {
                record.shared && record.provisioning_status == ProvisioningStatus::Active
            }),
        };
        let mut record = match existing {
            Some(record) => record,
            None => {
                let record =
                    DistributorRecord::new(DistributorId::generate(), format!("distributor-{}", lb.id));
                repos.distributors.create(record.clone()).await?;
                tracing::info!(lb_id = %lb.id, distributor_id = %record.id, "created distributor record");
                record
            }
        };

        if !record.load_balancer_ids.contains(&lb.id) {
            record.load_balancer_ids.push(lb.id);
            repos.distributors.update(record.clone()).await?;
        }
        let distributor_id = record.id;
        update_with(&*repos.load_balancers, lb.id, |lb| {
            lb.distributor_id = Some(distributor_id);
        })
        .await?;

        ctx.put(DISTRIBUTOR_ID, distributor_id)?;
        ctx.put(DISTRIBUTOR, record)
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        let (Ok(lb), Ok(distributor_id)) = (ctx.get(LOADBALANCER), ctx.get(DISTRIBUTOR_ID)) else {
            return RevertOutcome::Skipped;
        };
        let result = detach_load_balancer(ctx.repos(), distributor_id, lb.id).await;
        RevertOutcome::from_result(self.name(), result)
    }
}

/// Derives the distributor algorithm and slot count for a load balancer.
pub struct ComputeClusterParams;

#[async_trait]
impl Task for ComputeClusterParams {
    fn name(&self) -> &str {
        "compute-cluster-params"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![CLUSTER_ALG_TYPE.name(), CLUSTER_MIN_SIZE.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb = ctx.get(LOADBALANCER)?;
        let size = lb.cluster_size.unwrap_or(ctx.config().default_cluster_size);
        if size == 0 || size > MAX_CLUSTER_SIZE {
            return Err(Error::invalid_request(format!(
                "cluster size {size} is not within 1..={MAX_CLUSTER_SIZE}"
            )));
        }
        ctx.put(CLUSTER_ALG_TYPE, ctx.config().cluster_alg_type.clone())?;
        ctx.put(CLUSTER_MIN_SIZE, size)
    }
}

/// Creates the cluster row; an existing row is reused.
pub struct CreateAmphoraClusterInDb;

#[async_trait]
impl Task for CreateAmphoraClusterInDb {
    fn name(&self) -> &str {
        "create-amphora-cluster-in-db"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![
            LOADBALANCER_ID.name(),
            DISTRIBUTOR_ID.name(),
            CLUSTER_MIN_SIZE.name(),
        ]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![CLUSTER.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb_id = ctx.get(LOADBALANCER_ID)?;
        if let Some(cluster) = ctx.repos().clusters.get(lb_id).await? {
            return ctx.put(CLUSTER, cluster);
        }
        let cluster = AmphoraCluster {
            load_balancer_id: lb_id,
            distributor_id: ctx.get(DISTRIBUTOR_ID)?,
            cluster_size: ctx.get(CLUSTER_MIN_SIZE)?,
            provisioning_status: ProvisioningStatus::PendingCreate,
        };
        ctx.repos().clusters.create(cluster.clone()).await?;
        ctx.put(CLUSTER, cluster)
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        let Ok(lb_id) = ctx.get(LOADBALANCER_ID) else {
            return RevertOutcome::Skipped;
        };
        let result = ctx.repos().clusters.delete(lb_id).await;
        RevertOutcome::from_result(self.name(), result)
    }
}

/// Loads the cluster row of a load balancer.
pub struct GetAmphoraCluster;

#[async_trait]
impl Task for GetAmphoraCluster {
    fn name(&self) -> &str {
        "get-amphora-cluster"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER_ID.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![CLUSTER.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let cluster = ctx.repos().clusters.require(ctx.get(LOADBALANCER_ID)?).await?;
        ctx.put(CLUSTER, cluster)
    }
}

/// Loads the distributor record a cluster is attached to.
pub struct GetDistributorForCluster;

#[async_trait]
impl Task for GetDistributorForCluster {
    fn name(&self) -> &str {
        "get-distributor-for-cluster"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![CLUSTER.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![DISTRIBUTOR.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let cluster = ctx.get(CLUSTER)?;
        let record = ctx.repos().distributors.require(cluster.distributor_id).await?;
        ctx.put(DISTRIBUTOR, record)
    }
}

/// Records the slot an amphora is meant to occupy. The slot is injected.
pub struct AssignClusterSlot;

#[async_trait]
impl Task for AssignClusterSlot {
    fn name(&self) -> &str {
        "assign-cluster-slot"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID.name(), CLUSTER_SLOT.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let slot = ctx.get(CLUSTER_SLOT)?;
        update_with(&*ctx.repos().amphorae, ctx.get(AMPHORA_ID)?, |amp| {
            amp.cluster_slot = Some(slot);
        })
        .await?;
        Ok(())
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        let Ok(amphora_id) = ctx.get(AMPHORA_ID) else {
            return RevertOutcome::Skipped;
        };
        let result = update_with(&*ctx.repos().amphorae, amphora_id, |amp| {
            amp.cluster_slot = None;
        })
        .await
        .map(|_| ());
        RevertOutcome::from_result(self.name(), result)
    }
}

/// Finds the ALLOCATED amphora holding the injected slot, if any.
pub struct GetAmphoraForSlot;

#[async_trait]
impl Task for GetAmphoraForSlot {
    fn name(&self) -> &str {
        "get-amphora-for-slot"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORAE.name(), CLUSTER_SLOT.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![SLOT_AMPHORA.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let slot = ctx.get(CLUSTER_SLOT)?;
        let amphora = ctx.get(AMPHORAE)?.into_iter().find(|amp| {
            amp.status == AmphoraStatus::Allocated && amp.cluster_slot == Some(slot)
        });
        if amphora.is_none() {
            tracing::warn!(slot, "no allocated amphora holds the slot, skipping");
        }
        ctx.put(SLOT_AMPHORA, amphora)
    }
}

/// Promotes the slot's amphora to the flow's `amphora_id`.
pub struct UseSlotAmphora;

#[async_trait]
impl Task for UseSlotAmphora {
    fn name(&self) -> &str {
        "use-slot-amphora"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![SLOT_AMPHORA.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let amphora = ctx
            .get(SLOT_AMPHORA)?
            .ok_or_else(|| Error::internal("slot branch taken without an amphora"))?;
        ctx.put(AMPHORA_ID, amphora.id)
    }
}

/// Deletes the cluster row and releases its distributor record.
pub struct DeleteAmphoraCluster;

#[async_trait]
impl Task for DeleteAmphoraCluster {
    fn name(&self) -> &str {
        "delete-amphora-cluster"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER_ID.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb_id = ctx.get(LOADBALANCER_ID)?;
        let Some(cluster) = ctx.repos().clusters.get(lb_id).await? else {
            return Ok(());
        };
        ctx.repos().clusters.delete(lb_id).await?;
        detach_load_balancer(ctx.repos(), cluster.distributor_id, lb_id).await
    }
}
