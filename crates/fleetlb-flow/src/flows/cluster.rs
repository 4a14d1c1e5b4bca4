//! Active-active cluster flows.
//!
//! A cluster is built in three runs: [`create_cluster_flow`] sets up the
//! distributor, [`create_cluster_amphorae_flow`] builds the amphorae, and
//! [`finalize_cluster_flow`] wires their networks and registers each one in
//! its distributor slot.

use fleetlb_core::{AmphoraCluster, AmphoraRole, DistributorRecord};

use crate::config::ControllerConfig;
use crate::flow::{Decision, Flow};
use crate::keys::{
    AMPHORAE, CLUSTER_SLOT, DISTRIBUTOR_ID, LOADBALANCER, LOADBALANCER_ID, SERVER_GROUP_ID,
    SLOT_AMPHORA,
};
use crate::task::TaskNode;
use crate::tasks::amphora_driver::{
    AmphoraDisableArp, AmphoraGetMac, AmphoraePostNetworkPlug, AmphoraePostVipPlug, ListenersStart,
    ListenersStop, ListenersUpdate,
};
use crate::tasks::cluster::{
    AssignClusterSlot, ComputeClusterParams, CreateAmphoraClusterInDb, DeleteAmphoraCluster,
    GetAmphoraCluster, GetAmphoraForSlot, GetDistributorForCluster, GetOrCreateDistributor,
    UseSlotAmphora,
};
use crate::tasks::compute::{CreateServerGroup, DeleteAmphoraeCompute, DeleteServerGroup};
use crate::tasks::database::{
    GetAmphoraeFromLoadBalancer, GetListenersFromLoadBalancer, MarkAmphoraeDeleted,
    MarkLoadBalancerStatus, MarkStatus, ReloadAmphora, ReloadLoadBalancer, UpdateAmphoraeVipData,
};
use crate::tasks::distributor_driver::{
    DistributorPostVipPlug, DistributorPreVipUnplug, RegisterAmphoraToDistributor,
    UnregisterAmphoraeFromDistributor,
};
use crate::tasks::network::{
    AmphoraePlugVip, AmphoraeUnplugVip, CalculateDelta, HandleNetworkDeltas,
};

use super::amphora::get_amphora_for_lb_subflow;

/// Sets up the distributor of an active-active load balancer.
#[must_use]
pub fn create_cluster_flow() -> Flow {
    Flow::sequence(
        "create-cluster",
        vec![
            Flow::task(ReloadLoadBalancer),
            Flow::task(GetOrCreateDistributor),
            Flow::task(ComputeClusterParams),
            Flow::task(DistributorPostVipPlug),
            Flow::task(MarkStatus::<DistributorRecord>::active(DISTRIBUTOR_ID)),
            Flow::task(CreateAmphoraClusterInDb),
            Flow::task(MarkLoadBalancerStatus::active()),
        ],
    )
}

/// Builds `cluster_size` ACTIVE_ACTIVE amphorae and one ACTIVE_STANDBY
/// amphora. The copies run in parallel; each ACTIVE_ACTIVE copy records the
/// slot it is meant to fill.
#[must_use]
pub fn create_cluster_amphorae_flow(cluster_size: u32, config: &ControllerConfig) -> Flow {
    let shared = [LOADBALANCER_ID.name(), SERVER_GROUP_ID.name()];

    let mut members: Vec<Flow> = (0..cluster_size)
        .map(|slot| {
            Flow::sequence(
                "cluster-amphora",
                vec![
                    get_amphora_for_lb_subflow(AmphoraRole::ActiveActive, config),
                    TaskNode::new(AssignClusterSlot)
                        .inject(CLUSTER_SLOT, slot)
                        .into(),
                ],
            )
            .isolate(&format!("slot{slot}"), &shared)
        })
        .collect();
    members.push(
        get_amphora_for_lb_subflow(AmphoraRole::ActiveStandby, config).isolate("standby", &shared),
    );

    let mut steps = Vec::with_capacity(2);
    if config.enable_anti_affinity {
        steps.push(Flow::task(CreateServerGroup));
    }
    steps.push(Flow::parallel("create-cluster-amphorae", members));
    Flow::sequence("build-cluster-amphorae", steps)
}

/// Registers the amphora holding `slot`, if an ALLOCATED one does.
fn register_slot(slot: u32) -> Flow {
    let lookup = TaskNode::new(GetAmphoraForSlot).inject(CLUSTER_SLOT, slot);
    Decision::on(
        "slot-occupied",
        lookup.into(),
        SLOT_AMPHORA,
        Option::is_some,
    )
    .if_true(Flow::sequence(
        "register-slot",
        vec![
            Flow::task(UseSlotAmphora),
            Flow::task(ReloadAmphora),
            Flow::task(AmphoraGetMac),
            Flow::task(AmphoraDisableArp),
            TaskNode::new(RegisterAmphoraToDistributor)
                .inject(CLUSTER_SLOT, slot)
                .into(),
        ],
    ))
    .into()
}

/// Wires a cluster's networks and registers every slot's amphora with the
/// distributor.
#[must_use]
pub fn finalize_cluster_flow(cluster_size: u32) -> Flow {
    let shared = [LOADBALANCER_ID.name(), LOADBALANCER.name(), AMPHORAE.name()];
    let slots = (0..cluster_size)
        .map(|slot| register_slot(slot).isolate(&format!("slot{slot}"), &shared))
        .collect();

    Flow::sequence(
        "finalize-cluster",
        vec![
            Flow::task(ReloadLoadBalancer),
            Flow::task(GetAmphoraCluster),
            Flow::task(GetDistributorForCluster),
            Flow::task(GetAmphoraeFromLoadBalancer),
            Flow::task(AmphoraePlugVip),
            Flow::task(UpdateAmphoraeVipData),
            Flow::task(AmphoraePostVipPlug),
            Flow::task(CalculateDelta),
            Flow::task(HandleNetworkDeltas),
            Flow::task(AmphoraePostNetworkPlug),
            Flow::task(GetListenersFromLoadBalancer),
            Flow::task(ListenersUpdate),
            Flow::task(ListenersStart),
            Flow::parallel("register-cluster-slots", slots),
            Flow::task(MarkStatus::<AmphoraCluster>::active(LOADBALANCER_ID)),
        ],
    )
}

/// Tears down an active-active load balancer.
#[must_use]
pub fn delete_cluster_flow() -> Flow {
    Flow::sequence(
        "delete-cluster",
        vec![
            Flow::task(MarkLoadBalancerStatus::pending_delete()),
            Flow::task(ReloadLoadBalancer),
            Flow::task(GetAmphoraeFromLoadBalancer),
            Flow::task(GetListenersFromLoadBalancer),
            Flow::task(ListenersStop),
            Flow::task(UnregisterAmphoraeFromDistributor),
            Flow::task(DistributorPreVipUnplug),
            Flow::task(AmphoraeUnplugVip),
            Flow::task(DeleteAmphoraeCompute),
            Flow::task(MarkAmphoraeDeleted),
            Flow::task(DeleteServerGroup),
            Flow::task(DeleteAmphoraCluster),
            Flow::task(MarkLoadBalancerStatus::deleted()),
        ],
    )
}
