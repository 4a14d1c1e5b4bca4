//! Amphora lifecycle flows: create, allocate, fail over, delete, rotate.

use fleetlb_core::{Amphora, AmphoraId, AmphoraRole, AmphoraStatus};

use crate::config::ControllerConfig;
use crate::flow::{Decision, Flow};
use crate::keys::{
    ALLOCATED_AMPHORA_ID, AMPHORA, AMPHORA_ID, FAILED_AMPHORA, FAILED_AMPHORA_ID, ROLE,
};
use crate::task::{Task, TaskNode};
use crate::tasks::amphora_driver::{
    AmphoraCertUpload, AmphoraDisableArp, AmphoraFinalize, AmphoraGetMac, AmphoraGetVrrpInterface,
    AmphoraUpdateVrrpConf, AmphoraVrrpStart, AmphoraePostNetworkPlug, AmphoraePostVipPlug,
    ListenersStart, ListenersUpdate,
};
use crate::tasks::cert::{CertBusyToFalse, GenerateServerPem, UpdateAmphoraCertExpiration};
use crate::tasks::compute::{ComputeCreate, ComputeDelete, ComputeWait};
use crate::tasks::database::{
    CollectAmphora, CopyAmphoraNetworkIdentity, CreateAmphoraInDb, CreateVrrpGroupForLoadBalancer,
    GetListenersFromLoadBalancer, MapAmphoraToLoadBalancer, MapLoadBalancerToAmphora,
    MarkAmphoraBooting, MarkAmphoraHealthBusy, MarkAmphoraRole, MarkAmphoraStatus,
    MarkLoadBalancerStatus, ReloadAmphora, ReloadLoadBalancer, UpdateAmphoraComputeDetails,
    UpdateAmphoraeVipData, UseAllocatedAmphora,
};
use crate::tasks::distributor_driver::{
    RegisterAmphoraToDistributor, UnregisterAmphoraFromDistributor,
};
use crate::tasks::network::{
    AmphoraePlugVip, CalculateDelta, HandleNetworkDeltas, WaitForPortDetach,
};

/// Builds a new amphora from nothing to READY.
///
/// With certificate-based transport a server certificate is generated
/// first and placed on the config drive.
#[must_use]
pub fn create_amphora_flow(config: &ControllerConfig) -> Flow {
    let mut steps = vec![Flow::task(CreateAmphoraInDb)];
    if config.cert_based() {
        steps.extend([
            Flow::task(GenerateServerPem),
            Flow::task(UpdateAmphoraCertExpiration),
            Flow::task(ComputeCreate::with_cert()),
        ]);
    } else {
        steps.push(Flow::task(ComputeCreate::new()));
    }
    steps.extend([
        Flow::task(MarkAmphoraBooting),
        Flow::task(ComputeWait),
        Flow::task(UpdateAmphoraComputeDetails),
        Flow::task(AmphoraFinalize),
        Flow::task(MarkAmphoraStatus::ready()),
    ]);
    Flow::sequence("create-amphora", steps)
}

/// Gives a load balancer an amphora with `role`.
///
/// A spare from the pool is used when one can be claimed; otherwise a new
/// amphora is built and mapped. Either way `amphora_id` and `amphora`
/// are provided.
#[must_use]
pub fn get_amphora_for_lb_subflow(role: AmphoraRole, config: &ControllerConfig) -> Flow {
    let mark_role = || Flow::Task(TaskNode::new(MarkAmphoraRole).inject(ROLE, role));

    Decision::on(
        format!("get-{}-amphora", role.as_str().to_ascii_lowercase().replace('_', "-")),
        Flow::task(MapLoadBalancerToAmphora),
        ALLOCATED_AMPHORA_ID,
        |allocated: &Option<AmphoraId>| allocated.is_some(),
    )
    .if_true(Flow::sequence(
        "use-spare-amphora",
        vec![Flow::task(UseAllocatedAmphora), mark_role()],
    ))
    .if_false(Flow::sequence(
        "create-new-amphora",
        vec![
            create_amphora_flow(config),
            Flow::task(MapAmphoraToLoadBalancer),
            mark_role(),
        ],
    ))
    .outputs(&[AMPHORA_ID.name(), AMPHORA.name()])
    .into()
}

/// Runs `task` against the failed amphora instead of the current one.
fn on_failed(task: impl Task + 'static) -> Flow {
    let node = TaskNode::new(task);
    let name = format!("{}-failed", node.name());
    node.named(name)
        .rebind(AMPHORA_ID.name(), FAILED_AMPHORA_ID.name())
        .rebind(AMPHORA.name(), FAILED_AMPHORA.name())
        .into()
}

/// Replaces a failed amphora.
///
/// The failed amphora is always torn down. A spare (never allocated)
/// amphora is not replaced; an allocated one is replaced by an amphora
/// with the same role that takes over its network identity, re-plugs the
/// VIP and member networks, and restarts the listeners.
#[must_use]
pub fn failover_amphora_flow(failed: &Amphora, config: &ControllerConfig) -> Flow {
    let allocated =
        failed.status == AmphoraStatus::Allocated && failed.load_balancer_id.is_some();
    let role = failed.role.unwrap_or(AmphoraRole::Standalone);

    let mut steps = vec![on_failed(ReloadAmphora)];
    if allocated {
        steps.push(Flow::task(ReloadLoadBalancer));
    }
    steps.extend([
        on_failed(MarkAmphoraStatus::pending_delete()),
        on_failed(MarkAmphoraHealthBusy),
    ]);
    if allocated && role == AmphoraRole::ActiveActive {
        steps.push(on_failed(UnregisterAmphoraFromDistributor));
    }
    steps.extend([
        on_failed(ComputeDelete),
        on_failed(WaitForPortDetach),
        on_failed(MarkAmphoraStatus::deleted()),
    ]);

    if !allocated {
        return Flow::sequence("failover-spare-amphora", steps);
    }

    steps.extend([
        get_amphora_for_lb_subflow(role, config),
        Flow::task(CopyAmphoraNetworkIdentity),
        Flow::task(GetListenersFromLoadBalancer),
        Flow::task(CollectAmphora),
        Flow::task(AmphoraePlugVip),
        Flow::task(UpdateAmphoraeVipData),
        Flow::task(AmphoraePostVipPlug),
        Flow::task(CalculateDelta),
        Flow::task(HandleNetworkDeltas),
        Flow::task(AmphoraePostNetworkPlug),
        Flow::task(ReloadAmphora),
    ]);
    match role {
        AmphoraRole::ActiveActive => steps.extend([
            Flow::task(AmphoraGetMac),
            Flow::task(AmphoraDisableArp),
            Flow::task(RegisterAmphoraToDistributor),
        ]),
        AmphoraRole::Master | AmphoraRole::Backup => steps.extend([
            Flow::task(CreateVrrpGroupForLoadBalancer),
            Flow::task(AmphoraGetVrrpInterface),
            Flow::task(AmphoraUpdateVrrpConf),
            Flow::task(AmphoraVrrpStart),
        ]),
        AmphoraRole::Standalone | AmphoraRole::ActiveStandby => {}
    }
    steps.extend([
        Flow::task(ListenersUpdate),
        Flow::task(ListenersStart),
        Flow::task(MarkLoadBalancerStatus::active()),
    ]);
    Flow::sequence("failover-amphora", steps)
}

/// Removes a spare amphora.
#[must_use]
pub fn delete_amphora_flow() -> Flow {
    Flow::sequence(
        "delete-amphora",
        vec![
            Flow::task(ReloadAmphora),
            Flow::task(MarkAmphoraStatus::pending_delete()),
            Flow::task(MarkAmphoraHealthBusy),
            Flow::task(ComputeDelete),
            Flow::task(MarkAmphoraStatus::deleted()),
        ],
    )
}

/// Issues and installs a new server certificate on one amphora.
#[must_use]
pub fn cert_rotate_amphora_flow() -> Flow {
    Flow::sequence(
        "cert-rotate-amphora",
        vec![
            Flow::task(ReloadAmphora),
            Flow::task(GenerateServerPem),
            Flow::task(AmphoraCertUpload),
            Flow::task(UpdateAmphoraCertExpiration),
            Flow::task(CertBusyToFalse),
        ],
    )
}

/// Builds `count` spare amphorae side by side.
#[must_use]
pub fn spare_fill_flow(count: usize, config: &ControllerConfig) -> Flow {
    let spares = (0..count)
        .map(|i| create_amphora_flow(config).isolate(&format!("spare{i}"), &[]))
        .collect();
    Flow::parallel("fill-spare-pool", spares)
}
