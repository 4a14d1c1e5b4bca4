//! Custom assertion helpers for integration tests.

use fleetlb_core::{AmphoraId, AmphoraStatus, LoadBalancerId, ProvisioningStatus};
use fleetlb_distributor::DistributorEngine;

use crate::fixtures::TestContext;

/// Asserts the provisioning status of a load balancer.
///
/// # Panics
///
/// Panics if the load balancer is missing or has another status.
pub async fn assert_lb_status(ctx: &TestContext, lb_id: LoadBalancerId, expected: ProvisioningStatus) {
    let lb = ctx.lb(lb_id).await;
    assert_eq!(
        lb.provisioning_status, expected,
        "Expected load balancer {lb_id} to be {expected}, but it was {}",
        lb.provisioning_status
    );
}

/// Asserts the lifecycle status of an amphora.
///
/// # Panics
///
/// Panics if the amphora is missing or has another status.
pub async fn assert_amphora_status(ctx: &TestContext, id: AmphoraId, expected: AmphoraStatus) {
    let amp = ctx.amphora(id).await;
    assert_eq!(
        amp.status, expected,
        "Expected amphora {id} to be {expected}, but it was {}",
        amp.status
    );
}

/// Asserts that every slot of a distributor is either bound or free, and
/// that the engine's report agrees with its slot table.
///
/// # Panics
///
/// Panics if the distributor is unknown or its bookkeeping disagrees.
pub async fn assert_distributor_consistent(engine: &DistributorEngine, lb_id: LoadBalancerId) {
    let table = engine.dump_state(lb_id).await.expect("distributor exists");
    let report = engine
        .get_status(Some(lb_id))
        .await
        .expect("distributor status")
        .pop()
        .expect("one report");

    let bound = table.bindings().count();
    let free = table.slots.values().filter(|b| b.is_none()).count();
    assert_eq!(
        bound + free,
        report.size as usize,
        "Expected {} slots, found {bound} bound and {free} free",
        report.size
    );
    assert_eq!(bound, report.registered, "Report disagrees with slot table");
}
