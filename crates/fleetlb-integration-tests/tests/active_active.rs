//! Active-active clusters driven through the in-process distributor engine.

use std::net::{IpAddr, Ipv4Addr};

use fleetlb_core::{
    AmphoraId, AmphoraRole, AmphoraStatus, DistributorStatus, LoadBalancerId, ProvisioningStatus,
    Repository,
};
use fleetlb_distributor::memory::SwitchOp;
use fleetlb_distributor::{ErrorKind, PlugVipRequest, RegisterRequest, ACTIVE_ACTIVE_ALGORITHM};
use fleetlb_flow::drivers::amphora_mac;
use fleetlb_flow::Error;
use fleetlb_test_utils::{
    assert_distributor_consistent, assert_lb_status, init_test_logging, LoadBalancerFactory,
    TestContext, FRONTEND_MAC,
};

async fn status_of(ctx: &TestContext, lb_id: LoadBalancerId) -> DistributorStatus {
    ctx.distributor
        .get_status(Some(lb_id))
        .await
        .unwrap()
        .pop()
        .unwrap()
        .status
}

#[tokio::test]
async fn cluster_is_created_registered_and_deleted() {
    init_test_logging();
    let ctx = TestContext::new().await;
    let lb = ctx.seed_lb(LoadBalancerFactory::active_active(3)).await;
    ctx.seed_listeners(lb.id, 1).await;
    let manager = ctx.manager();

    manager.create_active_active_load_balancer(lb.id).await.unwrap();

    assert_lb_status(&ctx, lb.id, ProvisioningStatus::Active).await;
    assert_eq!(status_of(&ctx, lb.id).await, DistributorStatus::Online);
    assert_distributor_consistent(&ctx.distributor, lb.id).await;

    let amphorae = ctx.repos.amphorae_for_lb(lb.id).await.unwrap();
    let members: Vec<_> = amphorae
        .iter()
        .filter(|a| a.role == Some(AmphoraRole::ActiveActive))
        .collect();
    assert_eq!(members.len(), 3);
    assert_eq!(amphorae.len(), 4);

    let table = ctx.distributor.dump_state(lb.id).await.unwrap();
    for amp in &members {
        let slot = amp.cluster_slot.expect("member holds a slot");
        let binding = table.slots[&slot].as_ref().expect("slot is bound");
        assert_eq!(binding.amphora_id, amp.id);
        assert_eq!(binding.mac, amphora_mac(amp.id));
    }
    assert_eq!(ctx.amphora.calls_to("disable_arp").len(), 3);

    manager.delete_active_active_load_balancer(lb.id).await.unwrap();

    assert_lb_status(&ctx, lb.id, ProvisioningStatus::Deleted).await;
    assert_eq!(ctx.distributor.distributor_count().await, 0);
    assert!(ctx.switch.bridge_names().is_empty());
    assert!(ctx.repos.clusters.get(lb.id).await.unwrap().is_none());
    for amp in amphorae {
        assert_eq!(ctx.amphora(amp.id).await.status, AmphoraStatus::Deleted);
    }
}

#[tokio::test]
async fn failover_of_member_reclaims_its_slot() {
    let ctx = TestContext::new().await;
    let lb = ctx.seed_lb(LoadBalancerFactory::active_active(2)).await;
    let manager = ctx.manager();
    manager.create_active_active_load_balancer(lb.id).await.unwrap();

    let failed = ctx
        .repos
        .amphorae_for_lb(lb.id)
        .await
        .unwrap()
        .into_iter()
        .find(|a| a.cluster_slot == Some(0))
        .expect("slot 0 is held");

    let replacement = manager
        .failover_amphora(failed.id)
        .await
        .unwrap()
        .expect("member is replaced");

    let new = ctx.amphora(replacement).await;
    assert_eq!(new.role, Some(AmphoraRole::ActiveActive));
    assert_eq!(new.cluster_slot, Some(0));
    let old = ctx.amphora(failed.id).await;
    assert_eq!(old.status, AmphoraStatus::Deleted);
    assert_eq!(old.cluster_slot, None);

    let table = ctx.distributor.dump_state(lb.id).await.unwrap();
    let binding = table.slots[&0].as_ref().expect("slot 0 rebound");
    assert_eq!(binding.amphora_id, replacement);
    assert_eq!(status_of(&ctx, lb.id).await, DistributorStatus::Online);
    assert_distributor_consistent(&ctx.distributor, lb.id).await;
}

#[tokio::test]
async fn oversized_cluster_is_rejected() {
    let ctx = TestContext::new().await;
    let lb = ctx
        .seed_lb(LoadBalancerFactory::active_active(
            fleetlb_distributor::config::MAX_CLUSTER_SIZE + 1,
        ))
        .await;

    let err = ctx
        .manager()
        .create_active_active_load_balancer(lb.id)
        .await
        .unwrap_err();

    assert!(matches!(err.root_cause(), Error::InvalidRequest { .. }));
    assert_lb_status(&ctx, lb.id, ProvisioningStatus::Error).await;
    assert_eq!(ctx.distributor.distributor_count().await, 0);
    assert!(ctx.repos.distributors.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn registration_failure_leaves_lb_in_error() {
    let ctx = TestContext::new().await;
    let lb = ctx.seed_lb(LoadBalancerFactory::active_active(2)).await;
    ctx.switch.fail(SwitchOp::ModifyGroup);

    let err = ctx
        .manager()
        .create_active_active_load_balancer(lb.id)
        .await
        .unwrap_err();

    match err.root_cause() {
        Error::Distributor(e) => assert_eq!(e.kind(), ErrorKind::Instance),
        other => panic!("unexpected error: {other}"),
    }
    assert_lb_status(&ctx, lb.id, ProvisioningStatus::Error).await;
    assert_distributor_consistent(&ctx.distributor, lb.id).await;
    assert_eq!(status_of(&ctx, lb.id).await, DistributorStatus::Error);
}

#[tokio::test]
async fn failed_distributor_rejects_registration_without_mutation() {
    let ctx = TestContext::new().await;
    let lb_id = LoadBalancerId::generate();
    ctx.distributor
        .post_plug_vip(PlugVipRequest {
            lb_id,
            vip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)),
            mac: FRONTEND_MAC.to_string(),
            subnet_cidr: "203.0.113.0/24".to_string(),
            gateway: None,
            alg_type: ACTIVE_ACTIVE_ALGORITHM.to_string(),
            min_size: 3,
        })
        .await
        .unwrap();
    let register = |slot| RegisterRequest {
        lb_id,
        vip: None,
        amphora_id: AmphoraId::generate(),
        amphora_mac: "fa:16:3e:00:00:01".to_string(),
        slot,
    };
    ctx.distributor.register_amphora(register(Some(1))).await.unwrap();

    ctx.switch.fail(SwitchOp::ModifyGroup);
    let err = ctx.distributor.register_amphora(register(None)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Instance);
    ctx.switch.heal(SwitchOp::ModifyGroup);

    let before = ctx.distributor.dump_state(lb_id).await.unwrap();
    let err = ctx.distributor.register_amphora(register(None)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Instance);
    let after = ctx.distributor.dump_state(lb_id).await.unwrap();

    assert_eq!(before, after);
    assert_eq!(after.bindings().count(), 1);
    assert_distributor_consistent(&ctx.distributor, lb_id).await;
}
