//! Amphora create, allocation and failover scenarios.

use std::collections::BTreeSet;

use fleetlb_core::{Amphora, AmphoraRole, AmphoraStatus, ListenerId, ProvisioningStatus, Repository};
use fleetlb_flow::agent_config::SERVER_CERT_PATH;
use fleetlb_flow::flows::{create_amphora_flow, get_amphora_for_lb_subflow};
use fleetlb_flow::keys::{AMPHORA_ID, LOADBALANCER_ID, SERVER_PEM};
use fleetlb_flow::{Error, FlowStore, Transport};
use fleetlb_test_utils::{
    assert_amphora_status, assert_lb_status, init_test_logging, test_config, AmphoraFactory,
    LoadBalancerFactory, TestContext,
};

#[tokio::test]
async fn cert_based_create_builds_a_ready_amphora() {
    init_test_logging();
    let ctx = TestContext::new().await;
    assert_eq!(ctx.config.transport, Transport::CertBased);

    let store = ctx
        .engine()
        .run(&create_amphora_flow(&ctx.config), FlowStore::new())
        .await
        .unwrap();

    let id = store.get(AMPHORA_ID).unwrap();
    let cert = store.get(SERVER_PEM).unwrap();
    let amp = ctx.amphora(id).await;
    assert_eq!(amp.status, AmphoraStatus::Ready);
    assert_eq!(amp.cert_expiration, Some(cert.expiration));
    assert_eq!(ctx.certs.issued(), 1);

    let builds = ctx.compute.builds();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].amphora_id, id);
    assert_eq!(builds[0].config_drive_files.get(SERVER_CERT_PATH), Some(&cert.pem));
    assert!(amp.compute_id.is_some());
    assert!(amp.lb_network_ip.is_some());
    assert_eq!(ctx.amphora.calls_to("finalize"), vec![id]);
}

#[tokio::test]
async fn cert_based_create_moves_through_states_in_order() {
    let ctx = TestContext::new().await;
    ctx.compute.set_building_polls(2);

    let store = ctx
        .engine()
        .run(&create_amphora_flow(&ctx.config), FlowStore::new())
        .await
        .unwrap();
    let id = store.get(AMPHORA_ID).unwrap();
    let expiration = store.get(SERVER_PEM).unwrap().expiration;
    assert_eq!(ctx.compute.status_polls(), 3);

    let writes: Vec<Amphora> = ctx
        .amphora_rows
        .writes()
        .unwrap()
        .into_iter()
        .filter(|a| a.id == id)
        .collect();
    let first = |stage: &str, pred: &dyn Fn(&Amphora) -> bool| {
        writes
            .iter()
            .position(pred)
            .unwrap_or_else(|| panic!("no write reached {stage}"))
    };

    let created = first("pending create", &|a: &Amphora| {
        a.status == AmphoraStatus::PendingCreate
            && a.cert_expiration.is_none()
            && a.compute_id.is_none()
    });
    let certified = first("certificate", &|a: &Amphora| {
        a.cert_expiration == Some(expiration) && a.compute_id.is_none()
    });
    let built = first("compute id", &|a: &Amphora| a.compute_id.is_some());
    let booting = first("booting", &|a: &Amphora| a.status == AmphoraStatus::Booting);
    let refreshed = first("active", &|a: &Amphora| a.lb_network_ip.is_some());
    let ready = first("ready", &|a: &Amphora| a.status == AmphoraStatus::Ready);

    assert_eq!(created, 0);
    assert!(created < certified, "{writes:#?}");
    assert!(certified < built, "{writes:#?}");
    assert!(built <= booting, "{writes:#?}");
    assert!(writes[booting].compute_id.is_some());
    assert!(booting < refreshed, "{writes:#?}");
    assert!(refreshed < ready, "{writes:#?}");
    assert_eq!(ready, writes.len() - 1);
}

#[tokio::test]
async fn plain_create_skips_the_certificate() {
    let ctx = TestContext::with_config(fleetlb_flow::ControllerConfig {
        transport: Transport::Plain,
        ..test_config()
    })
    .await;

    let store = ctx
        .engine()
        .run(&create_amphora_flow(&ctx.config), FlowStore::new())
        .await
        .unwrap();

    assert!(!store.contains(SERVER_PEM.name()));
    assert_eq!(ctx.certs.issued(), 0);
    assert!(!ctx.compute.builds()[0]
        .config_drive_files
        .contains_key(SERVER_CERT_PATH));
}

#[tokio::test]
async fn create_that_never_boots_ends_in_error() {
    let ctx = TestContext::new().await;
    ctx.compute.set_building_polls(u32::MAX);

    let err = ctx
        .engine()
        .run(&create_amphora_flow(&ctx.config), FlowStore::new())
        .await
        .unwrap_err();
    assert_eq!(err.failed_task(), Some("compute-wait"));
    assert!(matches!(err.root_cause(), Error::ComputeWaitTimeout { attempts: 3, .. }));

    let amphorae = ctx.repos.amphorae.list().await.unwrap();
    assert_eq!(amphorae.len(), 1);
    assert_eq!(amphorae[0].status, AmphoraStatus::Error);
    assert_eq!(ctx.compute.builds().len(), 1);
    assert_eq!(ctx.compute.deleted().len(), 1);
}

#[tokio::test]
async fn spare_is_allocated_without_building() {
    let ctx = TestContext::new().await;
    let lb = ctx.seed_lb(LoadBalancerFactory::single()).await;
    let spare = ctx.seed_amphora(AmphoraFactory::spare()).await;

    let store = ctx
        .engine()
        .run(
            &get_amphora_for_lb_subflow(AmphoraRole::Standalone, &ctx.config),
            FlowStore::new().with(LOADBALANCER_ID, lb.id),
        )
        .await
        .unwrap();

    assert_eq!(store.get(AMPHORA_ID).unwrap(), spare.id);
    assert!(ctx.compute.builds().is_empty());
    let amp = ctx.amphora(spare.id).await;
    assert_eq!(amp.status, AmphoraStatus::Allocated);
    assert_eq!(amp.load_balancer_id, Some(lb.id));
    assert_eq!(amp.role, Some(AmphoraRole::Standalone));
}

#[tokio::test]
async fn empty_pool_builds_a_new_amphora() {
    let ctx = TestContext::new().await;
    let lb = ctx.seed_lb(LoadBalancerFactory::active_standby()).await;

    let store = ctx
        .engine()
        .run(
            &get_amphora_for_lb_subflow(AmphoraRole::Master, &ctx.config),
            FlowStore::new().with(LOADBALANCER_ID, lb.id),
        )
        .await
        .unwrap();

    let id = store.get(AMPHORA_ID).unwrap();
    assert_eq!(ctx.compute.builds().len(), 1);
    let amp = ctx.amphora(id).await;
    assert_eq!(amp.status, AmphoraStatus::Allocated);
    assert_eq!(amp.role, Some(AmphoraRole::Master));
    assert_eq!(amp.vrrp_priority, Some(100));
}

#[tokio::test]
async fn failover_replaces_allocated_amphora_and_restarts_listeners() {
    let ctx = TestContext::new().await;
    let lb = ctx.seed_lb(LoadBalancerFactory::single()).await;
    let listeners = ctx.seed_listeners(lb.id, 2).await;
    let failed = ctx
        .seed_amphora(AmphoraFactory::allocated(lb.id, AmphoraRole::Standalone))
        .await;

    let replacement = ctx
        .manager()
        .failover_amphora(failed.id)
        .await
        .unwrap()
        .expect("allocated amphora is replaced");

    assert_ne!(replacement, failed.id);
    assert_amphora_status(&ctx, failed.id, AmphoraStatus::Deleted).await;
    assert_eq!(
        ctx.compute.deleted(),
        vec![failed.compute_id.clone().unwrap()]
    );

    let new = ctx.amphora(replacement).await;
    assert_eq!(new.status, AmphoraStatus::Allocated);
    assert_eq!(new.role, Some(AmphoraRole::Standalone));
    assert_eq!(new.load_balancer_id, Some(lb.id));

    let expected: BTreeSet<ListenerId> = listeners.iter().map(|l| l.id).collect();
    assert_eq!(ctx.amphora.running_listeners(replacement), expected);
    assert_lb_status(&ctx, lb.id, ProvisioningStatus::Active).await;
}

#[tokio::test]
async fn failover_of_master_rebuilds_vrrp() {
    let ctx = TestContext::new().await;
    let lb = ctx.seed_lb(LoadBalancerFactory::active_standby()).await;
    ctx.seed_listeners(lb.id, 1).await;
    let failed = ctx
        .seed_amphora(AmphoraFactory::allocated(lb.id, AmphoraRole::Master))
        .await;
    ctx.seed_amphora(AmphoraFactory::allocated(lb.id, AmphoraRole::Backup))
        .await;

    let replacement = ctx
        .manager()
        .failover_amphora(failed.id)
        .await
        .unwrap()
        .unwrap();

    let new = ctx.amphora(replacement).await;
    assert_eq!(new.role, Some(AmphoraRole::Master));
    assert!(new.vrrp_interface.is_some());
    assert_eq!(ctx.amphora.calls_to("start_vrrp"), vec![replacement]);
}

#[tokio::test]
async fn failover_of_spare_only_deletes_it() {
    let ctx = TestContext::new().await;
    let spare = ctx.seed_amphora(AmphoraFactory::spare()).await;

    let replacement = ctx.manager().failover_amphora(spare.id).await.unwrap();

    assert_eq!(replacement, None);
    assert_amphora_status(&ctx, spare.id, AmphoraStatus::Deleted).await;
    assert!(ctx.compute.builds().is_empty());
    assert_eq!(ctx.repos.amphorae.list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn failover_fails_when_ports_never_detach() {
    let ctx = TestContext::new().await;
    let spare = ctx.seed_amphora(AmphoraFactory::spare()).await;
    let compute_id = spare.compute_id.clone().unwrap();
    ctx.network
        .hold_ports(&compute_id, vec!["port-stuck".into()], u32::MAX);

    let err = ctx.manager().failover_amphora(spare.id).await.unwrap_err();

    assert!(matches!(err.root_cause(), Error::PortDetachTimeout { .. }));
    assert_amphora_status(&ctx, spare.id, AmphoraStatus::Error).await;
}
