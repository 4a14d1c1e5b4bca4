//! Compute tasks: build, wait, delete and server groups.
//!
//! [`ComputeWait`] is a bounded poll: it gives up after
//! `amp_active_retries` attempts spaced `amp_active_wait` apart, so a stuck
//! build always terminates the flow.

use async_trait::async_trait;

use fleetlb_core::repository::update_with;

use crate::agent_config::config_drive_files;
use crate::drivers::{ComputeBuildRequest, ComputeStatus};
use crate::error::{Error, Result};
use crate::keys::{
    AMPHORA, AMPHORAE, AMPHORA_ID, COMPUTE_ID, LOADBALANCER, LOADBALANCER_ID, SERVER_GROUP_ID,
    SERVER_PEM,
};
use crate::task::{RevertOutcome, Task, TaskContext};

/// Boots the compute instance of an amphora.
///
/// The config drive carries the agent configuration and, for
/// certificate-based transport, the server certificate. A server group
/// stored under `server_group_id` is used for placement when present.
pub struct ComputeCreate {
    with_cert: bool,
}

impl ComputeCreate {
    /// Boots without a certificate on the config drive.
    #[must_use]
    pub const fn new() -> Self {
        Self { with_cert: false }
    }

    /// Boots with the certificate stored under `server_pem`.
    #[must_use]
    pub const fn with_cert() -> Self {
        Self { with_cert: true }
    }
}

impl Default for ComputeCreate {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Task for ComputeCreate {
    fn name(&self) -> &str {
        if self.with_cert {
            "cert-compute-create"
        } else {
            "compute-create"
        }
    }

    fn requires(&self) -> Vec<&'static str> {
        if self.with_cert {
            vec![AMPHORA_ID.name(), SERVER_PEM.name()]
        } else {
            vec![AMPHORA_ID.name()]
        }
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![COMPUTE_ID.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let amphora_id = ctx.get(AMPHORA_ID)?;
        let cert = if self.with_cert {
            Some(ctx.get(SERVER_PEM)?)
        } else {
            None
        };
        let config = ctx.config();
        let request = ComputeBuildRequest {
            amphora_id,
            image_tag: config.amp_image_tag.clone(),
            flavor: config.amp_flavor_id.clone(),
            networks: config.amp_boot_networks.clone(),
            key_name: config.amp_ssh_key_name.clone(),
            server_group_id: ctx.get_opt(SERVER_GROUP_ID)?,
            config_drive_files: config_drive_files(amphora_id, config, cert.as_ref()),
        };
        let compute_id = ctx.services().compute.build(request).await?;
        tracing::info!(%amphora_id, %compute_id, "compute instance requested");
        ctx.put(COMPUTE_ID, compute_id)
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        let Ok(compute_id) = ctx.get(COMPUTE_ID) else {
            return RevertOutcome::Skipped;
        };
        tracing::warn!(%compute_id, "deleting compute instance of failed amphora create");
        let result = ctx.services().compute.delete(&compute_id).await;
        RevertOutcome::from_result(self.name(), result)
    }
}

/// Polls the compute instance until it is active.
pub struct ComputeWait;

#[async_trait]
impl Task for ComputeWait {
    fn name(&self) -> &str {
        "compute-wait"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![COMPUTE_ID.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let compute_id = ctx.get(COMPUTE_ID)?;
        let retries = ctx.config().amp_active_retries.max(1);
        let wait = ctx.config().amp_active_wait;

        for attempt in 1..=retries {
            match ctx.services().compute.status(&compute_id).await? {
                ComputeStatus::Active => {
                    tracing::info!(%compute_id, attempt, "compute instance active");
                    return Ok(());
                }
                ComputeStatus::Error | ComputeStatus::Deleted => {
                    return Err(Error::ComputeBuild { compute_id });
                }
                ComputeStatus::Building => {
                    tracing::debug!(%compute_id, attempt, retries, "compute instance still building");
                    if attempt < retries {
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }
        Err(Error::ComputeWaitTimeout {
            compute_id,
            attempts: retries,
        })
    }
}

/// Deletes the compute instance of one amphora, if it has one.
pub struct ComputeDelete;

#[async_trait]
impl Task for ComputeDelete {
    fn name(&self) -> &str {
        "compute-delete"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let amphora = ctx.get(AMPHORA)?;
        let Some(compute_id) = amphora.compute_id else {
            tracing::debug!(amphora_id = %amphora.id, "amphora has no compute instance");
            return Ok(());
        };
        ctx.services().compute.delete(&compute_id).await?;
        tracing::info!(amphora_id = %amphora.id, %compute_id, "compute instance deleted");
        Ok(())
    }
}

/// Deletes the compute instances of every amphora in the collection.
pub struct DeleteAmphoraeCompute;

#[async_trait]
impl Task for DeleteAmphoraeCompute {
    fn name(&self) -> &str {
        "delete-amphorae-compute"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORAE.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        for amphora in ctx.get(AMPHORAE)? {
            if let Some(compute_id) = &amphora.compute_id {
                ctx.services().compute.delete(compute_id).await?;
            }
        }
        Ok(())
    }
}

/// Creates the anti-affinity server group of a load balancer.
pub struct CreateServerGroup;

#[async_trait]
impl Task for CreateServerGroup {
    fn name(&self) -> &str {
        "create-server-group"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER_ID.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![SERVER_GROUP_ID.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb_id = ctx.get(LOADBALANCER_ID)?;
        let policy = ctx.config().anti_affinity_policy.clone();
        let group_id = ctx
            .services()
            .compute
            .create_server_group(&format!("fleetlb-lb-{lb_id}"), &policy)
            .await?;
        let recorded = group_id.clone();
        update_with(&*ctx.repos().load_balancers, lb_id, move |lb| {
            lb.server_group_id = Some(recorded);
        })
        .await?;
        tracing::info!(%lb_id, %group_id, %policy, "server group created");
        ctx.put(SERVER_GROUP_ID, group_id)
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        let Ok(group_id) = ctx.get(SERVER_GROUP_ID) else {
            return RevertOutcome::Skipped;
        };
        let result = ctx.services().compute.delete_server_group(&group_id).await;
        RevertOutcome::from_result(self.name(), result)
    }
}

/// Deletes the server group of a load balancer, if it has one.
pub struct DeleteServerGroup;

#[async_trait]
impl Task for DeleteServerGroup {
    fn name(&self) -> &str {
        "delete-server-group"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb = ctx.get(LOADBALANCER)?;
        if let Some(group_id) = &lb.server_group_id {
            ctx.services().compute.delete_server_group(group_id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::drivers::{ComputeDriver, NoopComputeDriver};
    use crate::engine::FlowEngine;
    use crate::flow::Flow;
    use crate::services::Services;
    use crate::store::FlowStore;
    use crate::task::TaskNode;
    use fleetlb_core::AmphoraId;
    use std::sync::Arc;
    use std::time::Duration;

    fn services(compute: &Arc<NoopComputeDriver>, retries: u32) -> Services {
        let mut services = Services::noop();
        services.compute = Arc::clone(compute) as Arc<dyn ComputeDriver>;
        services.config = Arc::new(ControllerConfig {
            amp_active_retries: retries,
            amp_active_wait: Duration::from_millis(1),
            ..ControllerConfig::default()
        });
        services
    }

    #[tokio::test]
    async fn create_puts_agent_config_on_the_drive() {
        let compute = Arc::new(NoopComputeDriver::new());
        let amphora_id = AmphoraId::generate();
        let store = FlowEngine::new(services(&compute, 3))
            .run(
                &Flow::task(ComputeCreate::new()),
                FlowStore::new().with(AMPHORA_ID, amphora_id),
            )
            .await
            .unwrap();

        assert!(store.get(COMPUTE_ID).is_ok());
        let builds = compute.builds();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].amphora_id, amphora_id);
        assert!(builds[0]
            .config_drive_files
            .contains_key(crate::agent_config::AGENT_CONFIG_PATH));
    }

    #[tokio::test]
    async fn wait_returns_once_active() {
        let compute = Arc::new(NoopComputeDriver::new());
        compute.set_building_polls(2);
        let compute_id = compute
            .build(ComputeBuildRequest {
                amphora_id: AmphoraId::generate(),
                image_tag: String::new(),
                flavor: String::new(),
                networks: Vec::new(),
                key_name: None,
                server_group_id: None,
                config_drive_files: Default::default(),
            })
            .await
            .unwrap();

        FlowEngine::new(services(&compute, 5))
            .run(
                &Flow::task(ComputeWait),
                FlowStore::new().with(COMPUTE_ID, compute_id),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn wait_gives_up_after_retries() {
        let compute = Arc::new(NoopComputeDriver::new());
        compute.set_building_polls(u32::MAX);
        let compute_id = compute
            .build(ComputeBuildRequest {
                amphora_id: AmphoraId::generate(),
                image_tag: String::new(),
                flavor: String::new(),
                networks: Vec::new(),
                key_name: None,
                server_group_id: None,
                config_drive_files: Default::default(),
            })
            .await
            .unwrap();

        let err = FlowEngine::new(services(&compute, 3))
            .run(
                &Flow::task(ComputeWait),
                FlowStore::new().with(COMPUTE_ID, compute_id),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            Error::ComputeWaitTimeout { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn wait_fails_fast_on_build_error() {
        let compute = Arc::new(NoopComputeDriver::new());
        compute.set_boot_status(ComputeStatus::Error);
        let store = FlowEngine::new(services(&compute, 30))
            .run(
                &Flow::task(ComputeCreate::new()),
                FlowStore::new().with(AMPHORA_ID, AmphoraId::generate()),
            )
            .await
            .unwrap();
        let err = FlowEngine::new(services(&compute, 30))
            .run(&Flow::task(ComputeWait), store)
            .await
            .unwrap_err();
        assert!(matches!(err.root_cause(), Error::ComputeBuild { .. }));
    }

    #[tokio::test]
    async fn create_revert_deletes_the_instance() {
        let compute = Arc::new(NoopComputeDriver::new());
        let services = services(&compute, 3);
        let node = TaskNode::new(ComputeCreate::new());
        let store = FlowStore::new().with(COMPUTE_ID, "compute-9".to_string());
        let ctx = TaskContext::new(&node, &store, &services);
        assert_eq!(node.task().revert(&ctx).await, RevertOutcome::Reverted);
        assert_eq!(compute.deleted(), vec!["compute-9".to_string()]);
    }
}
