//! Amphora agent tasks.
//!
//! VIP and network plug notifications succeed when the agent answers that
//! the network is already plugged, so a retried flow does not fail on work
//! a previous attempt already finished.

use async_trait::async_trait;

use fleetlb_core::repository::update_with;
use fleetlb_core::{OperatingStatus, ProvisioningStatus};

use crate::error::Result;
use crate::keys::{
    ADDED_PORTS, AMPHORA, AMPHORAE, AMPHORAE_NETWORK_CONFIG, AMPHORA_MAC, LISTENERS, LOADBALANCER,
    SERVER_PEM,
};
use crate::task::{RevertOutcome, Task, TaskContext};

use super::tolerate_already_plugged;

/// Completes agent bootstrap on a freshly booted amphora.
pub struct AmphoraFinalize;

#[async_trait]
impl Task for AmphoraFinalize {
    fn name(&self) -> &str {
        "amphora-finalize"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let amphora = ctx.get(AMPHORA)?;
        ctx.services().amphora.finalize(&amphora).await?;
        Ok(())
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        super::amphora_to_error(ctx).await
    }
}

/// Tells every amphora that its VIP port is plugged.
pub struct AmphoraePostVipPlug;

#[async_trait]
impl Task for AmphoraePostVipPlug {
    fn name(&self) -> &str {
        "amphorae-post-vip-plug"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![
            LOADBALANCER.name(),
            AMPHORAE.name(),
            AMPHORAE_NETWORK_CONFIG.name(),
        ]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb = ctx.get(LOADBALANCER)?;
        let configs = ctx.get(AMPHORAE_NETWORK_CONFIG)?;
        for amphora in ctx.get(AMPHORAE)? {
            let Some(config) = configs.get(&amphora.id) else {
                continue;
            };
            let result = ctx
                .services()
                .amphora
                .post_vip_plug(&amphora, &lb, config)
                .await;
            tolerate_already_plugged(result, amphora.id, "post_vip_plug")?;
        }
        Ok(())
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

/// Tells every amphora about its newly plugged member ports.
pub struct AmphoraePostNetworkPlug;

#[async_trait]
impl Task for AmphoraePostNetworkPlug {
    fn name(&self) -> &str {
        "amphorae-post-network-plug"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORAE.name(), ADDED_PORTS.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let added = ctx.get(ADDED_PORTS)?;
        for amphora in ctx.get(AMPHORAE)? {
            for port in added.get(&amphora.id).into_iter().flatten() {
                let result = ctx.services().amphora.post_network_plug(&amphora, port).await;
                tolerate_already_plugged(result, amphora.id, "post_network_plug")?;
            }
        }
        Ok(())
    }
}

/// Pushes listener configuration to every amphora and reloads the proxy.
///
/// Revert marks the listeners ERROR.
pub struct ListenersUpdate;

#[async_trait]
impl Task for ListenersUpdate {
    fn name(&self) -> &str {
        "listeners-update"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER.name(), AMPHORAE.name(), LISTENERS.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb = ctx.get(LOADBALANCER)?;
        let listeners = ctx.get(LISTENERS)?;
        for amphora in ctx.get(AMPHORAE)? {
            ctx.services()
                .amphora
                .update_listeners(&lb, &amphora, &listeners)
                .await?;
        }
        Ok(())
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        let Ok(listeners) = ctx.get(LISTENERS) else {
            return RevertOutcome::Skipped;
        };
        let mut outcome = RevertOutcome::Reverted;
        for listener in listeners {
            let result = update_with(&*ctx.repos().listeners, listener.id, |l| {
                l.provisioning_status = ProvisioningStatus::Error;
                l.operating_status = OperatingStatus::Error;
            })
            .await
            .map(|_| ());
            if RevertOutcome::from_result(self.name(), result) == RevertOutcome::LoggedFailure {
                outcome = RevertOutcome::LoggedFailure;
            }
        }
        outcome
    }
}

/// Starts the listeners on every amphora.
pub struct ListenersStart;

#[async_trait]
impl Task for ListenersStart {
    fn name(&self) -> &str {
        "listeners-start"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORAE.name(), LISTENERS.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let listeners = ctx.get(LISTENERS)?;
        for amphora in ctx.get(AMPHORAE)? {
            ctx.services()
                .amphora
                .start_listeners(&amphora, &listeners)
                .await?;
        }
        Ok(())
    }
}

/// Stops the listeners on every amphora.
pub struct ListenersStop;

#[async_trait]
impl Task for ListenersStop {
    fn name(&self) -> &str {
        "listeners-stop"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORAE.name(), LISTENERS.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let listeners = ctx.get(LISTENERS)?;
        for amphora in ctx.get(AMPHORAE)? {
            ctx.services()
                .amphora
                .stop_listeners(&amphora, &listeners)
                .await?;
        }
        Ok(())
    }
}

/// Deletes the listeners from every amphora.
pub struct ListenersDelete;

#[async_trait]
impl Task for ListenersDelete {
    fn name(&self) -> &str {
        "listeners-delete"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORAE.name(), LISTENERS.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let listeners = ctx.get(LISTENERS)?;
        for amphora in ctx.get(AMPHORAE)? {
            for listener in &listeners {
                ctx.services()
                    .amphora
                    .delete_listener(&amphora, listener)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Uploads a new server certificate to the amphora.
pub struct AmphoraCertUpload;

#[async_trait]
impl Task for AmphoraCertUpload {
    fn name(&self) -> &str {
        "amphora-cert-upload"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA.name(), SERVER_PEM.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let amphora = ctx.get(AMPHORA)?;
        let cert = ctx.get(SERVER_PEM)?;
        ctx.services().amphora.upload_cert(&amphora, &cert.pem).await?;
        tracing::info!(amphora_id = %amphora.id, expiration = %cert.expiration, "certificate uploaded");
        Ok(())
    }
}

/// Discovers the VRRP interface and records it on the amphora.
pub struct AmphoraGetVrrpInterface;

#[async_trait]
impl Task for AmphoraGetVrrpInterface {
    fn name(&self) -> &str {
        "amphora-get-vrrp-interface"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORA.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let amphora = ctx.get(AMPHORA)?;
        let interface = ctx.services().amphora.get_vrrp_interface(&amphora).await?;
        let amphora = update_with(&*ctx.repos().amphorae, amphora.id, |amp| {
            amp.vrrp_interface = Some(interface);
        })
        .await?;
        ctx.put(AMPHORA, amphora)
    }
}

/// Pushes the load balancer's VRRP group configuration to the amphora.
pub struct AmphoraUpdateVrrpConf;

#[async_trait]
impl Task for AmphoraUpdateVrrpConf {
    fn name(&self) -> &str {
        "amphora-update-vrrp-conf"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![LOADBALANCER.name(), AMPHORA.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let lb = ctx.get(LOADBALANCER)?;
        let amphora = ctx.get(AMPHORA)?;
        let group = ctx.repos().vrrp_groups.require(lb.id).await?;
        ctx.services()
            .amphora
            .update_vrrp_conf(&lb, &amphora, &group)
            .await?;
        Ok(())
    }
}

/// Starts VRRP on the amphora.
pub struct AmphoraVrrpStart;

#[async_trait]
impl Task for AmphoraVrrpStart {
    fn name(&self) -> &str {
        "amphora-vrrp-start"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        ctx.services().amphora.start_vrrp(&ctx.get(AMPHORA)?).await?;
        Ok(())
    }

    async fn revert(&self, ctx: &TaskContext<'_>) -> RevertOutcome {
        let Ok(amphora) = ctx.get(AMPHORA) else {
            return RevertOutcome::Skipped;
        };
        let result = ctx.services().amphora.stop_vrrp(&amphora).await;
        RevertOutcome::from_result(self.name(), result)
    }
}

/// Stops VRRP on every amphora in the collection.
pub struct AmphoraeVrrpStop;

#[async_trait]
impl Task for AmphoraeVrrpStop {
    fn name(&self) -> &str {
        "amphorae-vrrp-stop"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORAE.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        for amphora in ctx.get(AMPHORAE)? {
            if amphora.vrrp_interface.is_some() {
                ctx.services().amphora.stop_vrrp(&amphora).await?;
            }
        }
        Ok(())
    }
}

/// Reads the MAC of the amphora's VIP interface.
pub struct AmphoraGetMac;

#[async_trait]
impl Task for AmphoraGetMac {
    fn name(&self) -> &str {
        "amphora-get-mac"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![AMPHORA_MAC.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let mac = ctx.services().amphora.get_mac(&ctx.get(AMPHORA)?).await?;
        ctx.put(AMPHORA_MAC, mac)
    }
}

/// Stops the amphora answering ARP for the VIP so only the distributor does.
pub struct AmphoraDisableArp;

#[async_trait]
impl Task for AmphoraDisableArp {
    fn name(&self) -> &str {
        "amphora-disable-arp"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        ctx.services().amphora.disable_arp(&ctx.get(AMPHORA)?).await?;
        Ok(())
    }
}
