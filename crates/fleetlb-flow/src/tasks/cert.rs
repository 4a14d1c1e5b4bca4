//! Certificate tasks.

use async_trait::async_trait;

use fleetlb_core::repository::update_with;

use crate::error::Result;
use crate::keys::{AMPHORA_ID, SERVER_PEM};
use crate::task::{Task, TaskContext};

/// Issues a server certificate whose common name is the amphora id.
pub struct GenerateServerPem;

#[async_trait]
impl Task for GenerateServerPem {
    fn name(&self) -> &str {
        "generate-server-pem"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID.name()]
    }

    fn provides(&self) -> Vec<&'static str> {
        vec![SERVER_PEM.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let amphora_id = ctx.get(AMPHORA_ID)?;
        let cert = ctx
            .services()
            .certs
            .generate(&amphora_id.to_string(), ctx.config().cert_validity)
            .await?;
        ctx.put(SERVER_PEM, cert)
    }
}

/// Records the certificate expiry on the amphora.
pub struct UpdateAmphoraCertExpiration;

#[async_trait]
impl Task for UpdateAmphoraCertExpiration {
    fn name(&self) -> &str {
        "update-amphora-cert-expiration"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID.name(), SERVER_PEM.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        let expiration = ctx.get(SERVER_PEM)?.expiration;
        update_with(&*ctx.repos().amphorae, ctx.get(AMPHORA_ID)?, |amp| {
            amp.cert_expiration = Some(expiration);
        })
        .await?;
        Ok(())
    }
}

/// Clears the rotation-in-progress flag.
pub struct CertBusyToFalse;

#[async_trait]
impl Task for CertBusyToFalse {
    fn name(&self) -> &str {
        "cert-busy-to-false"
    }

    fn requires(&self) -> Vec<&'static str> {
        vec![AMPHORA_ID.name()]
    }

    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<()> {
        update_with(&*ctx.repos().amphorae, ctx.get(AMPHORA_ID)?, |amp| {
            amp.cert_busy = false;
        })
        .await?;
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
    use chrono::Utc;
    use fleetlb_core::{Amphora, AmphoraId};

    #[tokio::test]
    async fn rotation_bookkeeping() {
        let services = Services::noop();
        let mut amp = Amphora::new(AmphoraId::generate());
        amp.cert_busy = true;
        services.repos.amphorae.create(amp.clone()).await.unwrap();

        let flow = Flow::sequence(
            "rotate",
            vec![
                Flow::task(GenerateServerPem),
                Flow::task(UpdateAmphoraCertExpiration),
                Flow::task(CertBusyToFalse),
            ],
        );
        let store = FlowEngine::new(services.clone())
            .run(&flow, FlowStore::new().with(AMPHORA_ID, amp.id))
            .await
            .unwrap();

        let cert = store.get(SERVER_PEM).unwrap();
        assert!(cert.expiration > Utc::now());
        let stored = services.repos.amphorae.require(amp.id).await.unwrap();
        assert_eq!(stored.cert_expiration, Some(cert.expiration));
        assert!(!stored.cert_busy);
    }
}
