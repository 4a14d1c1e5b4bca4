//! Entry points for the amphora and cluster lifecycle.
//!
//! [`ClusterManager`] looks up whatever a flow builder needs, builds the
//! flow, seeds the store and runs it on its [`FlowEngine`]. Each operation is
//! one or more complete flow runs; a failed run has already been reverted by
//! the time the error is returned.

use fleetlb_core::repository::update_with;
use fleetlb_core::{
    AmphoraId, AmphoraStatus, LoadBalancerId, ProvisioningStatus, Repository, Topology,
};

use crate::engine::FlowEngine;
use crate::error::{Error, Result};
use crate::flow::Flow;
use crate::flows::{
    cert_rotate_amphora_flow, create_amphora_flow, create_cluster_amphorae_flow,
    create_cluster_flow, delete_amphora_flow, delete_cluster_flow, failover_amphora_flow,
    finalize_cluster_flow, spare_fill_flow,
};
use crate::keys::{AMPHORA_ID, CLUSTER_MIN_SIZE, FAILED_AMPHORA_ID, LOADBALANCER_ID};
use crate::metrics::FlowMetrics;
use crate::services::Services;
use crate::store::FlowStore;

/// Runs lifecycle flows against one set of services.
#[derive(Debug, Clone)]
pub struct ClusterManager {
    engine: FlowEngine,
    metrics: FlowMetrics,
}

impl ClusterManager {
    /// Creates a manager with its own engine.
    #[must_use]
    pub fn new(services: Services) -> Self {
        Self::with_engine(FlowEngine::new(services))
    }

    /// Creates a manager over an existing engine.
    #[must_use]
    pub const fn with_engine(engine: FlowEngine) -> Self {
        Self {
            engine,
            metrics: FlowMetrics::new(),
        }
    }

    /// Returns the engine.
    #[must_use]
    pub const fn engine(&self) -> &FlowEngine {
        &self.engine
    }

    fn services(&self) -> &Services {
        self.engine.services()
    }

    /// Creates an active-active load balancer: its distributor, its
    /// amphorae, then the wiring between them.
    ///
    /// If any of the three runs fails, the load balancer and its listeners
    /// are left in `ERROR`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the load balancer is not
    /// active-active, or the failure of the first flow that did not complete.
    pub async fn create_active_active_load_balancer(&self, lb_id: LoadBalancerId) -> Result<()> {
        let lb = self.services().repos.load_balancers.require(lb_id).await?;
        if lb.topology != Topology::ActiveActive {
            return Err(Error::invalid_request(format!(
                "load balancer {lb_id} has topology {}",
                lb.topology
            )));
        }

        let result = self.build_cluster(lb_id).await;
        if result.is_err() {
            self.mark_lb_error(lb_id).await;
        }
        result
    }

    async fn build_cluster(&self, lb_id: LoadBalancerId) -> Result<()> {
        let store = self
            .engine
            .run(&create_cluster_flow(), Self::lb_store(lb_id))
            .await?;
        let cluster_size = store.get(CLUSTER_MIN_SIZE)?;
        tracing::info!(%lb_id, cluster_size, "distributor ready, building cluster amphorae");

        let config = &self.services().config;
        self.engine
            .run(
                &create_cluster_amphorae_flow(cluster_size, config),
                Self::lb_store(lb_id),
            )
            .await?;
        self.engine
            .run(&finalize_cluster_flow(cluster_size), Self::lb_store(lb_id))
            .await?;
        tracing::info!(%lb_id, cluster_size, "active-active load balancer created");
        Ok(())
    }

    /// Deletes an active-active load balancer and everything built for it.
    ///
    /// # Errors
    ///
    /// Returns the failure of the delete flow.
    pub async fn delete_active_active_load_balancer(&self, lb_id: LoadBalancerId) -> Result<()> {
        self.engine
            .run(&delete_cluster_flow(), Self::lb_store(lb_id))
            .await?;
        tracing::info!(%lb_id, "active-active load balancer deleted");
        Ok(())
    }

    /// Replaces a failed amphora.
    ///
    /// Returns the replacement's id, or `None` when the failed amphora was a
    /// spare and was only deleted.
    ///
    /// # Errors
    ///
    /// Returns a repository error if the amphora does not exist, or the
    /// failure of the failover flow.
    pub async fn failover_amphora(&self, amphora_id: AmphoraId) -> Result<Option<AmphoraId>> {
        let failed = self.services().repos.amphorae.require(amphora_id).await?;
        let flow = failover_amphora_flow(&failed, &self.services().config);

        let mut store = FlowStore::new().with(FAILED_AMPHORA_ID, amphora_id);
        if let Some(lb_id) = failed.load_balancer_id {
            store = store.with(LOADBALANCER_ID, lb_id);
        }
        let store = self.engine.run(&flow, store).await?;

        let replacement = store.get_opt(AMPHORA_ID)?;
        match replacement {
            Some(new_id) => tracing::info!(failed = %amphora_id, replacement = %new_id, "amphora failed over"),
            None => tracing::info!(failed = %amphora_id, "spare amphora deleted"),
        }
        Ok(replacement)
    }

    /// Builds one spare amphora.
    ///
    /// # Errors
    ///
    /// Returns the failure of the create flow.
    pub async fn create_spare_amphora(&self) -> Result<AmphoraId> {
        let store = self
            .engine
            .run(&create_amphora_flow(&self.services().config), FlowStore::new())
            .await?;
        store.get(AMPHORA_ID)
    }

    /// Tops the spare pool up to the configured size and returns how many
    /// amphorae were built.
    ///
    /// # Errors
    ///
    /// Returns a repository error, or the failure of the fill flow.
    pub async fn fill_spare_pool(&self) -> Result<usize> {
        let amphorae = &self.services().repos.amphorae;
        let current = amphorae.spare_count().await?;
        let missing = self
            .services()
            .config
            .spare_amphora_pool_size
            .saturating_sub(current);
        if missing == 0 {
            self.metrics.set_spare_amphorae(current);
            return Ok(0);
        }

        tracing::info!(current, missing, "filling spare pool");
        let result = self
            .engine
            .run(&spare_fill_flow(missing, &self.services().config), FlowStore::new())
            .await;
        self.metrics.set_spare_amphorae(amphorae.spare_count().await?);
        result.map(|_| missing)
    }

    /// Deletes a spare amphora.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the amphora is not a spare.
    pub async fn delete_spare_amphora(&self, amphora_id: AmphoraId) -> Result<()> {
        let amphora = self.services().repos.amphorae.require(amphora_id).await?;
        if !amphora.is_spare() {
            return Err(Error::invalid_request(format!(
                "amphora {amphora_id} is {} and not a spare",
                amphora.status
            )));
        }
        self.run_for_amphora(delete_amphora_flow(), amphora_id).await
    }

    /// Issues a new server certificate to an amphora.
    ///
    /// The amphora is flagged busy while the rotation runs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the amphora is deleted, or the
    /// failure of the rotation flow.
    pub async fn rotate_amphora_cert(&self, amphora_id: AmphoraId) -> Result<()> {
        let amphorae = &self.services().repos.amphorae;
        let amphora = amphorae.require(amphora_id).await?;
        if matches!(
            amphora.status,
            AmphoraStatus::PendingDelete | AmphoraStatus::Deleted
        ) {
            return Err(Error::invalid_request(format!(
                "amphora {amphora_id} is {}",
                amphora.status
            )));
        }
        update_with(&**amphorae, amphora_id, |amp| amp.cert_busy = true).await?;
        self.run_for_amphora(cert_rotate_amphora_flow(), amphora_id)
            .await
    }

    async fn run_for_amphora(&self, flow: Flow, amphora_id: AmphoraId) -> Result<()> {
        self.engine
            .run(&flow, FlowStore::new().with(AMPHORA_ID, amphora_id))
            .await
            .map(|_| ())
    }

    async fn mark_lb_error(&self, lb_id: LoadBalancerId) {
        if let Err(error) = self
            .services()
            .repos
            .mark_lb_and_listeners(lb_id, ProvisioningStatus::Error)
            .await
        {
            tracing::error!(%lb_id, error = %error, "failed to mark load balancer ERROR");
        }
    }

    fn lb_store(lb_id: LoadBalancerId) -> FlowStore {
        FlowStore::new().with(LOADBALANCER_ID, lb_id)
    }
}
