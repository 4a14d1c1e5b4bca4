//! Everything a task can reach: repositories, drivers and configuration.

use std::fmt;
use std::sync::Arc;

use fleetlb_core::Repositories;

use crate::config::ControllerConfig;
use crate::drivers::{
    AmphoraDriver, CertGenerator, ComputeDriver, DistributorDriver, DriverContext, DriverRegistry,
    NetworkDriver, NoopAmphoraDriver, NoopCertGenerator, NoopComputeDriver,
    NoopDistributorDriver, NoopNetworkDriver,
};
use crate::error::Result;

/// Shared handles passed to every task.
#[derive(Clone)]
pub struct Services {
    /// Repositories.
    pub repos: Repositories,
    /// Compute backend.
    pub compute: Arc<dyn ComputeDriver>,
    /// Network backend.
    pub network: Arc<dyn NetworkDriver>,
    /// Amphora agent transport.
    pub amphora: Arc<dyn AmphoraDriver>,
    /// Distributor transport.
    pub distributor: Arc<dyn DistributorDriver>,
    /// Certificate issuer.
    pub certs: Arc<dyn CertGenerator>,
    /// Controller configuration.
    pub config: Arc<ControllerConfig>,
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Services {
    /// In-memory repositories, noop drivers and the default configuration.
    #[must_use]
    pub fn noop() -> Self {
        Self {
            repos: Repositories::in_memory(),
            compute: Arc::new(NoopComputeDriver::new()),
            network: Arc::new(NoopNetworkDriver::new()),
            amphora: Arc::new(NoopAmphoraDriver::new()),
            distributor: Arc::new(NoopDistributorDriver::new()),
            certs: Arc::new(NoopCertGenerator::new()),
            config: Arc::new(ControllerConfig::default()),
        }
    }

    /// Builds the drivers named in `config` from `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Driver`] if a name is unknown or a constructor
    /// fails.
    pub fn from_registry(
        repos: Repositories,
        config: ControllerConfig,
        registry: &DriverRegistry,
        ctx: &DriverContext,
    ) -> Result<Self> {
        config.validate()?;
        let services = Self {
            repos,
            compute: registry.compute(&config.compute_driver, ctx)?,
            network: registry.network(&config.network_driver, ctx)?,
            amphora: registry.amphora(&config.amphora_driver, ctx)?,
            distributor: registry.distributor(&config.distributor_driver, ctx)?,
            certs: registry.cert_generator(&config.cert_generator, ctx)?,
            config: Arc::new(config),
        };
        tracing::info!(
            compute = %services.config.compute_driver,
            network = %services.config.network_driver,
            amphora = %services.config.amphora_driver,
            distributor = %services.config.distributor_driver,
            "controller drivers loaded"
        );
        Ok(services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn registry_builds_configured_drivers() {
        let config = ControllerConfig {
            distributor_driver: "noop".to_string(),
            ..ControllerConfig::default()
        };
        let services = Services::from_registry(
            Repositories::in_memory(),
            config,
            &DriverRegistry::builtin(),
            &DriverContext::default(),
        );
        assert!(services.is_ok());
    }

    #[test]
    fn unknown_driver_is_rejected() {
        let config = ControllerConfig {
            compute_driver: "nova".to_string(),
            distributor_driver: "noop".to_string(),
            ..ControllerConfig::default()
        };
        let err = Services::from_registry(
            Repositories::in_memory(),
            config,
            &DriverRegistry::builtin(),
            &DriverContext::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Driver(_)));
    }
}
