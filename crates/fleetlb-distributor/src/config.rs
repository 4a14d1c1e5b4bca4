//! Distributor agent configuration.
//!
//! Loaded from `FLEETLB_DIST_*` environment variables on top of defaults.

use std::net::SocketAddr;
use std::time::Duration;

use fleetlb_core::env::{env_bool, env_string, env_u32, env_u64, env_usize};
use fleetlb_core::{Error, Result};

/// Hard ceiling on live distributors per engine.
pub const MAX_DISTRIBUTORS: usize = 128;

/// Hard ceiling on the slot count of one distributor.
pub const MAX_CLUSTER_SIZE: u32 = 512;

/// Configuration of the distributor engine and its HTTP agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributorConfig {
    /// Address the HTTP agent binds.
    pub listen_addr: SocketAddr,
    /// Maximum number of distributors.
    pub max_distributors: usize,
    /// Maximum slot count of one distributor.
    pub max_cluster_size: u32,
    /// Distributor count at which the engine reports FULL.
    pub soft_capacity: usize,
    /// Delay before the single retry of an empty port read.
    pub port_read_retry_delay: Duration,
    /// OpenFlow protocol programmed on every bridge.
    pub openflow_protocol: String,
    /// Enables debug output from the agent.
    pub debug: bool,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9443)),
            max_distributors: MAX_DISTRIBUTORS,
            max_cluster_size: MAX_CLUSTER_SIZE,
            soft_capacity: MAX_DISTRIBUTORS,
            port_read_retry_delay: Duration::from_secs(1),
            openflow_protocol: "OpenFlow15".to_string(),
            debug: false,
        }
    }
}

impl DistributorConfig {
    /// Loads configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for malformed values or when a limit
    /// exceeds its hard ceiling.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = env_string("FLEETLB_DIST_LISTEN_ADDR") {
            config.listen_addr = addr.parse().map_err(|e| {
                Error::InvalidInput(format!("FLEETLB_DIST_LISTEN_ADDR must be host:port: {e}"))
            })?;
        }
        if let Some(max) = env_usize("FLEETLB_DIST_MAX_DISTRIBUTORS")? {
            config.max_distributors = max;
            config.soft_capacity = max;
        }
        if let Some(max) = env_u32("FLEETLB_DIST_MAX_CLUSTER_SIZE")? {
            config.max_cluster_size = max;
        }
        if let Some(soft) = env_usize("FLEETLB_DIST_SOFT_CAPACITY")? {
            config.soft_capacity = soft;
        }
        if let Some(ms) = env_u64("FLEETLB_DIST_PORT_READ_RETRY_MS")? {
            config.port_read_retry_delay = Duration::from_millis(ms);
        }
        if let Some(protocol) = env_string("FLEETLB_DIST_OPENFLOW_PROTOCOL") {
            config.openflow_protocol = protocol;
        }
        if let Some(debug) = env_bool("FLEETLB_DIST_DEBUG")? {
            config.debug = debug;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the limits against their hard ceilings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] describing the first violated limit.
    pub fn validate(&self) -> Result<()> {
        if self.max_distributors > MAX_DISTRIBUTORS {
            return Err(Error::InvalidInput(format!(
                "max_distributors {} exceeds {MAX_DISTRIBUTORS}",
                self.max_distributors
            )));
        }
        if self.max_cluster_size == 0 || self.max_cluster_size > MAX_CLUSTER_SIZE {
            return Err(Error::InvalidInput(format!(
                "max_cluster_size must be within 1..={MAX_CLUSTER_SIZE}"
            )));
        }
        if self.soft_capacity > self.max_distributors {
            return Err(Error::InvalidInput(
                "soft_capacity cannot exceed max_distributors".to_string(),
            ));
        }
        Ok(())
    }
}
