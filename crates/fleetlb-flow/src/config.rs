//! Controller configuration.
//!
//! Loaded from `FLEETLB_*` environment variables on top of defaults. Lists
//! are comma separated.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `FLEETLB_WORKERS` | 5 |
//! | `FLEETLB_AMP_ACTIVE_RETRIES` | 30 |
//! | `FLEETLB_AMP_ACTIVE_WAIT_SECS` | 10 |
//! | `FLEETLB_PORT_DETACH_TIMEOUT_SECS` | 300 |
//! | `FLEETLB_PORT_DETACH_INTERVAL_SECS` | 5 |
//! | `FLEETLB_AMP_IMAGE_TAG` | `amphora` |
//! | `FLEETLB_AMP_FLAVOR_ID` | `amphora` |
//! | `FLEETLB_AMP_BOOT_NETWORKS` | empty |
//! | `FLEETLB_AMP_SSH_KEY_NAME` | unset |
//! | `FLEETLB_ENABLE_ANTI_AFFINITY` | false |
//! | `FLEETLB_ANTI_AFFINITY_POLICY` | `anti-affinity` |
//! | `FLEETLB_TRANSPORT` | `cert_based` |
//! | `FLEETLB_CERT_VALIDITY_DAYS` | 730 |
//! | `FLEETLB_CLUSTER_SIZE` | 2 |
//! | `FLEETLB_CLUSTER_ALG_TYPE` | `ACTIVE_ACTIVE` |
//! | `FLEETLB_SPARE_POOL_SIZE` | 0 |
//! | `FLEETLB_COMPUTE_DRIVER` | `noop` |
//! | `FLEETLB_NETWORK_DRIVER` | `noop` |
//! | `FLEETLB_AMPHORA_DRIVER` | `noop` |
//! | `FLEETLB_DISTRIBUTOR_DRIVER` | `local` |
//! | `FLEETLB_CERT_GENERATOR` | `noop` |
//! | `FLEETLB_DISTRIBUTOR_FRONTEND_MAC` | unset |
//! | `FLEETLB_CONTROLLER_IP_PORT_LIST` | empty |
//! | `FLEETLB_HEARTBEAT_INTERVAL_SECS` | 10 |
//! | `FLEETLB_HEARTBEAT_KEY` | unset |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use fleetlb_core::env::{env_bool, env_list, env_string, env_u32, env_u64, env_usize};
use fleetlb_distributor::ACTIVE_ACTIVE_ALGORITHM;

use crate::error::{Error, Result};

/// How the controller talks to amphora agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// Mutual TLS; every amphora boots with a server certificate.
    #[default]
    CertBased,
    /// No certificates.
    Plain,
}

impl Transport {
    /// Returns the configuration name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CertBased => "cert_based",
            Self::Plain => "plain",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cert_based" => Ok(Self::CertBased),
            "plain" => Ok(Self::Plain),
            other => Err(Error::config(format!("unknown transport '{other}'"))),
        }
    }
}

/// Controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Tasks executing at once per engine.
    pub workers: usize,
    /// Compute status polls before giving up.
    pub amp_active_retries: u32,
    /// Sleep between compute status polls.
    pub amp_active_wait: Duration,
    /// How long to wait for ports to detach.
    pub port_detach_timeout: Duration,
    /// Sleep between port detach polls.
    pub port_detach_interval: Duration,
    /// Image tag amphorae boot from.
    pub amp_image_tag: String,
    /// Compute flavor.
    pub amp_flavor_id: String,
    /// Networks every amphora boots on.
    pub amp_boot_networks: Vec<String>,
    /// SSH key injected into amphorae.
    pub amp_ssh_key_name: Option<String>,
    /// Whether cluster amphorae get a server group.
    pub enable_anti_affinity: bool,
    /// Server group policy.
    pub anti_affinity_policy: String,
    /// Agent transport.
    pub transport: Transport,
    /// Server certificate validity.
    pub cert_validity: Duration,
    /// Active-active cluster size when the load balancer does not set one.
    pub default_cluster_size: u32,
    /// Cluster algorithm tag sent to distributors.
    pub cluster_alg_type: String,
    /// Spare amphorae kept ready.
    pub spare_amphora_pool_size: usize,
    /// Compute driver name.
    pub compute_driver: String,
    /// Network driver name.
    pub network_driver: String,
    /// Amphora driver name.
    pub amphora_driver: String,
    /// Distributor driver name.
    pub distributor_driver: String,
    /// Certificate generator name.
    pub cert_generator: String,
    /// MAC of the distributor host interface facing VIP networks.
    pub distributor_frontend_mac: Option<String>,
    /// Health manager endpoints written into the agent config.
    pub controller_ip_port_list: Vec<String>,
    /// Agent heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Agent heartbeat signing key.
    pub heartbeat_key: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            amp_active_retries: 30,
            amp_active_wait: Duration::from_secs(10),
            port_detach_timeout: Duration::from_secs(300),
            port_detach_interval: Duration::from_secs(5),
            amp_image_tag: "amphora".to_string(),
            amp_flavor_id: "amphora".to_string(),
            amp_boot_networks: Vec::new(),
            amp_ssh_key_name: None,
            enable_anti_affinity: false,
            anti_affinity_policy: "anti-affinity".to_string(),
            transport: Transport::CertBased,
            cert_validity: Duration::from_secs(730 * 24 * 60 * 60),
            default_cluster_size: 2,
            cluster_alg_type: ACTIVE_ACTIVE_ALGORITHM.to_string(),
            spare_amphora_pool_size: 0,
            compute_driver: "noop".to_string(),
            network_driver: "noop".to_string(),
            amphora_driver: "noop".to_string(),
            distributor_driver: "local".to_string(),
            cert_generator: "noop".to_string(),
            distributor_frontend_mac: None,
            controller_ip_port_list: Vec::new(),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_key: None,
        }
    }
}

fn core_err(err: fleetlb_core::Error) -> Error {
    Error::config(err.to_string())
}

impl ControllerConfig {
    /// Loads configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for malformed values.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(workers) = env_usize("FLEETLB_WORKERS").map_err(core_err)? {
            config.workers = workers;
        }
        if let Some(retries) = env_u32("FLEETLB_AMP_ACTIVE_RETRIES").map_err(core_err)? {
            config.amp_active_retries = retries;
        }
        if let Some(secs) = env_u64("FLEETLB_AMP_ACTIVE_WAIT_SECS").map_err(core_err)? {
            config.amp_active_wait = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("FLEETLB_PORT_DETACH_TIMEOUT_SECS").map_err(core_err)? {
            config.port_detach_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("FLEETLB_PORT_DETACH_INTERVAL_SECS").map_err(core_err)? {
            config.port_detach_interval = Duration::from_secs(secs);
        }
        if let Some(tag) = env_string("FLEETLB_AMP_IMAGE_TAG") {
            config.amp_image_tag = tag;
        }
        if let Some(flavor) = env_string("FLEETLB_AMP_FLAVOR_ID") {
            config.amp_flavor_id = flavor;
        }
        if let Some(networks) = env_list("FLEETLB_AMP_BOOT_NETWORKS") {
            config.amp_boot_networks = networks;
        }
        config.amp_ssh_key_name = env_string("FLEETLB_AMP_SSH_KEY_NAME");
        if let Some(enabled) = env_bool("FLEETLB_ENABLE_ANTI_AFFINITY").map_err(core_err)? {
            config.enable_anti_affinity = enabled;
        }
        if let Some(policy) = env_string("FLEETLB_ANTI_AFFINITY_POLICY") {
            config.anti_affinity_policy = policy;
        }
        if let Some(transport) = env_string("FLEETLB_TRANSPORT") {
            config.transport = transport.parse()?;
        }
        if let Some(days) = env_u64("FLEETLB_CERT_VALIDITY_DAYS").map_err(core_err)? {
            config.cert_validity = Duration::from_secs(days * 24 * 60 * 60);
        }
        if let Some(size) = env_u32("FLEETLB_CLUSTER_SIZE").map_err(core_err)? {
            config.default_cluster_size = size;
        }
        if let Some(alg) = env_string("FLEETLB_CLUSTER_ALG_TYPE") {
            config.cluster_alg_type = alg;
        }
        if let Some(size) = env_usize("FLEETLB_SPARE_POOL_SIZE").map_err(core_err)? {
            config.spare_amphora_pool_size = size;
        }
        for (var, field) in [
            ("FLEETLB_COMPUTE_DRIVER", &mut config.compute_driver),
            ("FLEETLB_NETWORK_DRIVER", &mut config.network_driver),
            ("FLEETLB_AMPHORA_DRIVER", &mut config.amphora_driver),
            ("FLEETLB_DISTRIBUTOR_DRIVER", &mut config.distributor_driver),
            ("FLEETLB_CERT_GENERATOR", &mut config.cert_generator),
        ] {
            if let Some(name) = env_string(var) {
                *field = name;
            }
        }
        config.distributor_frontend_mac = env_string("FLEETLB_DISTRIBUTOR_FRONTEND_MAC");
        if let Some(list) = env_list("FLEETLB_CONTROLLER_IP_PORT_LIST") {
            config.controller_ip_port_list = list;
        }
        if let Some(secs) = env_u64("FLEETLB_HEARTBEAT_INTERVAL_SECS").map_err(core_err)? {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        config.heartbeat_key = env_string("FLEETLB_HEARTBEAT_KEY");

        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::config("workers must be at least 1"));
        }
        if self.amp_active_retries == 0 {
            return Err(Error::config("amp_active_retries must be at least 1"));
        }
        if self.port_detach_interval.is_zero() {
            return Err(Error::config("port_detach_interval must be positive"));
        }
        if self.default_cluster_size == 0
            || self.default_cluster_size > fleetlb_distributor::config::MAX_CLUSTER_SIZE
        {
            return Err(Error::config(format!(
                "cluster size must be within 1..={}",
                fleetlb_distributor::config::MAX_CLUSTER_SIZE
            )));
        }
        Ok(())
    }

    /// Returns true if amphorae boot with server certificates.
    #[must_use]
    pub fn cert_based(&self) -> bool {
        self.transport == Transport::CertBased
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ControllerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.workers, 5);
        assert_eq!(config.amp_active_retries, 30);
        assert_eq!(config.port_detach_timeout, Duration::from_secs(300));
        assert!(config.cert_based());
        assert_eq!(config.distributor_driver, "local");
    }

    #[test]
    fn zero_workers_are_rejected() {
        let config = ControllerConfig {
            workers: 0,
            ..ControllerConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn oversized_cluster_is_rejected() {
        let config = ControllerConfig {
            default_cluster_size: 513,
            ..ControllerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn transport_parses() {
        assert_eq!("plain".parse::<Transport>().unwrap(), Transport::Plain);
        assert_eq!("cert_based".parse::<Transport>().unwrap(), Transport::CertBased);
        assert!("tls".parse::<Transport>().is_err());
    }
}
