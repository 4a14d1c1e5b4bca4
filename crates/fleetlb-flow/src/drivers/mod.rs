//! Provider capabilities and the named driver registry.
//!
//! The orchestration layer depends only on the capability traits:
//!
//! | Capability | Trait | Built-in drivers |
//! |------------|-------|------------------|
//! | Compute | [`ComputeDriver`] | `noop` |
//! | Network | [`NetworkDriver`] | `noop` |
//! | Amphora agent | [`AmphoraDriver`] | `noop` |
//! | Distributor | [`DistributorDriver`] | `local`, `noop` |
//! | Certificates | [`CertGenerator`] | `noop` |
//!
//! Deployments pick a driver per capability by name through
//! [`DriverRegistry`]; additional backends register their constructors under
//! new names.

pub mod amphora;
pub mod cert;
pub mod compute;
pub mod distributor;
pub mod network;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use fleetlb_distributor::DistributorEngine;

pub use self::amphora::{amphora_mac, AmphoraCall, AmphoraDriver, NoopAmphoraDriver};
pub use self::cert::{CertGenerator, Certificate, NoopCertGenerator};
pub use self::compute::{
    ComputeBuildRequest, ComputeDetails, ComputeDriver, ComputeStatus, NoopComputeDriver,
};
pub use self::distributor::{DistributorDriver, LocalDistributorDriver, NoopDistributorDriver};
pub use self::network::{
    AmphoraNetworkConfig, NetworkDelta, NetworkDriver, NoopNetworkDriver, Port, Subnet,
};

/// Result of a driver call.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Errors reported by provider drivers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// The backend rejected or failed the call.
    #[error("{driver} {operation} failed: {message}")]
    Failed {
        /// Driver kind.
        driver: &'static str,
        /// Operation name.
        operation: &'static str,
        /// Backend message.
        message: String,
    },

    /// The backend does not know the resource.
    #[error("{resource} not found: {id}")]
    NotFound {
        /// Resource kind.
        resource: &'static str,
        /// Resource id.
        id: String,
    },

    /// The amphora agent already has the network.
    #[error("network already plugged on amphora {target}")]
    AlreadyPlugged {
        /// Amphora id.
        target: String,
    },

    /// No driver is registered under the name.
    #[error("unknown {kind} driver '{name}'")]
    UnknownDriver {
        /// Capability.
        kind: &'static str,
        /// Requested name.
        name: String,
    },
}

impl DriverError {
    /// Creates a backend failure.
    #[must_use]
    pub fn failed(driver: &'static str, operation: &'static str, message: impl Into<String>) -> Self {
        Self::Failed {
            driver,
            operation,
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(resource: &'static str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// Returns true for [`DriverError::AlreadyPlugged`].
    #[must_use]
    pub const fn is_already_plugged(&self) -> bool {
        matches!(self, Self::AlreadyPlugged { .. })
    }

    /// Returns true for [`DriverError::NotFound`].
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Operations a noop driver has been told to fail.
#[derive(Debug, Default)]
pub(crate) struct FailureSet {
    failing: Mutex<BTreeSet<&'static str>>,
}

impl FailureSet {
    pub(crate) fn fail(&self, operation: &'static str) {
        self.lock().insert(operation);
    }

    pub(crate) fn heal(&self, operation: &'static str) {
        self.lock().remove(operation);
    }

    pub(crate) fn check(&self, driver: &'static str, operation: &'static str) -> DriverResult<()> {
        if self.lock().contains(operation) {
            return Err(DriverError::failed(driver, operation, "injected failure"));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<&'static str>> {
        self.failing
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// What driver constructors may draw on.
#[derive(Debug, Clone, Default)]
pub struct DriverContext {
    /// In-process distributor engine for the `local` distributor driver.
    pub distributor_engine: Option<Arc<DistributorEngine>>,
}

type Constructor<T> = Arc<dyn Fn(&DriverContext) -> DriverResult<Arc<T>> + Send + Sync>;

struct Table<T: ?Sized> {
    kind: &'static str,
    entries: BTreeMap<String, Constructor<T>>,
}

impl<T: ?Sized> Clone for Table<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            entries: self.entries.clone(),
        }
    }
}

impl<T: ?Sized> Table<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
        }
    }

    fn register(&mut self, name: impl Into<String>, constructor: Constructor<T>) {
        self.entries.insert(name.into(), constructor);
    }

    fn build(&self, name: &str, ctx: &DriverContext) -> DriverResult<Arc<T>> {
        let constructor = self.entries.get(name).ok_or_else(|| DriverError::UnknownDriver {
            kind: self.kind,
            name: name.to_string(),
        })?;
        constructor(ctx)
    }

    fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// Maps driver names to constructors, per capability.
#[derive(Clone)]
pub struct DriverRegistry {
    compute: Table<dyn ComputeDriver>,
    network: Table<dyn NetworkDriver>,
    amphora: Table<dyn AmphoraDriver>,
    distributor: Table<dyn DistributorDriver>,
    cert: Table<dyn CertGenerator>,
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("compute", &self.compute.names())
            .field("network", &self.network.names())
            .field("amphora", &self.amphora.names())
            .field("distributor", &self.distributor.names())
            .field("cert_generator", &self.cert.names())
            .finish()
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl DriverRegistry {
    /// Creates a registry with no drivers.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            compute: Table::new("compute"),
            network: Table::new("network"),
            amphora: Table::new("amphora"),
            distributor: Table::new("distributor"),
            cert: Table::new("cert_generator"),
        }
    }

    /// Creates a registry with the built-in drivers.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register_compute("noop", |_| Ok(Arc::new(NoopComputeDriver::new())));
        registry.register_network("noop", |_| Ok(Arc::new(NoopNetworkDriver::new())));
        registry.register_amphora("noop", |_| Ok(Arc::new(NoopAmphoraDriver::new())));
        registry.register_cert_generator("noop", |_| Ok(Arc::new(NoopCertGenerator::new())));
        registry.register_distributor("noop", |_| Ok(Arc::new(NoopDistributorDriver::new())));
        registry.register_distributor("local", |ctx| {
            let engine = ctx.distributor_engine.clone().ok_or_else(|| {
                DriverError::failed("distributor", "construct", "no in-process engine available")
            })?;
            Ok(Arc::new(LocalDistributorDriver::new(engine)))
        });
        registry
    }

    /// Registers a compute driver.
    pub fn register_compute<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&DriverContext) -> DriverResult<Arc<dyn ComputeDriver>> + Send + Sync + 'static,
    {
        self.compute.register(name, Arc::new(constructor));
    }

    /// Registers a network driver.
    pub fn register_network<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&DriverContext) -> DriverResult<Arc<dyn NetworkDriver>> + Send + Sync + 'static,
    {
        self.network.register(name, Arc::new(constructor));
    }

    /// Registers an amphora driver.
    pub fn register_amphora<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&DriverContext) -> DriverResult<Arc<dyn AmphoraDriver>> + Send + Sync + 'static,
    {
        self.amphora.register(name, Arc::new(constructor));
    }

    /// Registers a distributor driver.
    pub fn register_distributor<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&DriverContext) -> DriverResult<Arc<dyn DistributorDriver>> + Send + Sync + 'static,
    {
        self.distributor.register(name, Arc::new(constructor));
    }

    /// Registers a certificate generator.
    pub fn register_cert_generator<F>(&mut self, name: impl Into<String>, constructor: F)
    where
        F: Fn(&DriverContext) -> DriverResult<Arc<dyn CertGenerator>> + Send + Sync + 'static,
    {
        self.cert.register(name, Arc::new(constructor));
    }

    /// Builds a compute driver.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::UnknownDriver`] or the constructor's error.
    pub fn compute(&self, name: &str, ctx: &DriverContext) -> DriverResult<Arc<dyn ComputeDriver>> {
        self.compute.build(name, ctx)
    }

    /// Builds a network driver.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::UnknownDriver`] or the constructor's error.
    pub fn network(&self, name: &str, ctx: &DriverContext) -> DriverResult<Arc<dyn NetworkDriver>> {
        self.network.build(name, ctx)
    }

    /// Builds an amphora driver.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::UnknownDriver`] or the constructor's error.
    pub fn amphora(&self, name: &str, ctx: &DriverContext) -> DriverResult<Arc<dyn AmphoraDriver>> {
        self.amphora.build(name, ctx)
    }

    /// Builds a distributor driver.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::UnknownDriver`] or the constructor's error.
    pub fn distributor(
        &self,
        name: &str,
        ctx: &DriverContext,
    ) -> DriverResult<Arc<dyn DistributorDriver>> {
        self.distributor.build(name, ctx)
    }

    /// Builds a certificate generator.
    ///
    /// # Errors
    ///
    /// Returns [`DriverError::UnknownDriver`] or the constructor's error.
    pub fn cert_generator(
        &self,
        name: &str,
        ctx: &DriverContext,
    ) -> DriverResult<Arc<dyn CertGenerator>> {
        self.cert.build(name, ctx)
    }
}
