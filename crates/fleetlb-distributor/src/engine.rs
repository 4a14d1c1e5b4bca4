//! The distributor control engine.
//!
//! [`DistributorEngine`] owns the process-wide registry of live distributors
//! and the service boot state. It is created once, booted with
//! [`start`](DistributorEngine::start), shared behind an `Arc`, and stopped
//! with [`shutdown`](DistributorEngine::shutdown).
//!
//! ## Locking
//!
//! - The registry map sits behind one `RwLock`, held only for map access.
//! - Each distributor has its own `Mutex`, so every operation on one load
//!   balancer is serialized while different load balancers proceed
//!   independently. Unplug holds it for the whole teardown.
//! - An unplugged distributor stays in the registry until its bridge is
//!   gone and is marked retired first; whoever locks a retired handle
//!   reports the load balancer as not found.
//! - Distributor creation is serialized by a dedicated lock so two plug
//!   requests for one load balancer never build two bridges.
//! - Rebuilding a distributor from metadata on a registry miss is
//!   serialized by a second lock, so a rebuild never races the teardown of
//!   the entry it would replace.
//!
//! ## Recovery
//!
//! A registry miss falls back to scanning bridge `external_ids` for a
//! matching `dist-lb-id`. The switch metadata is the cross-process source of
//! truth; the registry is only a cache of it.
//!
//! ## Failure Handling
//!
//! The only retry performed here is the single delayed re-read of an empty
//! OpenFlow port during VIP plug. Every other forwarding-plane failure is
//! classified and returned. Slot bookkeeping always errs towards reporting
//! less capacity: a slot goes back to the free set only when its group is
//! known to drop.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::Instrument;

use fleetlb_core::observability::distributor_span;
use fleetlb_core::{AmphoraId, DistributorStatus, LoadBalancerId};

use crate::config::DistributorConfig;
use crate::distributor::{Distributor, SlotTable};
use crate::error::{Error, Result, SwitchError, SwitchResult};
use crate::metadata::{self, BridgeMetadata};
use crate::metrics::DistributorMetrics;
use crate::openflow::{FlowKind, FlowSpec, GroupSpec};
use crate::switch::Switch;

/// The only supported cluster algorithm tag.
pub const ACTIVE_ACTIVE_ALGORITHM: &str = "ACTIVE_ACTIVE";

/// Service-wide boot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisionState {
    /// The switch has not been verified yet.
    Booting,
    /// Serving.
    Active,
    /// Serving existing distributors, refusing new ones.
    Full,
    /// Unusable.
    Error,
}

impl ProvisionState {
    /// Returns the persisted name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Booting => "BOOTING",
            Self::Active => "ACTIVE",
            Self::Full => "FULL",
            Self::Error => "ERROR",
        }
    }

    /// Returns true if distributor operations are accepted.
    #[must_use]
    pub const fn is_serving(&self) -> bool {
        matches!(self, Self::Active | Self::Full)
    }
}

/// Boot state with the reason it was entered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootStatus {
    /// Current state.
    pub state: ProvisionState,
    /// Why the state was entered.
    pub reason: Option<String>,
}

/// Request to create a distributor for a load balancer.
#[derive(Debug, Clone)]
pub struct PlugVipRequest {
    /// Load balancer.
    pub lb_id: LoadBalancerId,
    /// VIP.
    pub vip: IpAddr,
    /// MAC of the host interface facing the VIP network.
    pub mac: String,
    /// VIP subnet.
    pub subnet_cidr: String,
    /// VIP subnet gateway.
    pub gateway: Option<IpAddr>,
    /// Cluster algorithm tag.
    pub alg_type: String,
    /// Slot count.
    pub min_size: u32,
}

/// Request to bind an amphora to a slot.
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    /// Load balancer.
    pub lb_id: LoadBalancerId,
    /// VIP the caller believes the distributor serves.
    pub vip: Option<IpAddr>,
    /// Amphora to bind.
    pub amphora_id: AmphoraId,
    /// Amphora MAC on the VIP network.
    pub amphora_mac: String,
    /// Specific slot to bind, if any.
    pub slot: Option<u32>,
}

/// Request to unbind an amphora.
#[derive(Debug, Clone)]
pub struct UnregisterRequest {
    /// Load balancer.
    pub lb_id: LoadBalancerId,
    /// VIP the caller believes the distributor serves.
    pub vip: Option<IpAddr>,
    /// Amphora to unbind.
    pub amphora_id: AmphoraId,
}

/// Identity of a live distributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DistributorInfo {
    /// Load balancer.
    pub lb_id: LoadBalancerId,
    /// Bridge name.
    pub bridge: String,
    /// VIP.
    pub vip: IpAddr,
    /// External interface MAC.
    pub mac: String,
    /// Slot count.
    pub size: u32,
}

impl From<&Distributor> for DistributorInfo {
    fn from(dist: &Distributor) -> Self {
        Self {
            lb_id: dist.lb_id(),
            bridge: dist.bridge().to_string(),
            vip: dist.vip(),
            mac: dist.mac().to_string(),
            size: dist.size(),
        }
    }
}

/// Status of one distributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Load balancer.
    pub lb_id: LoadBalancerId,
    /// Derived status.
    pub status: DistributorStatus,
    /// Slot count.
    pub size: u32,
    /// Bound slots.
    pub registered: usize,
}

impl From<&Distributor> for StatusReport {
    fn from(dist: &Distributor) -> Self {
        Self {
            lb_id: dist.lb_id(),
            status: dist.status(),
            size: dist.size(),
            registered: dist.registered(),
        }
    }
}

type Handle = Arc<Mutex<Distributor>>;

/// The distributor control engine.
pub struct DistributorEngine {
    switch: Arc<dyn Switch>,
    config: DistributorConfig,
    registry: RwLock<HashMap<LoadBalancerId, Handle>>,
    create_lock: Mutex<()>,
    recovery_lock: Mutex<()>,
    boot: RwLock<BootStatus>,
    metrics: DistributorMetrics,
}

impl std::fmt::Debug for DistributorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributorEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DistributorEngine {
    /// Creates an engine in the `BOOTING` state.
    #[must_use]
    pub fn new(switch: Arc<dyn Switch>, config: DistributorConfig) -> Self {
        Self {
            switch,
            config,
            registry: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            recovery_lock: Mutex::new(()),
            boot: RwLock::new(BootStatus {
                state: ProvisionState::Booting,
                reason: None,
            }),
            metrics: DistributorMetrics::new(),
        }
    }

    /// Returns the engine configuration.
    #[must_use]
    pub const fn config(&self) -> &DistributorConfig {
        &self.config
    }

    /// Returns the boot state.
    pub async fn boot_status(&self) -> BootStatus {
        self.boot.read().await.clone()
    }

    /// Returns the number of cached distributors.
    pub async fn distributor_count(&self) -> usize {
        self.registry.read().await.len()
    }

    /// Boots the engine.
    ///
    /// Verifies the switch, recovers every bridge carrying distributor
    /// metadata into the registry, and leaves `BOOTING` exactly once.
    ///
    /// # Errors
    ///
    /// Returns a fatal error if the switch cannot be reached; the engine is
    /// then in `ERROR`.
    pub async fn start(&self) -> Result<BootStatus> {
        if self.boot.read().await.state != ProvisionState::Booting {
            return Err(Error::usage("engine already started"));
        }
        tracing::info!("booting distributor engine");

        let bridges = match self.verify_switch().await {
            Ok(bridges) => bridges,
            Err(e) => {
                self.transition(ProvisionState::Error, Some(e.to_string()))
                    .await;
                return Err(Error::fatal("switch is unreachable", Some(e)));
            }
        };

        let mut recovered = HashMap::new();
        for bridge in bridges {
            match self.recover_bridge(&bridge).await {
                Ok(Some(dist)) => {
                    tracing::info!(%bridge, lb_id = %dist.lb_id(), "recovered distributor");
                    recovered.insert(dist.lb_id(), Arc::new(Mutex::new(dist)));
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(%bridge, error = %e, "skipping unrecoverable bridge"),
            }
        }

        let count = {
            let mut registry = self.registry.write().await;
            registry.extend(recovered);
            registry.len()
        };
        self.metrics.set_distributors(count);

        let status = if count >= self.config.soft_capacity {
            self.transition(
                ProvisionState::Full,
                Some(format!("{count} distributors recovered")),
            )
            .await
        } else {
            self.transition(ProvisionState::Active, None).await
        };
        Ok(status)
    }

    /// Persists state and drops the registry. Bridges are left in place.
    pub async fn shutdown(&self) {
        let handles: Vec<Handle> = {
            let mut registry = self.registry.write().await;
            registry.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let dist = handle.lock().await;
            if !dist.is_retired() {
                self.persist_status(&dist).await;
            }
        }
        self.metrics.set_distributors(0);
        let boot = self.boot_status().await;
        self.persist_boot(&boot).await;
        tracing::info!(state = boot.state.as_str(), "distributor engine shut down");
    }

    /// Creates the distributor of a load balancer.
    ///
    /// Idempotent: an existing distributor, cached or recovered, is returned
    /// unchanged.
    ///
    /// # Errors
    ///
    /// - Usage: unknown algorithm, zero size, no interface with the MAC
    /// - Limit: size over the hard maximum, too many distributors, or `FULL`
    /// - Instance: building the bridge failed; the bridge was removed
    /// - Fatal: the bridge could not even be created; the engine is `ERROR`
    pub async fn post_plug_vip(&self, request: PlugVipRequest) -> Result<DistributorInfo> {
        let span = distributor_span("post_plug_vip", &request.lb_id.to_string());
        self.observe("post_plug_vip", self.plug_vip(request))
            .instrument(span)
            .await
    }

    /// Binds an amphora to a slot and returns the slot.
    ///
    /// Registering an already bound amphora returns its slot.
    ///
    /// # Errors
    ///
    /// - Usage: unknown load balancer, slot not free, no slot left
    /// - Instance: the distributor is failed, or programming the slot failed
    pub async fn register_amphora(&self, request: RegisterRequest) -> Result<u32> {
        let span = distributor_span("register_amphora", &request.lb_id.to_string());
        self.observe("register_amphora", self.register(request))
            .instrument(span)
            .await
    }

    /// Unbinds an amphora and returns the slot it held.
    ///
    /// # Errors
    ///
    /// - Usage: unknown load balancer or amphora
    /// - Instance: the distributor is failed, or reprogramming the slot failed
    pub async fn unregister_amphora(&self, request: UnregisterRequest) -> Result<u32> {
        let span = distributor_span("unregister_amphora", &request.lb_id.to_string());
        self.observe("unregister_amphora", self.unregister(request))
            .instrument(span)
            .await
    }

    /// Deletes the distributor of a load balancer.
    ///
    /// # Errors
    ///
    /// - Usage: unknown load balancer
    /// - Instance: the bridge could not be deleted
    pub async fn pre_unplug_vip(&self, lb_id: LoadBalancerId, vip: Option<IpAddr>) -> Result<()> {
        let span = distributor_span("pre_unplug_vip", &lb_id.to_string());
        self.observe("pre_unplug_vip", self.unplug_vip(lb_id, vip))
            .instrument(span)
            .await
    }

    /// Reports status for one load balancer, or for every distributor.
    ///
    /// # Errors
    ///
    /// Returns a usage error for an unknown load balancer, or a fatal error
    /// if the switch cannot be scanned.
    pub async fn get_status(&self, lb_id: Option<LoadBalancerId>) -> Result<Vec<StatusReport>> {
        if let Some(lb_id) = lb_id {
            let dist = self.acquire(lb_id).await?;
            return Ok(vec![StatusReport::from(&*dist)]);
        }

        let handles: Vec<(LoadBalancerId, Handle)> = {
            let registry = self.registry.read().await;
            registry.iter().map(|(id, h)| (*id, Arc::clone(h))).collect()
        };
        let mut reports = BTreeMap::new();
        for (id, handle) in handles {
            let dist = handle.lock().await;
            if !dist.is_retired() {
                reports.insert(id, StatusReport::from(&*dist));
            }
        }

        let bridges = self
            .switch
            .list_bridges()
            .await
            .map_err(|e| Error::fatal("listing bridges failed", Some(e)))?;
        for bridge in bridges {
            match self.recover_bridge(&bridge).await {
                Ok(Some(dist)) if !reports.contains_key(&dist.lb_id()) => {
                    reports.insert(dist.lb_id(), StatusReport::from(&dist));
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(%bridge, error = %e, "skipping unreadable bridge"),
            }
        }
        Ok(reports.into_values().collect())
    }

    /// Exports the slot table of a distributor.
    ///
    /// # Errors
    ///
    /// Returns a usage error for an unknown load balancer.
    pub async fn dump_state(&self, lb_id: LoadBalancerId) -> Result<SlotTable> {
        let dist = self.acquire(lb_id).await?;
        Ok(dist.dump())
    }

    /// Imports a slot table exported from another distributor.
    ///
    /// # Errors
    ///
    /// - Usage: the table does not list exactly the free slots; nothing is
    ///   applied
    /// - Instance: the distributor is failed, or programming failed
    pub async fn load_state(&self, lb_id: LoadBalancerId, table: SlotTable) -> Result<()> {
        let span = distributor_span("load_state", &lb_id.to_string());
        self.observe("load_state", self.load(lb_id, table))
            .instrument(span)
            .await
    }

    async fn observe<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let result = fut.await;
        match &result {
            Ok(_) => self.metrics.record_success(operation),
            Err(e) => {
                self.metrics.record_failure(operation, e.kind());
                tracing::warn!(operation, kind = e.kind().as_str(), error = %e, "distributor operation failed");
            }
        }
        result
    }

    async fn plug_vip(&self, req: PlugVipRequest) -> Result<DistributorInfo> {
        self.ensure_serving().await?;
        if req.alg_type != ACTIVE_ACTIVE_ALGORITHM {
            return Err(Error::usage(format!(
                "unsupported cluster algorithm '{}'",
                req.alg_type
            )));
        }
        if req.min_size == 0 {
            return Err(Error::usage("cluster size must be at least 1"));
        }

        let _create = self.create_lock.lock().await;
        match self.acquire(req.lb_id).await {
            Ok(dist) => {
                tracing::info!(bridge = dist.bridge(), "distributor already exists");
                return Ok(DistributorInfo::from(&*dist));
            }
            Err(Error::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        if req.min_size > self.config.max_cluster_size {
            return Err(Error::limit(format!(
                "cluster size {} exceeds maximum {}",
                req.min_size, self.config.max_cluster_size
            )));
        }

        let count = self.registry.read().await.len();
        if count >= self.config.max_distributors {
            return Err(Error::limit(format!(
                "{count} distributors already exist (maximum {})",
                self.config.max_distributors
            )));
        }
        if self.boot.read().await.state == ProvisionState::Full {
            return Err(Error::limit("engine is FULL"));
        }

        let iface = match self.switch.find_interface_by_mac(&req.mac).await {
            Ok(Some(iface)) => iface,
            Ok(None) => {
                return Err(Error::usage(format!("no interface has MAC {}", req.mac)));
            }
            Err(e) => return Err(Error::fatal("interface lookup failed", Some(e))),
        };

        let mut dist = Distributor::new(req.lb_id, req.vip, req.mac, req.min_size);
        dist.set_iface(iface.clone());
        let bridge = dist.bridge().to_string();

        if let Err(e) = self
            .switch
            .add_bridge(&bridge, &self.config.openflow_protocol)
            .await
        {
            self.transition(
                ProvisionState::Error,
                Some(format!("creating bridge {bridge} failed: {e}")),
            )
            .await;
            return Err(Error::fatal(format!("creating bridge {bridge} failed"), Some(e)));
        }

        if let Err(e) = self.build_bridge(&mut dist, &iface).await {
            if let Err(cleanup) = self.switch.delete_bridge(&bridge).await {
                tracing::error!(%bridge, error = %cleanup, "removing partial bridge failed");
            }
            return Err(Error::instance(
                req.lb_id,
                format!("building bridge {bridge} failed"),
                Some(e),
            ));
        }

        tracing::info!(
            %bridge,
            vip = %dist.vip(),
            size = dist.size(),
            subnet = %req.subnet_cidr,
            "distributor created"
        );
        let info = DistributorInfo::from(&dist);
        let count = {
            let mut registry = self.registry.write().await;
            registry.insert(req.lb_id, Arc::new(Mutex::new(dist)));
            registry.len()
        };
        self.metrics.set_distributors(count);
        self.metrics.set_registered_slots(&req.lb_id.to_string(), 0);
        if count >= self.config.soft_capacity {
            self.transition(
                ProvisionState::Full,
                Some(format!("{count} distributors in use")),
            )
            .await;
        }
        Ok(info)
    }

    async fn build_bridge(&self, dist: &mut Distributor, iface: &str) -> SwitchResult<()> {
        let bridge = dist.bridge().to_string();
        self.switch
            .set_bridge_external_ids(&bridge, &dist.metadata().encode())
            .await?;
        self.switch.add_port(&bridge, iface).await?;

        let ofport = match self.switch.get_ofport(&bridge, iface).await? {
            Some(ofport) => ofport,
            None => {
                tracing::debug!(iface, "OpenFlow port not assigned yet, retrying once");
                tokio::time::sleep(self.config.port_read_retry_delay).await;
                self.switch
                    .get_ofport(&bridge, iface)
                    .await?
                    .ok_or_else(|| {
                        SwitchError::new(
                            "ovs-vsctl get Interface ofport",
                            format!("no OpenFlow port assigned to {iface}"),
                        )
                    })?
            }
        };
        dist.set_ofport(ofport);

        for slot in 0..dist.size() {
            self.switch
                .add_group(&bridge, &GroupSpec::drop_slot(slot))
                .await?;
        }
        let select = GroupSpec::hash_select(
            dist.hash_fields().to_vec(),
            Distributor::hash_seed(&dist.vip()),
            dist.size(),
        );
        self.switch.add_group(&bridge, &select).await?;

        self.switch.delete_flows(&bridge).await?;
        let flows = [
            FlowSpec {
                kind: FlowKind::DropAll,
            },
            FlowSpec::neighbor_responder(dist.vip(), dist.mac()),
            FlowSpec {
                kind: FlowKind::VipToGroup {
                    vip: dist.vip(),
                    in_port: ofport,
                },
            },
        ];
        for flow in &flows {
            self.switch.add_flow(&bridge, flow).await?;
        }

        self.switch.set_link(iface, true).await?;
        self.switch
            .set_bridge_external_ids(&bridge, &dist.metadata().encode())
            .await
    }

    async fn register(&self, req: RegisterRequest) -> Result<u32> {
        self.ensure_serving().await?;
        let mut dist = self.acquire(req.lb_id).await?;
        if dist.is_failed() {
            return Err(Error::instance(
                req.lb_id,
                "distributor is in ERROR state",
                None,
            ));
        }
        check_vip(&dist, req.vip);

        if let Some(existing) = dist.destinations().get(&req.amphora_id) {
            return match req.slot {
                Some(slot) if slot != existing.slot => Err(Error::usage(format!(
                    "amphora {} is already bound to slot {}",
                    req.amphora_id, existing.slot
                ))),
                _ => Ok(existing.slot),
            };
        }

        let slot = dist.reserve_slot(req.slot)?;
        let group = GroupSpec::forward_slot(slot, dist.mac(), &req.amphora_mac);
        if let Err(e) = self.switch.modify_group(dist.bridge(), &group).await {
            dist.release_slot(slot);
            dist.mark_failed();
            self.persist_status(&dist).await;
            return Err(Error::instance(
                req.lb_id,
                format!("programming slot {slot} failed"),
                Some(e),
            ));
        }
        dist.bind(req.amphora_id, slot, req.amphora_mac.clone());

        let ids = BTreeMap::from([
            (
                metadata::slot_key(slot),
                metadata::slot_value(req.amphora_id, &req.amphora_mac),
            ),
            (metadata::STATUS.to_string(), dist.status().to_string()),
        ]);
        if let Err(e) = self.switch.set_bridge_external_ids(dist.bridge(), &ids).await {
            dist.mark_failed();
            return Err(Error::instance(
                req.lb_id,
                format!("persisting slot {slot} failed"),
                Some(e),
            ));
        }

        tracing::info!(amphora_id = %req.amphora_id, slot, status = %dist.status(), "amphora registered");
        self.metrics
            .set_registered_slots(&req.lb_id.to_string(), dist.registered());
        Ok(slot)
    }

    async fn unregister(&self, req: UnregisterRequest) -> Result<u32> {
        self.ensure_serving().await?;
        let mut dist = self.acquire(req.lb_id).await?;
        if dist.is_failed() {
            return Err(Error::instance(
                req.lb_id,
                "distributor is in ERROR state",
                None,
            ));
        }
        check_vip(&dist, req.vip);

        let Some(dest) = dist.destinations().get(&req.amphora_id).cloned() else {
            return Err(Error::usage(format!(
                "amphora {} is not registered",
                req.amphora_id
            )));
        };

        let key = metadata::slot_key(dest.slot);
        if let Err(e) = self
            .switch
            .remove_bridge_external_id(dist.bridge(), &key)
            .await
        {
            return Err(Error::instance(
                req.lb_id,
                format!("removing {key} failed"),
                Some(e),
            ));
        }

        dist.unbind(req.amphora_id);
        if let Err(e) = self
            .switch
            .modify_group(dist.bridge(), &GroupSpec::drop_slot(dest.slot))
            .await
        {
            // The group state is unknown: keep the slot bound and re-persist it.
            dist.bind(req.amphora_id, dest.slot, dest.mac.clone());
            dist.mark_failed();
            let ids = BTreeMap::from([
                (key, metadata::slot_value(req.amphora_id, &dest.mac)),
                (metadata::STATUS.to_string(), dist.status().to_string()),
            ]);
            if let Err(persist) = self.switch.set_bridge_external_ids(dist.bridge(), &ids).await {
                tracing::error!(error = %persist, "restoring slot metadata failed");
            }
            return Err(Error::instance(
                req.lb_id,
                format!("resetting slot {} failed", dest.slot),
                Some(e),
            ));
        }
        dist.release_slot(dest.slot);
        self.persist_status(&dist).await;

        tracing::info!(amphora_id = %req.amphora_id, slot = dest.slot, status = %dist.status(), "amphora unregistered");
        self.metrics
            .set_registered_slots(&req.lb_id.to_string(), dist.registered());
        Ok(dest.slot)
    }

    async fn unplug_vip(&self, lb_id: LoadBalancerId, vip: Option<IpAddr>) -> Result<()> {
        self.ensure_serving().await?;
        let mut dist = self.acquire(lb_id).await?;
        check_vip(&dist, vip);

        if let Some(iface) = dist.iface() {
            if let Err(e) = self.switch.set_link(iface, false).await {
                tracing::warn!(iface, error = %e, "bringing interface down failed");
            }
        }
        self.switch
            .delete_bridge(dist.bridge())
            .await
            .map_err(|e| Error::instance(lb_id, "deleting bridge failed", Some(e)))?;
        dist.retire();

        let count = {
            let mut registry = self.registry.write().await;
            registry.remove(&lb_id);
            registry.len()
        };
        self.metrics.set_distributors(count);
        self.metrics.set_registered_slots(&lb_id.to_string(), 0);
        tracing::info!(bridge = dist.bridge(), "distributor deleted");
        drop(dist);

        if self.boot.read().await.state == ProvisionState::Full
            && count < self.config.soft_capacity
        {
            self.transition(ProvisionState::Active, None).await;
        }
        Ok(())
    }

    async fn load(&self, lb_id: LoadBalancerId, table: SlotTable) -> Result<()> {
        self.ensure_serving().await?;
        let mut dist = self.acquire(lb_id).await?;
        if dist.is_failed() {
            return Err(Error::instance(lb_id, "distributor is in ERROR state", None));
        }
        dist.check_table(&table)?;

        for (slot, binding) in table.bindings() {
            dist.reserve_slot(Some(slot))?;
            let group = GroupSpec::forward_slot(slot, dist.mac(), &binding.mac);
            if let Err(e) = self.switch.modify_group(dist.bridge(), &group).await {
                dist.release_slot(slot);
                dist.mark_failed();
                self.persist_status(&dist).await;
                return Err(Error::instance(
                    lb_id,
                    format!("programming slot {slot} failed"),
                    Some(e),
                ));
            }
            dist.bind(binding.amphora_id, slot, binding.mac.clone());
        }

        if let Err(e) = self
            .switch
            .set_bridge_external_ids(dist.bridge(), &dist.metadata().encode())
            .await
        {
            dist.mark_failed();
            return Err(Error::instance(lb_id, "persisting slot table failed", Some(e)));
        }
        self.metrics
            .set_registered_slots(&lb_id.to_string(), dist.registered());
        Ok(())
    }

    async fn ensure_serving(&self) -> Result<()> {
        let boot = self.boot.read().await;
        if boot.state.is_serving() {
            Ok(())
        } else {
            Err(Error::fatal(
                format!("engine is {}", boot.state.as_str()),
                None,
            ))
        }
    }

    async fn verify_switch(&self) -> SwitchResult<Vec<String>> {
        self.switch.ping().await?;
        self.switch.list_bridges().await
    }

    /// Locks the live distributor of `lb_id`.
    async fn acquire(&self, lb_id: LoadBalancerId) -> Result<OwnedMutexGuard<Distributor>> {
        let dist = self.lookup(lb_id).await?.lock_owned().await;
        if dist.is_retired() {
            return Err(Error::NotFound { lb_id });
        }
        Ok(dist)
    }

    /// Returns the cached distributor, recovering it from metadata on a miss.
    async fn lookup(&self, lb_id: LoadBalancerId) -> Result<Handle> {
        if let Some(handle) = self.registry.read().await.get(&lb_id) {
            return Ok(Arc::clone(handle));
        }

        let _recovery = self.recovery_lock.lock().await;
        if let Some(handle) = self.registry.read().await.get(&lb_id) {
            return Ok(Arc::clone(handle));
        }

        let Some(dist) = self.recover(lb_id).await? else {
            return Err(Error::NotFound { lb_id });
        };
        tracing::info!(bridge = dist.bridge(), %lb_id, "recovered distributor from metadata");
        let (handle, count) = {
            let mut registry = self.registry.write().await;
            let handle = Arc::clone(
                registry
                    .entry(lb_id)
                    .or_insert_with(|| Arc::new(Mutex::new(dist))),
            );
            (handle, registry.len())
        };
        self.metrics.set_distributors(count);
        Ok(handle)
    }

    async fn recover(&self, lb_id: LoadBalancerId) -> Result<Option<Distributor>> {
        let mut bridges = self
            .switch
            .list_bridges()
            .await
            .map_err(|e| Error::fatal("listing bridges failed", Some(e)))?;
        let preferred = Distributor::bridge_name(lb_id);
        bridges.sort_by_key(|b| *b != preferred);

        for bridge in bridges {
            match self.recover_bridge(&bridge).await {
                Ok(Some(dist)) if dist.lb_id() == lb_id => return Ok(Some(dist)),
                Ok(_) => {}
                Err(e) => tracing::warn!(%bridge, error = %e, "skipping unreadable bridge"),
            }
        }
        Ok(None)
    }

    async fn recover_bridge(&self, bridge: &str) -> Result<Option<Distributor>> {
        let ids = self
            .switch
            .bridge_external_ids(bridge)
            .await
            .map_err(|e| Error::fatal(format!("reading bridge {bridge} failed"), Some(e)))?;
        let meta = BridgeMetadata::decode(&ids).map_err(|message| Error::CorruptMetadata {
            bridge: bridge.to_string(),
            message,
        })?;
        let Some(meta) = meta else {
            return Ok(None);
        };
        let mut dist = Distributor::from_metadata(bridge, meta);
        match self.switch.find_interface_by_mac(dist.mac()).await {
            Ok(Some(iface)) => dist.set_iface(iface),
            Ok(None) => tracing::warn!(bridge, mac = dist.mac(), "external interface not found"),
            Err(e) => tracing::warn!(bridge, error = %e, "interface lookup failed"),
        }
        Ok(Some(dist))
    }

    async fn persist_status(&self, dist: &Distributor) {
        let ids = BTreeMap::from([(metadata::STATUS.to_string(), dist.status().to_string())]);
        if let Err(e) = self.switch.set_bridge_external_ids(dist.bridge(), &ids).await {
            tracing::warn!(bridge = dist.bridge(), error = %e, "persisting distributor status failed");
        }
    }

    async fn transition(&self, state: ProvisionState, reason: Option<String>) -> BootStatus {
        let boot = {
            let mut boot = self.boot.write().await;
            if boot.state != state {
                tracing::info!(from = boot.state.as_str(), to = state.as_str(), reason = reason.as_deref(), "engine state changed");
            }
            *boot = BootStatus { state, reason };
            boot.clone()
        };
        self.persist_boot(&boot).await;
        boot
    }

    async fn persist_boot(&self, boot: &BootStatus) {
        let ids = BTreeMap::from([
            (metadata::ROOT_STATE.to_string(), boot.state.as_str().to_string()),
            (
                metadata::ROOT_STATE_REASON.to_string(),
                boot.reason.clone().unwrap_or_default(),
            ),
        ]);
        if let Err(e) = self.switch.set_root_external_ids(&ids).await {
            tracing::warn!(error = %e, "persisting engine state failed");
        }
    }
}

/// Logs a VIP mismatch; the load balancer id is authoritative.
fn check_vip(dist: &Distributor, vip: Option<IpAddr>) {
    if let Some(vip) = vip {
        if vip != dist.vip() {
            tracing::warn!(
                requested = %vip,
                actual = %dist.vip(),
                "request VIP does not match distributor VIP"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemorySwitch, SwitchOp};
    use crate::openflow::{slot_group_id, GroupKind};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    const EXT_MAC: &str = "02:00:00:00:00:aa";

    struct Harness {
        switch: Arc<MemorySwitch>,
        engine: DistributorEngine,
    }

    async fn harness_with(config: DistributorConfig) -> Harness {
        let switch = Arc::new(MemorySwitch::new());
        switch.add_interface("eth1", EXT_MAC);
        let engine = DistributorEngine::new(switch.clone(), config);
        engine.start().await.unwrap();
        Harness { switch, engine }
    }

    async fn harness() -> Harness {
        harness_with(DistributorConfig {
            port_read_retry_delay: Duration::from_millis(1),
            ..DistributorConfig::default()
        })
        .await
    }

    fn plug(lb_id: LoadBalancerId, size: u32) -> PlugVipRequest {
        PlugVipRequest {
            lb_id,
            vip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)),
            mac: EXT_MAC.to_string(),
            subnet_cidr: "203.0.113.0/24".to_string(),
            gateway: None,
            alg_type: ACTIVE_ACTIVE_ALGORITHM.to_string(),
            min_size: size,
        }
    }

    fn register(lb_id: LoadBalancerId, slot: Option<u32>) -> RegisterRequest {
        RegisterRequest {
            lb_id,
            vip: None,
            amphora_id: AmphoraId::generate(),
            amphora_mac: "02:00:00:00:01:01".to_string(),
            slot,
        }
    }

    async fn snapshot(engine: &DistributorEngine, lb_id: LoadBalancerId) -> Distributor {
        let handle = engine.lookup(lb_id).await.unwrap();
        let dist = handle.lock().await;
        dist.clone()
    }

    #[tokio::test]
    async fn boot_persists_active_state() {
        let h = harness().await;
        assert_eq!(h.engine.boot_status().await.state, ProvisionState::Active);
        let root = h.switch.root_external_ids().await.unwrap();
        assert_eq!(root[metadata::ROOT_STATE], "ACTIVE");
        assert!(h.engine.start().await.is_err());
    }

    #[tokio::test]
    async fn unreachable_switch_fails_boot() {
        let switch = Arc::new(MemorySwitch::new());
        switch.fail(SwitchOp::Ping);
        let engine = DistributorEngine::new(switch, DistributorConfig::default());
        let err = engine.start().await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Fatal);
        assert_eq!(engine.boot_status().await.state, ProvisionState::Error);
    }

    #[tokio::test]
    async fn plug_creates_bridge_with_free_slots() {
        let h = harness().await;
        let lb_id = LoadBalancerId::generate();
        let info = h.engine.post_plug_vip(plug(lb_id, 4)).await.unwrap();

        let dist = snapshot(&h.engine, lb_id).await;
        assert_eq!(dist.free_slots().len(), 4);
        assert!(dist.destinations().is_empty());
        assert_eq!(dist.status(), DistributorStatus::NoMonitor);
        assert_eq!(h.switch.protocol(&info.bridge).as_deref(), Some("OpenFlow15"));
        assert_eq!(h.switch.flows(&info.bridge).len(), 3);
        assert!(h.switch.link_is_up("eth1"));
        for slot in 0..4 {
            let group = h.switch.group(&info.bridge, slot_group_id(slot)).unwrap();
            assert_eq!(group.kind, GroupKind::Drop);
        }
    }

    #[tokio::test]
    async fn plug_is_idempotent() {
        let h = harness().await;
        let lb_id = LoadBalancerId::generate();
        let first = h.engine.post_plug_vip(plug(lb_id, 2)).await.unwrap();
        let second = h.engine.post_plug_vip(plug(lb_id, 2)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.switch.bridges_created(), 1);
    }

    #[tokio::test]
    async fn repeat_plug_returns_existing_before_size_checks() {
        let h = harness().await;
        let lb_id = LoadBalancerId::generate();
        let first = h.engine.post_plug_vip(plug(lb_id, 2)).await.unwrap();
        let repeat = h.engine.post_plug_vip(plug(lb_id, 513)).await.unwrap();
        assert_eq!(first, repeat);
        assert_eq!(repeat.size, 2);
    }

    #[tokio::test]
    async fn plug_rejects_unknown_algorithm_and_oversize() {
        let h = harness().await;
        let mut bad = plug(LoadBalancerId::generate(), 2);
        bad.alg_type = "ROUND_ROBIN".to_string();
        assert_eq!(h.engine.post_plug_vip(bad).await.unwrap_err().kind(), crate::ErrorKind::Usage);

        let oversize = plug(LoadBalancerId::generate(), 513);
        assert_eq!(
            h.engine.post_plug_vip(oversize).await.unwrap_err().kind(),
            crate::ErrorKind::Limit
        );
        assert_eq!(h.engine.distributor_count().await, 0);
    }

    #[tokio::test]
    async fn distributor_limit_leaves_registry_untouched() {
        let h = harness_with(DistributorConfig {
            max_distributors: 1,
            soft_capacity: 1,
            ..DistributorConfig::default()
        })
        .await;
        h.engine
            .post_plug_vip(plug(LoadBalancerId::generate(), 2))
            .await
            .unwrap();
        assert_eq!(h.engine.boot_status().await.state, ProvisionState::Full);
        let err = h
            .engine
            .post_plug_vip(plug(LoadBalancerId::generate(), 2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Limit);
        assert_eq!(h.engine.distributor_count().await, 1);
    }

    #[tokio::test]
    async fn bridge_creation_failure_is_fatal() {
        let h = harness().await;
        h.switch.fail(SwitchOp::AddBridge);
        let err = h
            .engine
            .post_plug_vip(plug(LoadBalancerId::generate(), 2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Fatal);
        assert_eq!(h.engine.boot_status().await.state, ProvisionState::Error);
    }

    #[tokio::test]
    async fn partial_bridge_is_removed() {
        let h = harness().await;
        h.switch.fail(SwitchOp::AddFlow);
        let err = h
            .engine
            .post_plug_vip(plug(LoadBalancerId::generate(), 2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Instance);
        assert!(h.switch.bridge_names().is_empty());
        assert_eq!(h.engine.distributor_count().await, 0);
    }

    #[tokio::test]
    async fn empty_ofport_is_retried_once() {
        let h = harness().await;
        h.switch.delay_ofport(1);
        h.engine
            .post_plug_vip(plug(LoadBalancerId::generate(), 2))
            .await
            .unwrap();

        h.switch.delay_ofport(2);
        let err = h
            .engine
            .post_plug_vip(plug(LoadBalancerId::generate(), 2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Instance);
    }

    #[tokio::test]
    async fn register_walks_status_to_online() {
        let h = harness().await;
        let lb_id = LoadBalancerId::generate();
        let info = h.engine.post_plug_vip(plug(lb_id, 2)).await.unwrap();

        let first = register(lb_id, None);
        let slot = h.engine.register_amphora(first.clone()).await.unwrap();
        let report = h.engine.get_status(Some(lb_id)).await.unwrap();
        assert_eq!(report[0].status, DistributorStatus::Degraded);

        let group = h.switch.group(&info.bridge, slot_group_id(slot)).unwrap();
        assert_eq!(
            group.kind,
            GroupKind::Forward {
                src_mac: EXT_MAC.to_string(),
                dst_mac: first.amphora_mac.clone(),
            }
        );

        h.engine.register_amphora(register(lb_id, None)).await.unwrap();
        let report = h.engine.get_status(Some(lb_id)).await.unwrap();
        assert_eq!(report[0].status, DistributorStatus::Online);
        assert_eq!(report[0].registered, 2);

        let err = h.engine.register_amphora(register(lb_id, None)).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Usage);
    }

    #[tokio::test]
    async fn register_same_amphora_returns_its_slot() {
        let h = harness().await;
        let lb_id = LoadBalancerId::generate();
        h.engine.post_plug_vip(plug(lb_id, 3)).await.unwrap();
        let req = register(lb_id, Some(2));
        assert_eq!(h.engine.register_amphora(req.clone()).await.unwrap(), 2);
        assert_eq!(h.engine.register_amphora(req).await.unwrap(), 2);
        assert_eq!(snapshot(&h.engine, lb_id).await.registered(), 1);
    }

    #[tokio::test]
    async fn group_failure_returns_slot_and_fails_distributor() {
        let h = harness().await;
        let lb_id = LoadBalancerId::generate();
        h.engine.post_plug_vip(plug(lb_id, 2)).await.unwrap();
        h.switch.fail(SwitchOp::ModifyGroup);

        let err = h.engine.register_amphora(register(lb_id, None)).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Instance);
        let dist = snapshot(&h.engine, lb_id).await;
        assert!(dist.is_failed());
        assert_eq!(dist.free_slots().len(), 2);
        assert!(dist.is_consistent());

        h.switch.heal(SwitchOp::ModifyGroup);
        let before = snapshot(&h.engine, lb_id).await;
        let err = h.engine.register_amphora(register(lb_id, None)).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Instance);
        let after = snapshot(&h.engine, lb_id).await;
        assert_eq!(before.destinations(), after.destinations());
        assert_eq!(before.free_slots(), after.free_slots());
    }

    #[tokio::test]
    async fn unregister_restores_free_slots() {
        let h = harness().await;
        let lb_id = LoadBalancerId::generate();
        let info = h.engine.post_plug_vip(plug(lb_id, 3)).await.unwrap();
        let before = snapshot(&h.engine, lb_id).await.free_slots().clone();

        let req = register(lb_id, None);
        let slot = h.engine.register_amphora(req.clone()).await.unwrap();
        let released = h
            .engine
            .unregister_amphora(UnregisterRequest {
                lb_id,
                vip: None,
                amphora_id: req.amphora_id,
            })
            .await
            .unwrap();
        assert_eq!(released, slot);
        assert_eq!(snapshot(&h.engine, lb_id).await.free_slots(), &before);
        let ids = h.switch.bridge_external_ids(&info.bridge).await.unwrap();
        assert!(!ids.contains_key(&metadata::slot_key(slot)));
    }

    #[tokio::test]
    async fn unregister_group_failure_keeps_binding() {
        let h = harness().await;
        let lb_id = LoadBalancerId::generate();
        let info = h.engine.post_plug_vip(plug(lb_id, 2)).await.unwrap();
        let req = register(lb_id, None);
        let slot = h.engine.register_amphora(req.clone()).await.unwrap();

        h.switch.fail(SwitchOp::ModifyGroup);
        let err = h
            .engine
            .unregister_amphora(UnregisterRequest {
                lb_id,
                vip: None,
                amphora_id: req.amphora_id,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Instance);
        let dist = snapshot(&h.engine, lb_id).await;
        assert!(dist.is_failed());
        assert_eq!(dist.destinations()[&req.amphora_id].slot, slot);
        assert!(dist.is_consistent());
        let ids = h.switch.bridge_external_ids(&info.bridge).await.unwrap();
        assert!(ids.contains_key(&metadata::slot_key(slot)));
        assert_eq!(ids[metadata::STATUS], "ERROR");
    }

    #[tokio::test]
    async fn metadata_removal_failure_changes_nothing() {
        let h = harness().await;
        let lb_id = LoadBalancerId::generate();
        h.engine.post_plug_vip(plug(lb_id, 2)).await.unwrap();
        let req = register(lb_id, None);
        h.engine.register_amphora(req.clone()).await.unwrap();

        h.switch.fail(SwitchOp::RemoveBridgeExternalId);
        let err = h
            .engine
            .unregister_amphora(UnregisterRequest {
                lb_id,
                vip: None,
                amphora_id: req.amphora_id,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Instance);
        let dist = snapshot(&h.engine, lb_id).await;
        assert!(!dist.is_failed());
        assert_eq!(dist.registered(), 1);
    }

    #[tokio::test]
    async fn second_engine_recovers_from_metadata() {
        let h = harness().await;
        let lb_id = LoadBalancerId::generate();
        h.engine.post_plug_vip(plug(lb_id, 3)).await.unwrap();
        h.engine.register_amphora(register(lb_id, Some(1))).await.unwrap();
        let original = snapshot(&h.engine, lb_id).await;

        let other = DistributorEngine::new(h.switch.clone(), DistributorConfig::default());
        other.start().await.unwrap();
        let recovered = snapshot(&other, lb_id).await;
        assert_eq!(recovered.destinations(), original.destinations());
        assert_eq!(recovered.free_slots(), original.free_slots());
        assert_eq!(recovered.iface(), Some("eth1"));
    }

    #[tokio::test]
    async fn cache_miss_recovers_after_shutdown() {
        let h = harness().await;
        let lb_id = LoadBalancerId::generate();
        h.engine.post_plug_vip(plug(lb_id, 2)).await.unwrap();
        h.engine.shutdown().await;
        assert_eq!(h.engine.distributor_count().await, 0);
        let report = h.engine.get_status(Some(lb_id)).await.unwrap();
        assert_eq!(report[0].size, 2);
        assert_eq!(h.engine.distributor_count().await, 1);
    }

    #[tokio::test]
    async fn unplug_deletes_bridge_and_registry_entry() {
        let h = harness().await;
        let lb_id = LoadBalancerId::generate();
        h.engine.post_plug_vip(plug(lb_id, 2)).await.unwrap();
        h.switch.fail(SwitchOp::SetLink);
        h.engine.pre_unplug_vip(lb_id, None).await.unwrap();
        assert!(h.switch.bridge_names().is_empty());
        let err = h.engine.get_status(Some(lb_id)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn status_of_all_includes_uncached_bridges() {
        let h = harness().await;
        let cached = LoadBalancerId::generate();
        h.engine.post_plug_vip(plug(cached, 2)).await.unwrap();

        let other = DistributorEngine::new(h.switch.clone(), DistributorConfig::default());
        other.start().await.unwrap();
        let uncached = LoadBalancerId::generate();
        other.post_plug_vip(plug(uncached, 3)).await.unwrap();

        let reports = h.engine.get_status(None).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().any(|r| r.lb_id == uncached && r.size == 3));
    }

    #[tokio::test]
    async fn dump_then_load_reproduces_destinations() {
        let h = harness().await;
        let source = LoadBalancerId::generate();
        h.engine.post_plug_vip(plug(source, 3)).await.unwrap();
        h.engine.register_amphora(register(source, Some(0))).await.unwrap();
        h.engine.register_amphora(register(source, Some(2))).await.unwrap();
        let table = h.engine.dump_state(source).await.unwrap();

        let target = LoadBalancerId::generate();
        h.engine.post_plug_vip(plug(target, 3)).await.unwrap();
        h.engine.load_state(target, table).await.unwrap();

        let a = snapshot(&h.engine, source).await;
        let b = snapshot(&h.engine, target).await;
        assert_eq!(a.destinations(), b.destinations());
        assert_eq!(a.free_slots(), b.free_slots());
    }

    #[tokio::test]
    async fn load_rejects_mismatched_table_without_mutation() {
        let h = harness().await;
        let source = LoadBalancerId::generate();
        h.engine.post_plug_vip(plug(source, 3)).await.unwrap();
        h.engine.register_amphora(register(source, None)).await.unwrap();
        let table = h.engine.dump_state(source).await.unwrap();

        let target = LoadBalancerId::generate();
        h.engine.post_plug_vip(plug(target, 3)).await.unwrap();
        h.engine.register_amphora(register(target, None)).await.unwrap();
        let before = snapshot(&h.engine, target).await;

        let err = h.engine.load_state(target, table).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Usage);
        let after = snapshot(&h.engine, target).await;
        assert_eq!(before.destinations(), after.destinations());
        assert_eq!(before.free_slots(), after.free_slots());
    }
}
