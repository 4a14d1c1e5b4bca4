//! Distributor capability.
//!
//! [`LocalDistributorDriver`] calls an in-process [`DistributorEngine`];
//! [`NoopDistributorDriver`] only tracks slots in memory.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use fleetlb_core::{AmphoraId, DistributorStatus, LoadBalancerId};
use fleetlb_distributor::{
    DistributorEngine, DistributorInfo, Error as DistributorError, PlugVipRequest,
    RegisterRequest, StatusReport, UnregisterRequest,
};

/// Result of a distributor call; failures keep their kind.
pub type DistributorResult<T> = fleetlb_distributor::Result<T>;

/// Distributor transport.
#[async_trait]
pub trait DistributorDriver: Send + Sync {
    /// Creates (or returns) the distributor of a load balancer.
    async fn post_vip_plug(&self, request: PlugVipRequest) -> DistributorResult<DistributorInfo>;

    /// Deletes the distributor of a load balancer.
    async fn pre_vip_unplug(&self, lb_id: LoadBalancerId, vip: IpAddr) -> DistributorResult<()>;

    /// Binds an amphora to a slot and returns the slot.
    async fn register_amphora(&self, request: RegisterRequest) -> DistributorResult<u32>;

    /// Unbinds an amphora and returns the freed slot.
    async fn unregister_amphora(&self, request: UnregisterRequest) -> DistributorResult<u32>;

    /// Reports the status of one distributor.
    async fn status(&self, lb_id: LoadBalancerId) -> DistributorResult<StatusReport>;
}

/// Driver over an in-process engine.
#[derive(Debug, Clone)]
pub struct LocalDistributorDriver {
    engine: Arc<DistributorEngine>,
}

impl LocalDistributorDriver {
    /// Wraps an engine.
    #[must_use]
    pub const fn new(engine: Arc<DistributorEngine>) -> Self {
        Self { engine }
    }

    /// Returns the engine.
    #[must_use]
    pub const fn engine(&self) -> &Arc<DistributorEngine> {
        &self.engine
    }
}

#[async_trait]
impl DistributorDriver for LocalDistributorDriver {
    async fn post_vip_plug(&self, request: PlugVipRequest) -> DistributorResult<DistributorInfo> {
        self.engine.post_plug_vip(request).await
    }

    async fn pre_vip_unplug(&self, lb_id: LoadBalancerId, vip: IpAddr) -> DistributorResult<()> {
        self.engine.pre_unplug_vip(lb_id, Some(vip)).await
    }

    async fn register_amphora(&self, request: RegisterRequest) -> DistributorResult<u32> {
        self.engine.register_amphora(request).await
    }

    async fn unregister_amphora(&self, request: UnregisterRequest) -> DistributorResult<u32> {
        self.engine.unregister_amphora(request).await
    }

    async fn status(&self, lb_id: LoadBalancerId) -> DistributorResult<StatusReport> {
        self.engine
            .get_status(Some(lb_id))
            .await?
            .pop()
            .ok_or(DistributorError::NotFound { lb_id })
    }
}

#[derive(Debug)]
struct NoopDistributor {
    info: DistributorInfo,
    bindings: BTreeMap<AmphoraId, u32>,
}

/// Driver that tracks distributors and slots in memory.
#[derive(Debug, Default)]
pub struct NoopDistributorDriver {
    distributors: Mutex<BTreeMap<LoadBalancerId, NoopDistributor>>,
}

impl NoopDistributorDriver {
    /// Creates an empty driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<LoadBalancerId, NoopDistributor>> {
        self.distributors
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl DistributorDriver for NoopDistributorDriver {
    async fn post_vip_plug(&self, request: PlugVipRequest) -> DistributorResult<DistributorInfo> {
        let mut distributors = self.lock();
        let entry = distributors
            .entry(request.lb_id)
            .or_insert_with(|| NoopDistributor {
                info: DistributorInfo {
                    lb_id: request.lb_id,
                    bridge: fleetlb_distributor::Distributor::bridge_name(request.lb_id),
                    vip: request.vip,
                    mac: request.mac.clone(),
                    size: request.min_size,
                },
                bindings: BTreeMap::new(),
            });
        Ok(entry.info.clone())
    }

    async fn pre_vip_unplug(&self, lb_id: LoadBalancerId, _vip: IpAddr) -> DistributorResult<()> {
        self.lock()
            .remove(&lb_id)
            .map(|_| ())
            .ok_or(DistributorError::NotFound { lb_id })
    }

    async fn register_amphora(&self, request: RegisterRequest) -> DistributorResult<u32> {
        let mut distributors = self.lock();
        let dist = distributors
            .get_mut(&request.lb_id)
            .ok_or(DistributorError::NotFound {
                lb_id: request.lb_id,
            })?;
        if let Some(slot) = dist.bindings.get(&request.amphora_id) {
            return Ok(*slot);
        }
        let used: BTreeSet<u32> = dist.bindings.values().copied().collect();
        let slot = match request.slot {
            Some(slot) if slot < dist.info.size && !used.contains(&slot) => slot,
            Some(slot) => return Err(DistributorError::usage(format!("slot {slot} is not free"))),
            None => (0..dist.info.size)
                .find(|slot| !used.contains(slot))
                .ok_or_else(|| DistributorError::usage("no free slots"))?,
        };
        dist.bindings.insert(request.amphora_id, slot);
        Ok(slot)
    }

    async fn unregister_amphora(&self, request: UnregisterRequest) -> DistributorResult<u32> {
        let mut distributors = self.lock();
        let dist = distributors
            .get_mut(&request.lb_id)
            .ok_or(DistributorError::NotFound {
                lb_id: request.lb_id,
            })?;
        dist.bindings
            .remove(&request.amphora_id)
            .ok_or_else(|| DistributorError::usage(format!("{} is not registered", request.amphora_id)))
    }

    async fn status(&self, lb_id: LoadBalancerId) -> DistributorResult<StatusReport> {
        let distributors = self.lock();
        let dist = distributors
            .get(&lb_id)
            .ok_or(DistributorError::NotFound { lb_id })?;
        let registered = dist.bindings.len();
        let size = dist.info.size;
        let status = if registered == 0 {
            DistributorStatus::NoMonitor
        } else if u32::try_from(registered).is_ok_and(|n| n == size) {
            DistributorStatus::Online
        } else {
            DistributorStatus::Degraded
        };
        Ok(StatusReport {
            lb_id,
            status,
            size,
            registered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn plug(lb_id: LoadBalancerId, size: u32) -> PlugVipRequest {
        PlugVipRequest {
            lb_id,
            vip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 10)),
            mac: "02:00:00:00:00:aa".into(),
            subnet_cidr: "203.0.113.0/24".into(),
            gateway: None,
            alg_type: fleetlb_distributor::ACTIVE_ACTIVE_ALGORITHM.into(),
            min_size: size,
        }
    }

    fn register(lb_id: LoadBalancerId, slot: Option<u32>) -> RegisterRequest {
        RegisterRequest {
            lb_id,
            vip: None,
            amphora_id: AmphoraId::generate(),
            amphora_mac: "fa:16:3e:00:00:01".into(),
            slot,
        }
    }

    #[tokio::test]
    async fn noop_driver_tracks_slots() {
        let driver = NoopDistributorDriver::new();
        let lb_id = LoadBalancerId::generate();
        driver.post_vip_plug(plug(lb_id, 2)).await.unwrap();
        assert_eq!(driver.register_amphora(register(lb_id, Some(1))).await.unwrap(), 1);
        assert_eq!(driver.register_amphora(register(lb_id, None)).await.unwrap(), 0);
        assert!(driver.register_amphora(register(lb_id, None)).await.is_err());
        let status = driver.status(lb_id).await.unwrap();
        assert_eq!(status.status, DistributorStatus::Online);
        driver.pre_vip_unplug(lb_id, IpAddr::V4(Ipv4Addr::LOCALHOST)).await.unwrap();
        assert!(driver.status(lb_id).await.is_err());
    }
}
