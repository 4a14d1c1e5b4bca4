//! Typed data access for persisted entities.
//!
//! The repository layer is the single shared mutable store of the control
//! plane. It carries no business rules beyond referential bookkeeping: each
//! caller performs its own read-then-write, and consistency comes from
//! idempotent status markers.
//!
//! ## Design Principles
//!
//! - **One trait per shape**: [`Repository`] covers get/create/update/delete
//!   for every entity; [`AmphoraRepository`] adds atomic spare allocation
//! - **Bundled access**: [`Repositories`] hands tasks one handle for every
//!   table
//! - **Testability**: [`memory`] backs every table with an in-memory map

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::id::LoadBalancerId;
use crate::model::{
    Amphora, AmphoraCluster, AmphoraHealth, DistributorRecord, Entity, HealthMonitor,
    L7Policy, L7Rule, Listener, LoadBalancer, Member, Pool, StatusEntity, VrrpGroup,
};
use crate::status::{AmphoraStatus, ProvisioningStatus};

use self::memory::{InMemoryAmphoraRepository, InMemoryRepository};

/// Typed persistence for one entity kind.
#[async_trait]
pub trait Repository<E: Entity>: Send + Sync {
    /// Gets an entity by id. Returns `None` if it does not exist.
    async fn get(&self, id: E::Id) -> Result<Option<E>>;

    /// Inserts a new entity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if the id is already present.
    async fn create(&self, entity: E) -> Result<()>;

    /// Replaces an existing entity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the id is not present.
    async fn update(&self, entity: E) -> Result<()>;

    /// Deletes an entity. Deleting a missing id is not an error.
    async fn delete(&self, id: E::Id) -> Result<()>;

    /// Lists every stored entity.
    async fn list(&self) -> Result<Vec<E>>;

    /// Gets an entity, failing with [`Error::NotFound`] when absent.
    async fn require(&self, id: E::Id) -> Result<E> {
        self.get(id)
            .await?
            .ok_or_else(|| Error::not_found(E::KIND, id))
    }
}

/// Amphora persistence with spare-pool allocation.
#[async_trait]
pub trait AmphoraRepository: Repository<Amphora> {
    /// Atomically claims one spare (`READY`, unbound) amphora for `lb_id`.
    ///
    /// The claimed amphora moves to `ALLOCATED` with its load balancer set.
    /// Returns `None` when the pool is empty.
    async fn allocate_spare(&self, lb_id: LoadBalancerId) -> Result<Option<Amphora>>;

    /// Lists the amphorae bound to `lb_id` that are not deleted.
    async fn for_load_balancer(&self, lb_id: LoadBalancerId) -> Result<Vec<Amphora>>;

    /// Counts spare amphorae.
    async fn spare_count(&self) -> Result<usize>;
}

/// Reads an entity, applies `f`, and writes it back.
///
/// # Errors
///
/// Returns [`Error::NotFound`] if the entity does not exist, or the
/// repository's error if the write fails.
pub async fn update_with<E, R, F>(repo: &R, id: E::Id, f: F) -> Result<E>
where
    E: Entity,
    R: Repository<E> + ?Sized,
    F: FnOnce(&mut E) + Send,
{
    let mut entity = repo.require(id).await?;
    f(&mut entity);
    repo.update(entity.clone()).await?;
    Ok(entity)
}

/// Handles to every repository used by the control plane.
#[derive(Clone)]
pub struct Repositories {
    /// Amphorae.
    pub amphorae: Arc<dyn AmphoraRepository>,
    /// Load balancers.
    pub load_balancers: Arc<dyn Repository<LoadBalancer>>,
    /// Listeners.
    pub listeners: Arc<dyn Repository<Listener>>,
    /// Pools.
    pub pools: Arc<dyn Repository<Pool>>,
    /// Members.
    pub members: Arc<dyn Repository<Member>>,
    /// Health monitors.
    pub health_monitors: Arc<dyn Repository<HealthMonitor>>,
    /// L7 policies.
    pub l7policies: Arc<dyn Repository<L7Policy>>,
    /// L7 rules.
    pub l7rules: Arc<dyn Repository<L7Rule>>,
    /// VRRP groups, keyed by load balancer.
    pub vrrp_groups: Arc<dyn Repository<VrrpGroup>>,
    /// Amphora health rows.
    pub amphora_health: Arc<dyn Repository<AmphoraHealth>>,
    /// Distributor rows.
    pub distributors: Arc<dyn Repository<DistributorRecord>>,
    /// Active-active cluster associations, keyed by load balancer.
    pub clusters: Arc<dyn Repository<AmphoraCluster>>,
}

impl std::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repositories").finish_non_exhaustive()
    }
}

impl Repositories {
    /// Creates a bundle backed entirely by in-memory maps.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            amphorae: Arc::new(InMemoryAmphoraRepository::new()),
            load_balancers: Arc::new(InMemoryRepository::new()),
            listeners: Arc::new(InMemoryRepository::new()),
            pools: Arc::new(InMemoryRepository::new()),
            members: Arc::new(InMemoryRepository::new()),
            health_monitors: Arc::new(InMemoryRepository::new()),
            l7policies: Arc::new(InMemoryRepository::new()),
            l7rules: Arc::new(InMemoryRepository::new()),
            vrrp_groups: Arc::new(InMemoryRepository::new()),
            amphora_health: Arc::new(InMemoryRepository::new()),
            distributors: Arc::new(InMemoryRepository::new()),
            clusters: Arc::new(InMemoryRepository::new()),
        }
    }

    /// Returns the repository for entity kind `E`.
    #[must_use]
    pub fn of<E: Entity>(&self) -> &dyn Repository<E>
    where
        Self: RepositoryFor<E>,
    {
        <Self as RepositoryFor<E>>::repository(self)
    }

    /// Lists the non-deleted amphorae bound to a load balancer.
    ///
    /// # Errors
    ///
    /// Returns the repository error if the lookup fails.
    pub async fn amphorae_for_lb(&self, lb_id: LoadBalancerId) -> Result<Vec<Amphora>> {
        self.amphorae.for_load_balancer(lb_id).await
    }

    /// Lists the listeners attached to a load balancer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the load balancer does not exist.
    pub async fn listeners_for_lb(&self, lb_id: LoadBalancerId) -> Result<Vec<Listener>> {
        let lb = self.load_balancers.require(lb_id).await?;
        let mut listeners = Vec::with_capacity(lb.listener_ids.len());
        for id in lb.listener_ids {
            if let Some(listener) = self.listeners.get(id).await? {
                listeners.push(listener);
            }
        }
        Ok(listeners)
    }

    /// Lists the members of every pool attached to a load balancer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the load balancer does not exist.
    pub async fn members_for_lb(&self, lb_id: LoadBalancerId) -> Result<Vec<Member>> {
        let lb = self.load_balancers.require(lb_id).await?;
        let members = self.members.list().await?;
        Ok(members
            .into_iter()
            .filter(|m| lb.pool_ids.contains(&m.pool_id))
            .collect())
    }

    /// Sets the provisioning status of a load balancer and all its listeners.
    ///
    /// # Errors
    ///
    /// Returns the first repository error encountered.
    pub async fn mark_lb_and_listeners(
        &self,
        lb_id: LoadBalancerId,
        status: ProvisioningStatus,
    ) -> Result<()> {
        let lb = update_with(&*self.load_balancers, lb_id, |lb| {
            lb.set_provisioning_status(status);
        })
        .await?;
        for listener_id in lb.listener_ids {
            update_with(&*self.listeners, listener_id, |l| {
                l.set_provisioning_status(status);
            })
            .await?;
        }
        Ok(())
    }

    /// Sets an amphora's lifecycle status.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the amphora does not exist.
    pub async fn mark_amphora(
        &self,
        id: crate::id::AmphoraId,
        status: AmphoraStatus,
    ) -> Result<Amphora> {
        update_with(&*self.amphorae, id, |a| a.status = status).await
    }
}

/// Maps an entity kind to its repository inside [`Repositories`].
pub trait RepositoryFor<E: Entity> {
    /// Returns the repository for `E`.
    fn repository(&self) -> &dyn Repository<E>;
}

macro_rules! repository_for {
    ($($ty:ty => $field:ident),+ $(,)?) => {
        $(
            impl RepositoryFor<$ty> for Repositories {
                fn repository(&self) -> &dyn Repository<$ty> {
                    &*self.$field
                }
            }
        )+
    };
}

repository_for!(
    LoadBalancer => load_balancers,
    Listener => listeners,
    Pool => pools,
    Member => members,
    HealthMonitor => health_monitors,
    L7Policy => l7policies,
    L7Rule => l7rules,
    VrrpGroup => vrrp_groups,
    AmphoraHealth => amphora_health,
    DistributorRecord => distributors,
    AmphoraCluster => clusters,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{AmphoraId, ListenerId};
    use crate::model::{ListenerProtocol, Vip};
    use crate::status::Topology;
    use std::net::{IpAddr, Ipv4Addr};

    fn lb() -> LoadBalancer {
        let vip = Vip::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)));
        LoadBalancer::new(LoadBalancerId::generate(), vip, Topology::Single)
    }

    #[tokio::test]
    async fn require_reports_kind() {
        let repos = Repositories::in_memory();
        let err = repos
            .load_balancers
            .require(LoadBalancerId::generate())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("load_balancer"));
    }

    #[tokio::test]
    async fn mark_lb_and_listeners_cascades() {
        let repos = Repositories::in_memory();
        let mut lb = lb();
        let listener = Listener::new(ListenerId::generate(), lb.id, ListenerProtocol::Http, 80);
        lb.listener_ids.push(listener.id);
        repos.listeners.create(listener.clone()).await.unwrap();
        repos.load_balancers.create(lb.clone()).await.unwrap();

        repos
            .mark_lb_and_listeners(lb.id, ProvisioningStatus::Active)
            .await
            .unwrap();

        let lb = repos.load_balancers.require(lb.id).await.unwrap();
        let listener = repos.listeners.require(listener.id).await.unwrap();
        assert_eq!(lb.provisioning_status, ProvisioningStatus::Active);
        assert_eq!(listener.provisioning_status, ProvisioningStatus::Active);
    }

    #[tokio::test]
    async fn of_resolves_by_entity_type() {
        let repos = Repositories::in_memory();
        let lb = lb();
        repos.of::<LoadBalancer>().create(lb.clone()).await.unwrap();
        assert!(repos.load_balancers.get(lb.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn update_with_applies_closure() {
        let repos = Repositories::in_memory();
        let amp = Amphora::new(AmphoraId::generate());
        repos.amphorae.create(amp.clone()).await.unwrap();
        let updated = repos
            .mark_amphora(amp.id, AmphoraStatus::Booting)
            .await
            .unwrap();
        assert_eq!(updated.status, AmphoraStatus::Booting);
    }
}
