//! In-memory repository implementation for testing.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **No persistence**: All state is lost when the process exits
//!
//! Writes can be made to fail on demand with
//! [`InMemoryRepository::fail_writes`], which lets callers exercise the
//! paths where persistence breaks in the middle of an operation. Every
//! accepted create and update is also kept in a write log, so tests can
//! check the order in which a row moved through its states.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{AmphoraRepository, Repository};
use crate::error::{Error, Result};
use crate::id::LoadBalancerId;
use crate::model::{Amphora, Entity};
use crate::status::AmphoraStatus;

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// In-memory repository for one entity kind.
#[derive(Debug)]
pub struct InMemoryRepository<E: Entity> {
    rows: RwLock<BTreeMap<E::Id, E>>,
    writes: RwLock<Vec<E>>,
    fail_writes: AtomicBool,
}

impl<E: Entity> Default for InMemoryRepository<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> InMemoryRepository<E> {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            writes: RwLock::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent create, update and delete fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns every row accepted by a create or update, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn writes(&self) -> Result<Vec<E>> {
        let writes = self.writes.read().map_err(poison_err)?;
        Ok(writes.clone())
    }

    /// Returns the number of stored rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let len = {
            let rows = self.rows.read().map_err(poison_err)?;
            rows.len()
        };
        Ok(len)
    }

    /// Returns true if no rows are stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::storage(format!("{} write rejected", E::KIND)));
        }
        Ok(())
    }

    fn record(&self, entity: &E) -> Result<()> {
        self.writes.write().map_err(poison_err)?.push(entity.clone());
        Ok(())
    }

    fn with_rows<R>(&self, f: impl FnOnce(&mut BTreeMap<E::Id, E>) -> Result<R>) -> Result<R> {
        self.check_writable()?;
        let mut rows = self.rows.write().map_err(poison_err)?;
        f(&mut rows)
    }

    fn read_rows<R>(&self, f: impl FnOnce(&BTreeMap<E::Id, E>) -> R) -> Result<R> {
        let rows = self.rows.read().map_err(poison_err)?;
        Ok(f(&rows))
    }
}

#[async_trait]
impl<E: Entity> Repository<E> for InMemoryRepository<E> {
    async fn get(&self, id: E::Id) -> Result<Option<E>> {
        self.read_rows(|rows| rows.get(&id).cloned())
    }

    async fn create(&self, entity: E) -> Result<()> {
        self.with_rows(|rows| {
            let id = entity.id();
            if rows.contains_key(&id) {
                return Err(Error::conflict(E::KIND, id));
            }
            self.record(&entity)?;
            rows.insert(id, entity);
            Ok(())
        })
    }

    async fn update(&self, entity: E) -> Result<()> {
        self.with_rows(|rows| {
            let id = entity.id();
            let Some(slot) = rows.get_mut(&id) else {
                return Err(Error::not_found(E::KIND, id));
            };
            self.record(&entity)?;
            *slot = entity;
            Ok(())
        })
    }

    async fn delete(&self, id: E::Id) -> Result<()> {
        self.with_rows(|rows| {
            rows.remove(&id);
            Ok(())
        })
    }

    async fn list(&self) -> Result<Vec<E>> {
        self.read_rows(|rows| rows.values().cloned().collect())
    }
}

/// In-memory amphora repository with atomic spare allocation.
#[derive(Debug, Default)]
pub struct InMemoryAmphoraRepository {
    inner: InMemoryRepository<Amphora>,
}

impl InMemoryAmphoraRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.fail_writes(fail);
    }

    /// Returns every amphora row written, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn writes(&self) -> Result<Vec<Amphora>> {
        self.inner.writes()
    }
}

#[async_trait]
impl Repository<Amphora> for InMemoryAmphoraRepository {
    async fn get(&self, id: <Amphora as Entity>::Id) -> Result<Option<Amphora>> {
        self.inner.get(id).await
    }

    async fn create(&self, entity: Amphora) -> Result<()> {
        self.inner.create(entity).await
    }

    async fn update(&self, entity: Amphora) -> Result<()> {
        self.inner.update(entity).await
    }

    async fn delete(&self, id: <Amphora as Entity>::Id) -> Result<()> {
        self.inner.delete(id).await
    }

    async fn list(&self) -> Result<Vec<Amphora>> {
        self.inner.list().await
    }
}

#[async_trait]
impl AmphoraRepository for InMemoryAmphoraRepository {
    async fn allocate_spare(&self, lb_id: LoadBalancerId) -> Result<Option<Amphora>> {
        self.inner.with_rows(|rows| {
            let Some(amp) = rows.values_mut().find(|a| a.is_spare()) else {
                return Ok(None);
            };
            amp.status = AmphoraStatus::Allocated;
            amp.load_balancer_id = Some(lb_id);
            self.inner.record(amp)?;
            Ok(Some(amp.clone()))
        })
    }

    async fn for_load_balancer(&self, lb_id: LoadBalancerId) -> Result<Vec<Amphora>> {
        self.inner.read_rows(|rows| {
            rows.values()
                .filter(|a| {
                    a.load_balancer_id == Some(lb_id) && a.status != AmphoraStatus::Deleted
                })
                .cloned()
                .collect()
        })
    }

    async fn spare_count(&self) -> Result<usize> {
        self.inner
            .read_rows(|rows| rows.values().filter(|a| a.is_spare()).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::AmphoraId;

    fn spare() -> Amphora {
        let mut amp = Amphora::new(AmphoraId::generate());
        amp.status = AmphoraStatus::Ready;
        amp
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let repo = InMemoryRepository::<Amphora>::new();
        let amp = spare();
        repo.create(amp.clone()).await.unwrap();
        let err = repo.create(amp).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn update_missing_is_not_found() {
        let repo = InMemoryRepository::<Amphora>::new();
        let err = repo.update(spare()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn fail_writes_rejects_mutations_but_not_reads() {
        let repo = InMemoryRepository::<Amphora>::new();
        let amp = spare();
        repo.create(amp.clone()).await.unwrap();
        repo.fail_writes(true);
        assert!(repo.update(amp.clone()).await.is_err());
        assert!(repo.get(amp.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn write_log_keeps_every_accepted_write_in_order() {
        let repo = InMemoryAmphoraRepository::new();
        let mut amp = spare();
        repo.create(amp.clone()).await.unwrap();
        amp.status = AmphoraStatus::Booting;
        repo.update(amp.clone()).await.unwrap();
        repo.fail_writes(true);
        amp.status = AmphoraStatus::Error;
        assert!(repo.update(amp.clone()).await.is_err());
        repo.fail_writes(false);
        repo.allocate_spare(LoadBalancerId::generate()).await.unwrap();

        let statuses: Vec<AmphoraStatus> =
            repo.writes().unwrap().into_iter().map(|a| a.status).collect();
        assert_eq!(statuses, vec![AmphoraStatus::Ready, AmphoraStatus::Booting]);
    }

    #[tokio::test]
    async fn allocate_spare_claims_each_amphora_once() {
        let repo = InMemoryAmphoraRepository::new();
        let amp = spare();
        repo.create(amp.clone()).await.unwrap();
        let lb_id = LoadBalancerId::generate();

        let claimed = repo.allocate_spare(lb_id).await.unwrap().unwrap();
        assert_eq!(claimed.id, amp.id);
        assert_eq!(claimed.status, AmphoraStatus::Allocated);
        assert_eq!(claimed.load_balancer_id, Some(lb_id));

        assert!(repo.allocate_spare(lb_id).await.unwrap().is_none());
        assert_eq!(repo.spare_count().await.unwrap(), 0);
        assert_eq!(repo.for_load_balancer(lb_id).await.unwrap().len(), 1);
    }
}
