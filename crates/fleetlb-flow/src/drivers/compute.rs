//! Compute capability and the recording noop driver.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;

use async_trait::async_trait;

use fleetlb_core::AmphoraId;

use super::{DriverError, DriverResult, FailureSet};

/// Lifecycle state reported by the compute backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeStatus {
    /// Still building.
    Building,
    /// Running.
    Active,
    /// Failed to build.
    Error,
    /// Gone.
    Deleted,
}

/// Everything needed to boot one amphora.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeBuildRequest {
    /// Amphora the instance backs.
    pub amphora_id: AmphoraId,
    /// Image tag.
    pub image_tag: String,
    /// Flavor.
    pub flavor: String,
    /// Networks attached at boot.
    pub networks: Vec<String>,
    /// SSH key.
    pub key_name: Option<String>,
    /// Server group for anti-affinity placement.
    pub server_group_id: Option<String>,
    /// Files written to the config drive, by path.
    pub config_drive_files: BTreeMap<String, String>,
}

/// Details of a running instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeDetails {
    /// Compute id.
    pub compute_id: String,
    /// Address on the management network.
    pub lb_network_ip: Option<IpAddr>,
}

/// Compute backend.
#[async_trait]
pub trait ComputeDriver: Send + Sync {
    /// Boots an instance and returns its compute id.
    async fn build(&self, request: ComputeBuildRequest) -> DriverResult<String>;

    /// Deletes an instance. Deleting a missing instance succeeds.
    async fn delete(&self, compute_id: &str) -> DriverResult<()>;

    /// Returns an instance's lifecycle state.
    async fn status(&self, compute_id: &str) -> DriverResult<ComputeStatus>;

    /// Returns an instance's details.
    async fn details(&self, compute_id: &str) -> DriverResult<ComputeDetails>;

    /// Creates a server group and returns its id.
    async fn create_server_group(&self, name: &str, policy: &str) -> DriverResult<String>;

    /// Deletes a server group.
    async fn delete_server_group(&self, group_id: &str) -> DriverResult<()>;
}

#[derive(Debug, Default)]
struct NoopComputeState {
    next: u32,
    builds: Vec<ComputeBuildRequest>,
    instances: HashMap<String, u32>,
    deleted: Vec<String>,
    server_groups: BTreeSet<String>,
    building_polls: u32,
    status_polls: u32,
    boot_status: Option<ComputeStatus>,
}

/// Compute driver that keeps instances in memory and records every call.
///
/// Instances report `Building` for a configurable number of polls, then
/// `Active` (or a forced status).
#[derive(Debug, Default)]
pub struct NoopComputeDriver {
    state: Mutex<NoopComputeState>,
    failures: FailureSet,
}

impl NoopComputeDriver {
    /// Creates an empty driver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every instance report `Building` for `polls` status calls.
    pub fn set_building_polls(&self, polls: u32) {
        self.lock().building_polls = polls;
    }

    /// Forces the status reported once building ends.
    pub fn set_boot_status(&self, status: ComputeStatus) {
        self.lock().boot_status = Some(status);
    }

    /// Makes an operation fail: `build`, `delete`, `status`, `details`,
    /// `create_server_group` or `delete_server_group`.
    pub fn fail(&self, operation: &'static str) {
        self.failures.fail(operation);
    }

    /// Undoes [`fail`](Self::fail).
    pub fn heal(&self, operation: &'static str) {
        self.failures.heal(operation);
    }

    /// Returns every build request received.
    #[must_use]
    pub fn builds(&self) -> Vec<ComputeBuildRequest> {
        self.lock().builds.clone()
    }

    /// Returns every deleted compute id.
    #[must_use]
    pub fn deleted(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }

    /// Returns how many status calls were made.
    #[must_use]
    pub fn status_polls(&self) -> u32 {
        self.lock().status_polls
    }

    /// Returns the live server groups.
    #[must_use]
    pub fn server_groups(&self) -> Vec<String> {
        self.lock().server_groups.iter().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NoopComputeState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl ComputeDriver for NoopComputeDriver {
    async fn build(&self, request: ComputeBuildRequest) -> DriverResult<String> {
        self.failures.check("compute", "build")?;
        let mut state = self.lock();
        state.next += 1;
        let compute_id = format!("compute-{}", state.next);
        let index = state.next;
        state.instances.insert(compute_id.clone(), index);
        state.builds.push(request);
        Ok(compute_id)
    }

    async fn delete(&self, compute_id: &str) -> DriverResult<()> {
        self.failures.check("compute", "delete")?;
        let mut state = self.lock();
        state.instances.remove(compute_id);
        state.deleted.push(compute_id.to_string());
        Ok(())
    }

    async fn status(&self, compute_id: &str) -> DriverResult<ComputeStatus> {
        self.failures.check("compute", "status")?;
        let mut state = self.lock();
        state.status_polls += 1;
        if !state.instances.contains_key(compute_id) {
            return Ok(ComputeStatus::Deleted);
        }
        if state.building_polls > 0 {
            state.building_polls -= 1;
            return Ok(ComputeStatus::Building);
        }
        Ok(state.boot_status.unwrap_or(ComputeStatus::Active))
    }

    async fn details(&self, compute_id: &str) -> DriverResult<ComputeDetails> {
        self.failures.check("compute", "details")?;
        let state = self.lock();
        let index = state
            .instances
            .get(compute_id)
            .copied()
            .ok_or_else(|| DriverError::not_found("compute instance", compute_id))?;
        let octet = u8::try_from(index % 250).unwrap_or(0) + 2;
        Ok(ComputeDetails {
            compute_id: compute_id.to_string(),
            lb_network_ip: Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, octet))),
        })
    }

    async fn create_server_group(&self, name: &str, policy: &str) -> DriverResult<String> {
        self.failures.check("compute", "create_server_group")?;
        let group_id = format!("{name}-{policy}");
        self.lock().server_groups.insert(group_id.clone());
        Ok(group_id)
    }

    async fn delete_server_group(&self, group_id: &str) -> DriverResult<()> {
        self.failures.check("compute", "delete_server_group")?;
        self.lock().server_groups.remove(group_id);
        Ok(())
    }
}
