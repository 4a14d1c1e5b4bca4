//! The switch capability driven by the engine.
//!
//! [`Switch`] is the only way the engine touches the forwarding plane. The
//! production implementation shells out to OVS ([`OvsSwitch`]); tests use the
//! in-memory [`MemorySwitch`], which can be told to fail any operation.
//!
//! [`OvsSwitch`]: crate::ovs::OvsSwitch
//! [`MemorySwitch`]: crate::memory::MemorySwitch

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::SwitchResult;
use crate::openflow::{FlowSpec, GroupSpec};

/// Operations the distributor engine needs from a virtual switch.
///
/// ## Thread Safety
///
/// All methods take `&self`; implementations are shared across every
/// distributor through an `Arc<dyn Switch>`.
#[async_trait]
pub trait Switch: Send + Sync {
    /// Verifies the switch is reachable.
    async fn ping(&self) -> SwitchResult<()>;

    /// Lists every bridge.
    async fn list_bridges(&self) -> SwitchResult<Vec<String>>;

    /// Creates a bridge speaking the given OpenFlow protocol.
    async fn add_bridge(&self, bridge: &str, protocol: &str) -> SwitchResult<()>;

    /// Deletes a bridge and its ports. Deleting a missing bridge succeeds.
    async fn delete_bridge(&self, bridge: &str) -> SwitchResult<()>;

    /// Reads a bridge's `external_ids`.
    async fn bridge_external_ids(&self, bridge: &str) -> SwitchResult<BTreeMap<String, String>>;

    /// Sets (merges) entries into a bridge's `external_ids`.
    async fn set_bridge_external_ids(
        &self,
        bridge: &str,
        ids: &BTreeMap<String, String>,
    ) -> SwitchResult<()>;

    /// Removes one entry from a bridge's `external_ids`.
    async fn remove_bridge_external_id(&self, bridge: &str, key: &str) -> SwitchResult<()>;

    /// Reads the root record's `external_ids`.
    async fn root_external_ids(&self) -> SwitchResult<BTreeMap<String, String>>;

    /// Sets (merges) entries into the root record's `external_ids`.
    async fn set_root_external_ids(&self, ids: &BTreeMap<String, String>) -> SwitchResult<()>;

    /// Finds the host interface with the given MAC address.
    async fn find_interface_by_mac(&self, mac: &str) -> SwitchResult<Option<String>>;

    /// Attaches an interface to a bridge.
    async fn add_port(&self, bridge: &str, iface: &str) -> SwitchResult<()>;

    /// Reads the OpenFlow port number of an attached interface.
    ///
    /// Returns `None` while the switch has not assigned one yet.
    async fn get_ofport(&self, bridge: &str, iface: &str) -> SwitchResult<Option<u32>>;

    /// Adds a group.
    async fn add_group(&self, bridge: &str, group: &GroupSpec) -> SwitchResult<()>;

    /// Replaces an existing group.
    async fn modify_group(&self, bridge: &str, group: &GroupSpec) -> SwitchResult<()>;

    /// Deletes every flow of a bridge.
    async fn delete_flows(&self, bridge: &str) -> SwitchResult<()>;

    /// Adds a flow.
    async fn add_flow(&self, bridge: &str, flow: &FlowSpec) -> SwitchResult<()>;

    /// Sets an interface administratively up or down.
    async fn set_link(&self, iface: &str, up: bool) -> SwitchResult<()>;
}
