//! In-memory switch for testing.
//!
//! [`MemorySwitch`] keeps bridges, ports, groups, flows and `external_ids`
//! in maps and records them as the engine programs them. Every operation
//! can be made to fail, or to stall, on demand through [`SwitchOp`], which is
//! how tests reach the engine's forwarding-plane failure paths and its
//! interleavings.
//!
//! ## Limitations
//!
//! - **NOT a forwarding plane**: nothing is ever switched
//! - **Single-process only**: two engines only share state when they share
//!   the same `Arc<MemorySwitch>`

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{SwitchError, SwitchResult};
use crate::openflow::{FlowSpec, GroupSpec};
use crate::switch::Switch;

/// A switch operation that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwitchOp {
    /// [`Switch::ping`].
    Ping,
    /// [`Switch::add_bridge`].
    AddBridge,
    /// [`Switch::delete_bridge`].
    DeleteBridge,
    /// [`Switch::set_bridge_external_ids`].
    SetBridgeExternalIds,
    /// [`Switch::remove_bridge_external_id`].
    RemoveBridgeExternalId,
    /// [`Switch::add_port`].
    AddPort,
    /// [`Switch::add_group`].
    AddGroup,
    /// [`Switch::modify_group`].
    ModifyGroup,
    /// [`Switch::add_flow`].
    AddFlow,
    /// [`Switch::set_link`].
    SetLink,
}

#[derive(Debug, Default, Clone)]
struct Bridge {
    protocol: String,
    external_ids: BTreeMap<String, String>,
    ports: BTreeMap<String, u32>,
    groups: BTreeMap<u32, GroupSpec>,
    flows: Vec<FlowSpec>,
}

#[derive(Debug, Default)]
struct State {
    bridges: BTreeMap<String, Bridge>,
    root_ids: BTreeMap<String, String>,
    interfaces: HashMap<String, String>,
    links_up: HashSet<String>,
    failing: HashSet<SwitchOp>,
    stalls: HashMap<SwitchOp, Duration>,
    pending_ofport_reads: u32,
    next_ofport: u32,
    bridges_created: u32,
}

fn poison_err<T>(_: PoisonError<T>) -> SwitchError {
    SwitchError::new("memory-switch", "lock poisoned")
}

/// In-memory [`Switch`].
#[derive(Debug, Default)]
pub struct MemorySwitch {
    state: Mutex<State>,
}

impl MemorySwitch {
    /// Creates an empty switch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a host interface so it can be found by MAC.
    pub fn add_interface(&self, iface: &str, mac: &str) {
        if let Ok(mut state) = self.state.lock() {
            state
                .interfaces
                .insert(mac.to_ascii_lowercase(), iface.to_string());
        }
    }

    /// Makes `op` fail until [`heal`](Self::heal) is called.
    pub fn fail(&self, op: SwitchOp) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.insert(op);
        }
    }

    /// Stops `op` from failing.
    pub fn heal(&self, op: SwitchOp) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.remove(&op);
        }
    }

    /// Makes every `op` sleep for `delay` before it takes effect.
    pub fn stall(&self, op: SwitchOp, delay: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.stalls.insert(op, delay);
        }
    }

    /// Makes the next `reads` port number reads report no port.
    pub fn delay_ofport(&self, reads: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.pending_ofport_reads = reads;
        }
    }

    /// Returns the names of all bridges.
    #[must_use]
    pub fn bridge_names(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.bridges.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns how many bridges were ever created.
    #[must_use]
    pub fn bridges_created(&self) -> u32 {
        self.state.lock().map(|s| s.bridges_created).unwrap_or(0)
    }

    /// Returns the group programmed under `group_id` on `bridge`.
    #[must_use]
    pub fn group(&self, bridge: &str, group_id: u32) -> Option<GroupSpec> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.bridges.get(bridge)?.groups.get(&group_id).cloned())
    }

    /// Returns the flows installed on `bridge`.
    #[must_use]
    pub fn flows(&self, bridge: &str) -> Vec<FlowSpec> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.bridges.get(bridge).map(|b| b.flows.clone()))
            .unwrap_or_default()
    }

    /// Returns true if `iface` is administratively up.
    #[must_use]
    pub fn link_is_up(&self, iface: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.links_up.contains(iface))
            .unwrap_or(false)
    }

    async fn pause(&self, op: SwitchOp) {
        let delay = self
            .state
            .lock()
            .ok()
            .and_then(|s| s.stalls.get(&op).copied());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn with_state<R>(
        &self,
        op: Option<(SwitchOp, &str)>,
        f: impl FnOnce(&mut State) -> SwitchResult<R>,
    ) -> SwitchResult<R> {
        let mut state = self.state.lock().map_err(poison_err)?;
        if let Some((op, command)) = op {
            if state.failing.contains(&op) {
                return Err(SwitchError::new(command, "injected failure"));
            }
        }
        f(&mut state)
    }
}

fn bridge_mut<'a>(state: &'a mut State, bridge: &str, command: &str) -> SwitchResult<&'a mut Bridge> {
    state
        .bridges
        .get_mut(bridge)
        .ok_or_else(|| SwitchError::new(command, format!("no bridge named {bridge}")))
}

#[async_trait]
impl Switch for MemorySwitch {
    async fn ping(&self) -> SwitchResult<()> {
        self.pause(SwitchOp::Ping).await;
        self.with_state(Some((SwitchOp::Ping, "ovs-vsctl show")), |_| Ok(()))
    }

    async fn list_bridges(&self) -> SwitchResult<Vec<String>> {
        self.with_state(None, |s| Ok(s.bridges.keys().cloned().collect()))
    }

    async fn add_bridge(&self, bridge: &str, protocol: &str) -> SwitchResult<()> {
        self.pause(SwitchOp::AddBridge).await;
        self.with_state(Some((SwitchOp::AddBridge, "ovs-vsctl add-br")), |s| {
            if s.bridges.contains_key(bridge) {
                return Err(SwitchError::new(
                    "ovs-vsctl add-br",
                    format!("a bridge named {bridge} already exists"),
                ));
            }
            s.bridges.insert(
                bridge.to_string(),
                Bridge {
                    protocol: protocol.to_string(),
                    ..Bridge::default()
                },
            );
            s.bridges_created += 1;
            Ok(())
        })
    }

    async fn delete_bridge(&self, bridge: &str) -> SwitchResult<()> {
        self.pause(SwitchOp::DeleteBridge).await;
        self.with_state(Some((SwitchOp::DeleteBridge, "ovs-vsctl del-br")), |s| {
            if let Some(removed) = s.bridges.remove(bridge) {
                for iface in removed.ports.keys() {
                    s.links_up.remove(iface);
                }
            }
            Ok(())
        })
    }

    async fn bridge_external_ids(&self, bridge: &str) -> SwitchResult<BTreeMap<String, String>> {
        self.with_state(None, |s| {
            Ok(bridge_mut(s, bridge, "ovs-vsctl get")?.external_ids.clone())
        })
    }

    async fn set_bridge_external_ids(
        &self,
        bridge: &str,
        ids: &BTreeMap<String, String>,
    ) -> SwitchResult<()> {
        self.pause(SwitchOp::SetBridgeExternalIds).await;
        self.with_state(
            Some((SwitchOp::SetBridgeExternalIds, "ovs-vsctl set bridge")),
            |s| {
                let entry = bridge_mut(s, bridge, "ovs-vsctl set bridge")?;
                entry
                    .external_ids
                    .extend(ids.iter().map(|(k, v)| (k.clone(), v.clone())));
                Ok(())
            },
        )
    }

    async fn remove_bridge_external_id(&self, bridge: &str, key: &str) -> SwitchResult<()> {
        self.pause(SwitchOp::RemoveBridgeExternalId).await;
        self.with_state(
            Some((SwitchOp::RemoveBridgeExternalId, "ovs-vsctl remove bridge")),
            |s| {
                bridge_mut(s, bridge, "ovs-vsctl remove bridge")?
                    .external_ids
                    .remove(key);
                Ok(())
            },
        )
    }

    async fn root_external_ids(&self) -> SwitchResult<BTreeMap<String, String>> {
        self.with_state(None, |s| Ok(s.root_ids.clone()))
    }

    async fn set_root_external_ids(&self, ids: &BTreeMap<String, String>) -> SwitchResult<()> {
        self.with_state(None, |s| {
            s.root_ids
                .extend(ids.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(())
        })
    }

    async fn find_interface_by_mac(&self, mac: &str) -> SwitchResult<Option<String>> {
        self.with_state(None, |s| {
            Ok(s.interfaces.get(&mac.to_ascii_lowercase()).cloned())
        })
    }

    async fn add_port(&self, bridge: &str, iface: &str) -> SwitchResult<()> {
        self.pause(SwitchOp::AddPort).await;
        self.with_state(Some((SwitchOp::AddPort, "ovs-vsctl add-port")), |s| {
            s.next_ofport += 1;
            let ofport = s.next_ofport;
            bridge_mut(s, bridge, "ovs-vsctl add-port")?
                .ports
                .insert(iface.to_string(), ofport);
            Ok(())
        })
    }

    async fn get_ofport(&self, bridge: &str, iface: &str) -> SwitchResult<Option<u32>> {
        self.with_state(None, |s| {
            if s.pending_ofport_reads > 0 {
                s.pending_ofport_reads -= 1;
                return Ok(None);
            }
            Ok(bridge_mut(s, bridge, "ovs-vsctl get interface")?
                .ports
                .get(iface)
                .copied())
        })
    }

    async fn add_group(&self, bridge: &str, group: &GroupSpec) -> SwitchResult<()> {
        self.pause(SwitchOp::AddGroup).await;
        self.with_state(Some((SwitchOp::AddGroup, "ovs-ofctl add-group")), |s| {
            let entry = bridge_mut(s, bridge, "ovs-ofctl add-group")?;
            if entry.groups.contains_key(&group.group_id) {
                return Err(SwitchError::new(
                    "ovs-ofctl add-group",
                    format!("group {} exists", group.group_id),
                ));
            }
            entry.groups.insert(group.group_id, group.clone());
            Ok(())
        })
    }

    async fn modify_group(&self, bridge: &str, group: &GroupSpec) -> SwitchResult<()> {
        self.pause(SwitchOp::ModifyGroup).await;
        self.with_state(Some((SwitchOp::ModifyGroup, "ovs-ofctl mod-group")), |s| {
            let entry = bridge_mut(s, bridge, "ovs-ofctl mod-group")?;
            let Some(existing) = entry.groups.get_mut(&group.group_id) else {
                return Err(SwitchError::new(
                    "ovs-ofctl mod-group",
                    format!("unknown group {}", group.group_id),
                ));
            };
            *existing = group.clone();
            Ok(())
        })
    }

    async fn delete_flows(&self, bridge: &str) -> SwitchResult<()> {
        self.with_state(None, |s| {
            bridge_mut(s, bridge, "ovs-ofctl del-flows")?.flows.clear();
            Ok(())
        })
    }

    async fn add_flow(&self, bridge: &str, flow: &FlowSpec) -> SwitchResult<()> {
        self.pause(SwitchOp::AddFlow).await;
        self.with_state(Some((SwitchOp::AddFlow, "ovs-ofctl add-flow")), |s| {
            bridge_mut(s, bridge, "ovs-ofctl add-flow")?
                .flows
                .push(flow.clone());
            Ok(())
        })
    }

    async fn set_link(&self, iface: &str, up: bool) -> SwitchResult<()> {
        self.pause(SwitchOp::SetLink).await;
        self.with_state(Some((SwitchOp::SetLink, "ip link set")), |s| {
            if up {
                s.links_up.insert(iface.to_string());
            } else {
                s.links_up.remove(iface);
            }
            Ok(())
        })
    }
}

impl MemorySwitch {
    /// Returns the OpenFlow protocol `bridge` was created with.
    #[must_use]
    pub fn protocol(&self, bridge: &str) -> Option<String> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.bridges.get(bridge).map(|b| b.protocol.clone()))
    }
}
