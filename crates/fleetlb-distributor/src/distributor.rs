//! Per-load-balancer slot bookkeeping.
//!
//! A [`Distributor`] owns a fixed pool of `size` slots. Every slot is either
//! free or bound to exactly one amphora:
//!
//! ```text
//! destinations.len() + free_slots.len() == size
//! ```
//!
//! The engine briefly breaks that equality while a slot is reserved but not
//! yet bound, and restores it before releasing the distributor's lock. The
//! methods here never touch the switch; they only move slots between the two
//! sets.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use fleetlb_core::{AmphoraId, DistributorStatus, LoadBalancerId};

use crate::error::{Error, Result};
use crate::metadata::BridgeMetadata;
use crate::openflow::HashField;

/// Length of derived bridge names; interface names are capped at 15 bytes.
const BRIDGE_NAME_LEN: usize = 14;

/// Where an amphora is bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    /// Slot number.
    pub slot: u32,
    /// Amphora MAC the slot forwards to.
    pub mac: String,
}

/// One bound slot in a [`SlotTable`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotBinding {
    /// Amphora bound to the slot.
    pub amphora_id: AmphoraId,
    /// Amphora MAC.
    pub mac: String,
}

/// Exported slot table of a distributor.
///
/// Lists every slot of the distributor; free slots map to `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotTable {
    /// Slot number to binding.
    pub slots: BTreeMap<u32, Option<SlotBinding>>,
}

impl SlotTable {
    /// Iterates over the bound slots.
    pub fn bindings(&self) -> impl Iterator<Item = (u32, &SlotBinding)> {
        self.slots
            .iter()
            .filter_map(|(slot, binding)| binding.as_ref().map(|b| (*slot, b)))
    }
}

/// Live state of one distributor.
#[derive(Debug, Clone)]
pub struct Distributor {
    lb_id: LoadBalancerId,
    bridge: String,
    vip: IpAddr,
    mac: String,
    iface: Option<String>,
    ofport: Option<u32>,
    size: u32,
    hash_fields: Vec<HashField>,
    destinations: BTreeMap<AmphoraId, Destination>,
    free_slots: BTreeSet<u32>,
    failed: bool,
    retired: bool,
}

impl Distributor {
    /// Creates a distributor with every slot free.
    #[must_use]
    pub fn new(lb_id: LoadBalancerId, vip: IpAddr, mac: impl Into<String>, size: u32) -> Self {
        Self {
            lb_id,
            bridge: Self::bridge_name(lb_id),
            vip,
            mac: mac.into(),
            iface: None,
            ofport: None,
            size,
            hash_fields: HashField::for_vip(&vip),
            destinations: BTreeMap::new(),
            free_slots: (0..size).collect(),
            failed: false,
            retired: false,
        }
    }

    /// Derives the bridge name of a load balancer.
    ///
    /// `d` followed by the first 13 hex digits of the SHA-256 of the id.
    #[must_use]
    pub fn bridge_name(lb_id: LoadBalancerId) -> String {
        let digest = hex::encode(Sha256::digest(lb_id.to_string().as_bytes()));
        format!("d{}", &digest[..BRIDGE_NAME_LEN - 1])
    }

    /// Derives the select-group hash seed from the VIP.
    #[must_use]
    pub fn hash_seed(vip: &IpAddr) -> u32 {
        let digest = Sha256::digest(vip.to_string().as_bytes());
        u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    /// Rebuilds a distributor from its bridge metadata.
    #[must_use]
    pub fn from_metadata(bridge: &str, meta: BridgeMetadata) -> Self {
        let destinations: BTreeMap<AmphoraId, Destination> = meta
            .slots
            .into_iter()
            .map(|(slot, (amphora_id, mac))| (amphora_id, Destination { slot, mac }))
            .collect();
        let bound: BTreeSet<u32> = destinations.values().map(|d| d.slot).collect();
        Self {
            lb_id: meta.lb_id,
            bridge: bridge.to_string(),
            vip: meta.vip,
            mac: meta.mac,
            iface: None,
            ofport: meta.ofport,
            size: meta.size,
            hash_fields: meta.hash_fields,
            free_slots: (0..meta.size).filter(|s| !bound.contains(s)).collect(),
            destinations,
            failed: meta.status == DistributorStatus::Error,
            retired: false,
        }
    }

    /// Returns the metadata mirroring this distributor.
    #[must_use]
    pub fn metadata(&self) -> BridgeMetadata {
        BridgeMetadata {
            lb_id: self.lb_id,
            vip: self.vip,
            size: self.size,
            status: self.status(),
            mac: self.mac.clone(),
            hash_fields: self.hash_fields.clone(),
            ofport: self.ofport,
            slots: self
                .destinations
                .iter()
                .map(|(amp, d)| (d.slot, (*amp, d.mac.clone())))
                .collect(),
        }
    }

    /// Load balancer served.
    #[must_use]
    pub const fn lb_id(&self) -> LoadBalancerId {
        self.lb_id
    }

    /// Bridge name.
    #[must_use]
    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    /// VIP.
    #[must_use]
    pub const fn vip(&self) -> IpAddr {
        self.vip
    }

    /// External interface MAC.
    #[must_use]
    pub fn mac(&self) -> &str {
        &self.mac
    }

    /// External interface name, when known.
    #[must_use]
    pub fn iface(&self) -> Option<&str> {
        self.iface.as_deref()
    }

    /// Records the external interface name.
    pub fn set_iface(&mut self, iface: impl Into<String>) {
        self.iface = Some(iface.into());
    }

    /// OpenFlow port of the external interface.
    #[must_use]
    pub const fn ofport(&self) -> Option<u32> {
        self.ofport
    }

    /// Records the OpenFlow port of the external interface.
    pub fn set_ofport(&mut self, ofport: u32) {
        self.ofport = Some(ofport);
    }

    /// Slot count.
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Hashed fields.
    #[must_use]
    pub fn hash_fields(&self) -> &[HashField] {
        &self.hash_fields
    }

    /// Bound amphorae.
    #[must_use]
    pub const fn destinations(&self) -> &BTreeMap<AmphoraId, Destination> {
        &self.destinations
    }

    /// Free slots.
    #[must_use]
    pub const fn free_slots(&self) -> &BTreeSet<u32> {
        &self.free_slots
    }

    /// Number of bound slots.
    #[must_use]
    pub fn registered(&self) -> usize {
        self.destinations.len()
    }

    /// Returns true once the forwarding plane is in an unknown state.
    #[must_use]
    pub const fn is_failed(&self) -> bool {
        self.failed
    }

    /// Marks the distributor failed. Never cleared.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Returns true once the bridge has been deleted.
    #[must_use]
    pub const fn is_retired(&self) -> bool {
        self.retired
    }

    /// Marks the bridge deleted. Holders of a stale handle treat the
    /// distributor as gone.
    pub fn retire(&mut self) {
        self.retired = true;
    }

    /// Derives the status from the slot sets.
    #[must_use]
    pub fn status(&self) -> DistributorStatus {
        let registered = self.destinations.len();
        let size = self.size as usize;
        if self.failed {
            DistributorStatus::Error
        } else if registered == 0 || registered + self.free_slots.len() < size {
            DistributorStatus::NoMonitor
        } else if registered == size {
            DistributorStatus::Online
        } else {
            DistributorStatus::Degraded
        }
    }

    /// Returns true if the slot sets account for every slot exactly once.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let bound: BTreeSet<u32> = self.destinations.values().map(|d| d.slot).collect();
        bound.len() == self.destinations.len()
            && bound.is_disjoint(&self.free_slots)
            && bound.len() + self.free_slots.len() == self.size as usize
    }

    /// Takes a slot out of the free set.
    ///
    /// With no request, the lowest free slot is taken.
    ///
    /// # Errors
    ///
    /// Returns a usage error if the requested slot is not free or no slot is
    /// left.
    pub fn reserve_slot(&mut self, requested: Option<u32>) -> Result<u32> {
        match requested {
            Some(slot) if self.free_slots.remove(&slot) => Ok(slot),
            Some(slot) if slot >= self.size => Err(Error::usage(format!(
                "slot {slot} is outside distributor size {}",
                self.size
            ))),
            Some(slot) => Err(Error::usage(format!("slot {slot} is not free"))),
            None => self.free_slots.pop_first().ok_or_else(|| {
                Error::usage(format!(
                    "no free slot left on distributor for load balancer {}",
                    self.lb_id
                ))
            }),
        }
    }

    /// Returns a reserved slot to the free set.
    pub fn release_slot(&mut self, slot: u32) {
        self.free_slots.insert(slot);
    }

    /// Binds a reserved slot to an amphora.
    pub fn bind(&mut self, amphora_id: AmphoraId, slot: u32, mac: impl Into<String>) {
        self.destinations.insert(
            amphora_id,
            Destination {
                slot,
                mac: mac.into(),
            },
        );
    }

    /// Unbinds an amphora, leaving its slot reserved.
    pub fn unbind(&mut self, amphora_id: AmphoraId) -> Option<Destination> {
        self.destinations.remove(&amphora_id)
    }

    /// Exports the slot table.
    #[must_use]
    pub fn dump(&self) -> SlotTable {
        let mut slots: BTreeMap<u32, Option<SlotBinding>> =
            (0..self.size).map(|slot| (slot, None)).collect();
        for (amphora_id, dest) in &self.destinations {
            slots.insert(
                dest.slot,
                Some(SlotBinding {
                    amphora_id: *amphora_id,
                    mac: dest.mac.clone(),
                }),
            );
        }
        SlotTable { slots }
    }

    /// Checks that a slot table can be imported without partial application.
    ///
    /// The table must list exactly the currently free slots and bind each
    /// amphora at most once.
    ///
    /// # Errors
    ///
    /// Returns a usage error describing the mismatch.
    pub fn check_table(&self, table: &SlotTable) -> Result<()> {
        let incoming: BTreeSet<u32> = table.slots.keys().copied().collect();
        if incoming != self.free_slots {
            return Err(Error::usage(format!(
                "slot table {incoming:?} does not match free slots {:?}",
                self.free_slots
            )));
        }
        let mut seen = BTreeSet::new();
        for (slot, binding) in table.bindings() {
            if !seen.insert(binding.amphora_id) || self.destinations.contains_key(&binding.amphora_id)
            {
                return Err(Error::usage(format!(
                    "amphora {} in slot {slot} is bound more than once",
                    binding.amphora_id
                )));
            }
        }
        Ok(())
    }
}
