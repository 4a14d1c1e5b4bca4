//! The `external_ids` recovery format.
//!
//! A distributor's identity and slot bindings are mirrored into its bridge's
//! `external_ids` so that a restarted engine, or a second engine process,
//! can rebuild the same slot bookkeeping. The service-wide boot state lives
//! in the root `Open_vSwitch` record.
//!
//! | Key | Value |
//! |-----|-------|
//! | `dist-lb-id` | load balancer id |
//! | `dist-vip` | VIP address |
//! | `dist-size` | slot count |
//! | `dist-status` | last derived status |
//! | `dist-mac` | external interface MAC |
//! | `dist-hash-fields` | comma-separated hashed fields |
//! | `dist-ofport` | OpenFlow port of the external interface |
//! | `slot-<N>` | `<amphora_id>,<amphora_mac>` |

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use fleetlb_core::{AmphoraId, DistributorStatus, LoadBalancerId};

use crate::openflow::HashField;

/// Bridge key holding the load balancer id.
pub const LB_ID: &str = "dist-lb-id";
/// Bridge key holding the VIP.
pub const VIP: &str = "dist-vip";
/// Bridge key holding the slot count.
pub const SIZE: &str = "dist-size";
/// Bridge key holding the derived status.
pub const STATUS: &str = "dist-status";
/// Bridge key holding the external MAC.
pub const MAC: &str = "dist-mac";
/// Bridge key holding the hashed fields.
pub const HASH_FIELDS: &str = "dist-hash-fields";
/// Bridge key holding the external OpenFlow port.
pub const OFPORT: &str = "dist-ofport";
/// Prefix of per-slot bridge keys.
pub const SLOT_PREFIX: &str = "slot-";
/// Root key holding the engine boot state.
pub const ROOT_STATE: &str = "dist-state";
/// Root key holding the reason for the boot state.
pub const ROOT_STATE_REASON: &str = "dist-state-reason";

/// Returns the bridge key of `slot`.
#[must_use]
pub fn slot_key(slot: u32) -> String {
    format!("{SLOT_PREFIX}{slot}")
}

/// Encodes one slot binding value.
#[must_use]
pub fn slot_value(amphora_id: AmphoraId, mac: &str) -> String {
    format!("{amphora_id},{mac}")
}

/// Decoded bridge metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeMetadata {
    /// Load balancer served by the bridge.
    pub lb_id: LoadBalancerId,
    /// VIP address.
    pub vip: IpAddr,
    /// Slot count.
    pub size: u32,
    /// Last persisted status.
    pub status: DistributorStatus,
    /// External interface MAC.
    pub mac: String,
    /// Hashed fields.
    pub hash_fields: Vec<HashField>,
    /// OpenFlow port of the external interface, once attached.
    pub ofport: Option<u32>,
    /// Bound slots.
    pub slots: BTreeMap<u32, (AmphoraId, String)>,
}

impl BridgeMetadata {
    /// Encodes the metadata as `external_ids` entries.
    #[must_use]
    pub fn encode(&self) -> BTreeMap<String, String> {
        let mut ids = BTreeMap::new();
        ids.insert(LB_ID.to_string(), self.lb_id.to_string());
        ids.insert(VIP.to_string(), self.vip.to_string());
        ids.insert(SIZE.to_string(), self.size.to_string());
        ids.insert(STATUS.to_string(), self.status.to_string());
        ids.insert(MAC.to_string(), self.mac.clone());
        ids.insert(HASH_FIELDS.to_string(), HashField::join(&self.hash_fields));
        if let Some(ofport) = self.ofport {
            ids.insert(OFPORT.to_string(), ofport.to_string());
        }
        for (slot, (amphora_id, mac)) in &self.slots {
            ids.insert(slot_key(*slot), slot_value(*amphora_id, mac));
        }
        ids
    }

    /// Decodes bridge `external_ids`.
    ///
    /// Returns `Ok(None)` for bridges that are not distributors.
    ///
    /// # Errors
    ///
    /// Returns a description of the first malformed entry.
    pub fn decode(ids: &BTreeMap<String, String>) -> Result<Option<Self>, String> {
        let Some(lb_id) = ids.get(LB_ID) else {
            return Ok(None);
        };
        let lb_id: LoadBalancerId = lb_id.parse().map_err(|e| format!("{LB_ID}: {e}"))?;
        let vip: IpAddr = required(ids, VIP)?
            .parse()
            .map_err(|e| format!("{VIP}: {e}"))?;
        let size: u32 = required(ids, SIZE)?
            .parse()
            .map_err(|e| format!("{SIZE}: {e}"))?;
        let status: DistributorStatus = match ids.get(STATUS) {
            Some(status) => status.parse().map_err(|e| format!("{STATUS}: {e}"))?,
            None => DistributorStatus::NoMonitor,
        };
        let mac = required(ids, MAC)?.to_string();
        let hash_fields = HashField::parse_list(required(ids, HASH_FIELDS)?)
            .map_err(|e| format!("{HASH_FIELDS}: {e}"))?;
        let ofport: Option<u32> = ids
            .get(OFPORT)
            .map(|p| p.parse().map_err(|e| format!("{OFPORT}: {e}")))
            .transpose()?;

        let mut slots = BTreeMap::new();
        let mut amphorae = BTreeSet::new();
        for (key, value) in ids {
            let Some(slot) = key.strip_prefix(SLOT_PREFIX) else {
                continue;
            };
            let slot: u32 = slot.parse().map_err(|e| format!("{key}: {e}"))?;
            if slot >= size {
                return Err(format!("{key}: slot outside size {size}"));
            }
            let (amphora_id, amp_mac) = value
                .split_once(',')
                .ok_or_else(|| format!("{key}: expected '<amphora_id>,<mac>'"))?;
            let amphora_id: AmphoraId = amphora_id.parse().map_err(|e| format!("{key}: {e}"))?;
            if !amphorae.insert(amphora_id) {
                return Err(format!("{key}: amphora {amphora_id} bound twice"));
            }
            slots.insert(slot, (amphora_id, amp_mac.to_string()));
        }

        Ok(Some(Self {
            lb_id,
            vip,
            size,
            status,
            mac,
            hash_fields,
            ofport,
            slots,
        }))
    }
}

fn required<'a>(ids: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str, String> {
    ids.get(key)
        .map(String::as_str)
        .ok_or_else(|| format!("missing {key}"))
}
