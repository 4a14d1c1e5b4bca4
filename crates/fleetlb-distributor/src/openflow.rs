//! OpenFlow group and flow specifications.
//!
//! Specs are plain values the engine builds and the [`Switch`] programs.
//! Their [`Display`] output is the `ovs-ofctl` argument syntax, which the OVS
//! backend passes through verbatim and tests can assert on.
//!
//! ## Group Layout
//!
//! | Group id | Type | Purpose |
//! |----------|------|---------|
//! | `1` | select (hash) | One bucket per slot, seeded from the VIP |
//! | `1000 + N` | indirect | Slot `N`: drop when free, forward when bound |
//!
//! [`Switch`]: crate::switch::Switch
//! [`Display`]: std::fmt::Display

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Group id of the hash-select group.
pub const SELECT_GROUP_ID: u32 = 1;

/// Base group id of the per-slot destination groups.
pub const SLOT_GROUP_BASE: u32 = 1000;

const PRIORITY_CATCH_ALL: u16 = 0;
const PRIORITY_VIP: u16 = 500;
const PRIORITY_NEIGHBOR: u16 = 1000;

/// Returns the destination group id of `slot`.
#[must_use]
pub const fn slot_group_id(slot: u32) -> u32 {
    SLOT_GROUP_BASE + slot
}

/// Packet field hashed by the select group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashField {
    /// IPv4 source address.
    IpSrc,
    /// IPv6 source address.
    Ipv6Src,
    /// TCP source port.
    TcpSrc,
}

impl HashField {
    /// Returns the `ovs-ofctl` field name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::IpSrc => "ip_src",
            Self::Ipv6Src => "ipv6_src",
            Self::TcpSrc => "tcp_src",
        }
    }

    /// Returns the hashed fields for a VIP of the given IP version.
    #[must_use]
    pub fn for_vip(vip: &IpAddr) -> Vec<Self> {
        match vip {
            IpAddr::V4(_) => vec![Self::IpSrc, Self::TcpSrc],
            IpAddr::V6(_) => vec![Self::Ipv6Src, Self::TcpSrc],
        }
    }

    /// Renders a field list as the comma-separated metadata value.
    #[must_use]
    pub fn join(fields: &[Self]) -> String {
        fields
            .iter()
            .map(Self::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parses a comma-separated field list.
    ///
    /// # Errors
    ///
    /// Returns the unknown field name.
    pub fn parse_list(value: &str) -> Result<Vec<Self>, String> {
        value
            .split(',')
            .filter(|f| !f.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for HashField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ip_src" => Ok(Self::IpSrc),
            "ipv6_src" => Ok(Self::Ipv6Src),
            "tcp_src" => Ok(Self::TcpSrc),
            other => Err(format!("unknown hash field '{other}'")),
        }
    }
}

/// What a group does with a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupKind {
    /// Discard the packet.
    Drop,
    /// Rewrite MACs and send the packet back out of its input port.
    Forward {
        /// Distributor MAC written as the source.
        src_mac: String,
        /// Amphora MAC written as the destination.
        dst_mac: String,
    },
    /// Pick one bucket by hashing packet fields.
    HashSelect {
        /// Hashed fields.
        fields: Vec<HashField>,
        /// Hash seed, stable for a VIP.
        seed: u32,
        /// Group ids the buckets jump to, in bucket order.
        buckets: Vec<u32>,
    },
}

/// A group table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    /// Group id.
    pub group_id: u32,
    /// Group behavior.
    pub kind: GroupKind,
}

impl GroupSpec {
    /// The destination group of a free slot.
    #[must_use]
    pub const fn drop_slot(slot: u32) -> Self {
        Self {
            group_id: slot_group_id(slot),
            kind: GroupKind::Drop,
        }
    }

    /// The destination group of a slot bound to an amphora.
    #[must_use]
    pub fn forward_slot(slot: u32, src_mac: &str, dst_mac: &str) -> Self {
        Self {
            group_id: slot_group_id(slot),
            kind: GroupKind::Forward {
                src_mac: src_mac.to_string(),
                dst_mac: dst_mac.to_string(),
            },
        }
    }

    /// The hash-select group spreading traffic over `size` slots.
    #[must_use]
    pub fn hash_select(fields: Vec<HashField>, seed: u32, size: u32) -> Self {
        Self {
            group_id: SELECT_GROUP_ID,
            kind: GroupKind::HashSelect {
                fields,
                seed,
                buckets: (0..size).map(slot_group_id).collect(),
            },
        }
    }
}

impl fmt::Display for GroupSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group_id={}", self.group_id)?;
        match &self.kind {
            GroupKind::Drop => f.write_str(",type=indirect,bucket=actions=drop"),
            GroupKind::Forward { src_mac, dst_mac } => write!(
                f,
                ",type=indirect,bucket=actions=mod_dl_src:{src_mac},mod_dl_dst:{dst_mac},in_port"
            ),
            GroupKind::HashSelect {
                fields,
                seed,
                buckets,
            } => {
                write!(
                    f,
                    ",type=select,selection_method=hash,fields({}),selection_method_param={seed}",
                    HashField::join(fields)
                )?;
                for (bucket_id, group) in buckets.iter().enumerate() {
                    write!(f, ",bucket=bucket_id:{bucket_id},actions=group:{group}")?;
                }
                Ok(())
            }
        }
    }
}

/// What a flow matches and does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowKind {
    /// Lowest-priority drop of everything.
    DropAll,
    /// Answer ARP requests for an IPv4 VIP.
    ArpResponder {
        /// The VIP.
        vip: Ipv4Addr,
        /// MAC to answer with.
        mac: String,
    },
    /// Answer neighbor solicitations for an IPv6 VIP.
    NeighborAdvertiser {
        /// The VIP.
        vip: std::net::Ipv6Addr,
        /// MAC to answer with.
        mac: String,
    },
    /// Send TCP traffic for the VIP to the hash-select group.
    VipToGroup {
        /// The VIP.
        vip: IpAddr,
        /// OpenFlow port of the external interface.
        in_port: u32,
    },
}

/// A flow table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSpec {
    /// Flow behavior.
    pub kind: FlowKind,
}

impl FlowSpec {
    /// Builds the neighbor-resolution flow appropriate for the VIP's family.
    #[must_use]
    pub fn neighbor_responder(vip: IpAddr, mac: &str) -> Self {
        let kind = match vip {
            IpAddr::V4(vip) => FlowKind::ArpResponder {
                vip,
                mac: mac.to_string(),
            },
            IpAddr::V6(vip) => FlowKind::NeighborAdvertiser {
                vip,
                mac: mac.to_string(),
            },
        };
        Self { kind }
    }

    /// Returns the flow priority.
    #[must_use]
    pub const fn priority(&self) -> u16 {
        match self.kind {
            FlowKind::DropAll => PRIORITY_CATCH_ALL,
            FlowKind::ArpResponder { .. } | FlowKind::NeighborAdvertiser { .. } => {
                PRIORITY_NEIGHBOR
            }
            FlowKind::VipToGroup { .. } => PRIORITY_VIP,
        }
    }
}

/// Renders a MAC address as the hex literal NXM `load` actions expect.
fn mac_literal(mac: &str) -> String {
    format!("0x{}", mac.replace(':', ""))
}

impl fmt::Display for FlowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table=0,priority={},", self.priority())?;
        match &self.kind {
            FlowKind::DropAll => f.write_str("actions=drop"),
            FlowKind::ArpResponder { vip, mac } => write!(
                f,
                "arp,arp_op=1,arp_tpa={vip},actions=\
                 move:NXM_OF_ETH_SRC[]->NXM_OF_ETH_DST[],\
                 mod_dl_src:{mac},\
                 load:0x2->NXM_OF_ARP_OP[],\
                 move:NXM_NX_ARP_SHA[]->NXM_NX_ARP_THA[],\
                 move:NXM_OF_ARP_SPA[]->NXM_OF_ARP_TPA[],\
                 load:{}->NXM_NX_ARP_SHA[],\
                 load:{:#010x}->NXM_OF_ARP_SPA[],\
                 in_port",
                mac_literal(mac),
                u32::from(*vip)
            ),
            FlowKind::NeighborAdvertiser { vip, mac } => write!(
                f,
                "icmp6,icmp_type=135,nd_target={vip},actions=\
                 move:NXM_OF_ETH_SRC[]->NXM_OF_ETH_DST[],\
                 mod_dl_src:{mac},\
                 move:NXM_NX_IPV6_SRC[]->NXM_NX_IPV6_DST[],\
                 set_field:{vip}->ipv6_src,\
                 set_field:136->icmpv6_type,\
                 set_field:0->icmpv6_code,\
                 set_field:{mac}->nd_tll,\
                 in_port"
            ),
            FlowKind::VipToGroup { vip, in_port } => match vip {
                IpAddr::V4(vip) => write!(
                    f,
                    "tcp,in_port={in_port},nw_dst={vip},actions=group:{SELECT_GROUP_ID}"
                ),
                IpAddr::V6(vip) => write!(
                    f,
                    "tcp6,in_port={in_port},ipv6_dst={vip},actions=group:{SELECT_GROUP_ID}"
                ),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn hash_fields_follow_ip_version() {
        let v4 = HashField::for_vip(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(HashField::join(&v4), "ip_src,tcp_src");
        let v6 = HashField::for_vip(&IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(HashField::join(&v6), "ipv6_src,tcp_src");
        assert_eq!(HashField::parse_list("ipv6_src,tcp_src").unwrap(), v6);
        assert!(HashField::parse_list("udp_src").is_err());
    }

    #[test]
    fn select_group_lists_one_bucket_per_slot() {
        let group = GroupSpec::hash_select(vec![HashField::IpSrc, HashField::TcpSrc], 42, 3);
        assert_eq!(
            group.to_string(),
            "group_id=1,type=select,selection_method=hash,fields(ip_src,tcp_src),\
             selection_method_param=42,\
             bucket=bucket_id:0,actions=group:1000,\
             bucket=bucket_id:1,actions=group:1001,\
             bucket=bucket_id:2,actions=group:1002"
        );
    }

    #[test]
    fn slot_groups_render_drop_and_forward() {
        assert_eq!(
            GroupSpec::drop_slot(4).to_string(),
            "group_id=1004,type=indirect,bucket=actions=drop"
        );
        let forward = GroupSpec::forward_slot(2, "aa:bb:cc:dd:ee:01", "aa:bb:cc:dd:ee:02");
        assert_eq!(
            forward.to_string(),
            "group_id=1002,type=indirect,bucket=actions=mod_dl_src:aa:bb:cc:dd:ee:01,\
             mod_dl_dst:aa:bb:cc:dd:ee:02,in_port"
        );
    }

    #[test]
    fn vip_flow_jumps_to_select_group() {
        let flow = FlowSpec {
            kind: FlowKind::VipToGroup {
                vip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)),
                in_port: 3,
            },
        };
        assert_eq!(
            flow.to_string(),
            "table=0,priority=500,tcp,in_port=3,nw_dst=203.0.113.7,actions=group:1"
        );
    }

    #[test]
    fn arp_responder_loads_vip_and_mac() {
        let flow = FlowSpec::neighbor_responder(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            "02:00:00:00:00:01",
        );
        let rendered = flow.to_string();
        assert!(rendered.starts_with("table=0,priority=1000,arp,arp_op=1,arp_tpa=10.0.0.1"));
        assert!(rendered.contains("load:0x020000000001->NXM_NX_ARP_SHA[]"));
        assert!(rendered.contains("load:0x0a000001->NXM_OF_ARP_SPA[]"));
    }

    #[test]
    fn v6_vip_gets_neighbor_advertiser() {
        let flow = FlowSpec::neighbor_responder(IpAddr::V6(Ipv6Addr::LOCALHOST), "02:00:00:00:00:01");
        assert!(matches!(flow.kind, FlowKind::NeighborAdvertiser { .. }));
        assert!(flow.to_string().contains("nd_target=::1"));
    }
}
