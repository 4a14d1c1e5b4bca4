//! Status enums for persisted entities.
//!
//! Each enum serializes to its upper-case wire name (`PENDING_CREATE`,
//! `ACTIVE_ACTIVE`, ...) and exposes the same name through [`as_str`] for
//! logging and metrics labels.
//!
//! [`as_str`]: ProvisioningStatus::as_str

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! wire_names {
    ($name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        impl $name {
            /// Returns the wire name of this value.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $wire,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// Provisioning status of a user-facing entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningStatus {
    /// The entity is provisioned and serving.
    Active,
    /// The entity is being created.
    #[default]
    PendingCreate,
    /// The entity is being updated.
    PendingUpdate,
    /// The entity is being deleted.
    PendingDelete,
    /// The entity has been deleted.
    Deleted,
    /// Provisioning failed; terminal until an operator acts.
    Error,
}

wire_names!(ProvisioningStatus {
    Active => "ACTIVE",
    PendingCreate => "PENDING_CREATE",
    PendingUpdate => "PENDING_UPDATE",
    PendingDelete => "PENDING_DELETE",
    Deleted => "DELETED",
    Error => "ERROR",
});

impl ProvisioningStatus {
    /// Returns true if the entity is in one of the `PENDING_*` states.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::PendingCreate | Self::PendingUpdate | Self::PendingDelete
        )
    }
}

/// Operating status as observed by health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingStatus {
    /// Serving traffic.
    Online,
    /// Administratively or operationally down.
    #[default]
    Offline,
    /// Serving with reduced capacity.
    Degraded,
    /// Not serving.
    Error,
    /// No health monitor is configured.
    NoMonitor,
}

wire_names!(OperatingStatus {
    Online => "ONLINE",
    Offline => "OFFLINE",
    Degraded => "DEGRADED",
    Error => "ERROR",
    NoMonitor => "NO_MONITOR",
});

/// Lifecycle status of an amphora.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AmphoraStatus {
    /// Database row created, compute not yet requested.
    #[default]
    PendingCreate,
    /// Compute instance requested and booting.
    Booting,
    /// Booted and finalized; available in the spare pool.
    Ready,
    /// Bound to a load balancer.
    Allocated,
    /// Being torn down.
    PendingDelete,
    /// Torn down.
    Deleted,
    /// Failed.
    Error,
}

wire_names!(AmphoraStatus {
    PendingCreate => "PENDING_CREATE",
    Booting => "BOOTING",
    Ready => "READY",
    Allocated => "ALLOCATED",
    PendingDelete => "PENDING_DELETE",
    Deleted => "DELETED",
    Error => "ERROR",
});

/// Role an amphora plays within its load balancer topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AmphoraRole {
    /// VRRP master of an active/standby pair.
    Master,
    /// VRRP backup of an active/standby pair.
    Backup,
    /// Single amphora topology.
    Standalone,
    /// Member of an active-active cluster.
    ActiveActive,
    /// Standby of an active-active cluster.
    ActiveStandby,
}

wire_names!(AmphoraRole {
    Master => "MASTER",
    Backup => "BACKUP",
    Standalone => "STANDALONE",
    ActiveActive => "ACTIVE_ACTIVE",
    ActiveStandby => "ACTIVE_STANDBY",
});

impl AmphoraRole {
    /// VRRP priority for roles that take part in VRRP elections.
    #[must_use]
    pub const fn vrrp_priority(&self) -> Option<u8> {
        match self {
            Self::Master => Some(100),
            Self::Backup => Some(90),
            _ => None,
        }
    }
}

/// Load balancer topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Topology {
    /// One standalone amphora.
    #[default]
    Single,
    /// A master/backup pair.
    ActiveStandby,
    /// A fixed-size cluster behind a distributor.
    ActiveActive,
}

wire_names!(Topology {
    Single => "SINGLE",
    ActiveStandby => "ACTIVE_STANDBY",
    ActiveActive => "ACTIVE_ACTIVE",
});

/// Derived status of a distributor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DistributorStatus {
    /// All slots bound.
    Online,
    /// Some slots bound.
    Degraded,
    /// Nothing bound yet, or a slot operation is in flight.
    NoMonitor,
    /// The forwarding plane is in an unknown state.
    Error,
}

wire_names!(DistributorStatus {
    Online => "ONLINE",
    Degraded => "DEGRADED",
    NoMonitor => "NO_MONITOR",
    Error => "ERROR",
});

impl std::str::FromStr for DistributorStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "ONLINE" => Ok(Self::Online),
            "DEGRADED" => Ok(Self::Degraded),
            "NO_MONITOR" => Ok(Self::NoMonitor),
            "ERROR" => Ok(Self::Error),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown distributor status '{other}'"
            ))),
        }
    }
}
