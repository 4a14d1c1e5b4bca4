//! Strongly-typed identifiers for fleetlb entities.
//!
//! Every persisted entity is keyed by a UUID wrapped in its own newtype, so a
//! listener id can never be passed where an amphora id is expected.
//!
//! ```rust
//! use fleetlb_core::id::{AmphoraId, LoadBalancerId};
//!
//! let amphora = AmphoraId::generate();
//! let parsed: AmphoraId = amphora.to_string().parse().unwrap();
//! assert_eq!(amphora, parsed);
//!
//! // Different types - this won't compile:
//! // let wrong: LoadBalancerId = amphora;
//! # let _ = LoadBalancerId::generate();
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a new random identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Uuid::parse_str(s).map(Self).map_err(|e| Error::InvalidId {
                    message: format!("invalid {} '{s}': {e}", $label),
                })
            }
        }
    };
}

define_id!(
    /// Identifier of an amphora (one load-balancing appliance instance).
    AmphoraId,
    "amphora id"
);
define_id!(
    /// Identifier of a load balancer.
    LoadBalancerId,
    "load balancer id"
);
define_id!(
    /// Identifier of a listener.
    ListenerId,
    "listener id"
);
define_id!(
    /// Identifier of a pool.
    PoolId,
    "pool id"
);
define_id!(
    /// Identifier of a pool member.
    MemberId,
    "member id"
);
define_id!(
    /// Identifier of a health monitor.
    HealthMonitorId,
    "health monitor id"
);
define_id!(
    /// Identifier of an L7 policy.
    L7PolicyId,
    "l7 policy id"
);
define_id!(
    /// Identifier of an L7 rule.
    L7RuleId,
    "l7 rule id"
);
define_id!(
    /// Identifier of a distributor database record.
    DistributorId,
    "distributor id"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amphora_id_roundtrip() {
        let id = AmphoraId::generate();
        let parsed: AmphoraId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(LoadBalancerId::generate(), LoadBalancerId::generate());
    }

    #[test]
    fn invalid_id_returns_error() {
        let result: Result<LoadBalancerId> = "not-a-uuid".parse();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("load balancer id"));
    }

    #[test]
    fn serializes_as_bare_uuid() {
        let id = ListenerId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
    }
}
