//! The task library.
//!
//! Every task performs one round trip against one backend:
//!
//! | Module | Backend |
//! |--------|---------|
//! | [`database`] | Repositories: status transitions, lookups, spare allocation |
//! | [`compute`] | Compute driver: build, wait, delete, server groups |
//! | [`network`] | Network driver: VIP plug, member network deltas, port detach |
//! | [`amphora_driver`] | Amphora agent: finalize, listeners, VIP/network plug, VRRP |
//! | [`distributor_driver`] | Distributor agent: VIP plug, slot registration |
//! | [`cert`] | Certificate generator and certificate bookkeeping |
//! | [`cluster`] | Active-active cluster bookkeeping |
//!
//! Reverts drive entities toward ERROR rather than restoring prior values,
//! and swallow (after logging) any failure while doing so.

pub mod amphora_driver;
pub mod cert;
pub mod cluster;
pub mod compute;
pub mod database;
pub mod distributor_driver;
pub mod network;

use fleetlb_core::{AmphoraId, AmphoraStatus};

use crate::drivers::DriverResult;
use crate::error::Result;
use crate::keys;
use crate::task::{RevertOutcome, TaskContext};

/// Treats an agent's "already plugged" answer as success.
pub(crate) fn tolerate_already_plugged(
    result: DriverResult<()>,
    amphora_id: AmphoraId,
    operation: &str,
) -> Result<()> {
    match result {
        Err(err) if err.is_already_plugged() => {
            tracing::warn!(%amphora_id, operation, "network already plugged, continuing");
            Ok(())
        }
        other => Ok(other?),
    }
}

/// Revert helper: drives the amphora in the store to ERROR.
pub(crate) async fn amphora_to_error(ctx: &TaskContext<'_>) -> RevertOutcome {
    let Ok(amphora_id) = ctx.get(keys::AMPHORA_ID) else {
        return RevertOutcome::Skipped;
    };
    tracing::warn!(%amphora_id, task = ctx.task_name(), "reverting amphora to ERROR");
    let result = ctx
        .repos()
        .mark_amphora(amphora_id, AmphoraStatus::Error)
        .await
        .map(|_| ());
    RevertOutcome::from_result(ctx.task_name(), result)
}
