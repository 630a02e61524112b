//! Disruption policy resolution
//!
//! Maps a NodeGroup to its approval mode and the number of nodes that may be
//! out of service at the same time.

use kube::ResourceExt;
use serde::Serialize;

use crate::crd::{ApprovalMode, NodeGroup};
use crate::error::{Error, Result};

/// Drain concurrency when the group does not set `spec.update.maxConcurrent`
pub const DEFAULT_MAX_CONCURRENT: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionPolicy {
    pub approval_mode: ApprovalMode,
    /// Nodes of the group allowed in Draining or Drained at once
    pub concurrency_budget: u32,
}

/// Resolve the disruption policy of a NodeGroup.
///
/// An unrecognised approval mode or a non-positive `maxConcurrent` is a
/// configuration error; callers must not fall back to `Automatic`.
pub fn resolve(group: &NodeGroup) -> Result<DisruptionPolicy> {
    let approval_mode = match group.spec.approval_mode() {
        None => ApprovalMode::default(),
        Some(raw) => raw.parse::<ApprovalMode>().map_err(|message| Error::PolicyError {
            group: group.name_any(),
            message,
        })?,
    };

    let max_concurrent = match group.spec.max_concurrent() {
        None => DEFAULT_MAX_CONCURRENT,
        Some(n) if n >= 1 => n as u32,
        Some(n) => {
            return Err(Error::PolicyError {
                group: group.name_any(),
                message: format!("update.maxConcurrent must be at least 1, got {}", n),
            })
        }
    };

    let (desired, ready) = group
        .status
        .as_ref()
        .map(|s| (s.desired, s.ready))
        .unwrap_or((0, 0));

    Ok(DisruptionPolicy {
        approval_mode,
        concurrency_budget: concurrency_budget(max_concurrent, desired, ready),
    })
}

/// Budget left after accounting for nodes the group is already missing.
///
/// Every desired node that is not ready already counts as out of service, so
/// a group short of capacity gets fewer (possibly zero) drain slots.
pub fn concurrency_budget(max_concurrent: u32, desired: i32, ready: i32) -> u32 {
    let missing = desired.saturating_sub(ready).max(0) as u32;
    max_concurrent.saturating_sub(missing)
}
