//! Node phase classification
//!
//! Progress is stored on the Node as two presence-only annotations. This
//! module reads them into a [`ProgressMarker`] once, then derives the node's
//! current and target [`NodePhase`] from the marker, the node's applied
//! configuration checksum and its group's policy. Nothing here touches the
//! API server; the same inputs always yield the same classification.

use std::fmt;

use serde::Serialize;

use crate::crd::ApprovalMode;

use super::snapshot::NodeRecord;

/// Where a node stands in the drain lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum NodePhase {
    /// Configuration matches the group fingerprint, no progress markers wanted
    UpToDate,
    /// Configuration is stale but no drain can start yet
    NeedsUpdate,
    /// Configuration is stale and the group requires an operator to approve the drain
    PendingApproval,
    /// A drain has been requested and the node is cordoned
    Draining,
    /// The drain finished; waiting for the node to pick up the new configuration
    Drained,
}

impl NodePhase {
    /// Draining and Drained nodes are out of service and consume the group's budget.
    pub fn is_out_of_service(self) -> bool {
        matches!(self, NodePhase::Draining | NodePhase::Drained)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodePhase::UpToDate => "UpToDate",
            NodePhase::NeedsUpdate => "NeedsUpdate",
            NodePhase::PendingApproval => "PendingApproval",
            NodePhase::Draining => "Draining",
            NodePhase::Drained => "Drained",
        }
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress recorded on the node itself
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressMarker {
    None,
    DrainRequested,
    Drained,
}

impl ProgressMarker {
    /// Read the marker from annotation presence.
    ///
    /// Both annotations at once cannot be written by this reconciler; it is
    /// read as `Drained` so the stray `draining` gets removed instead of
    /// triggering a second drain.
    pub fn from_flags(draining: bool, drained: bool) -> Self {
        match (draining, drained) {
            (_, true) => ProgressMarker::Drained,
            (true, false) => ProgressMarker::DrainRequested,
            (false, false) => ProgressMarker::None,
        }
    }
}

/// What the classifier knows about a node's group
#[derive(Clone, Copy, Debug)]
pub struct GroupView<'a> {
    /// Checksum of the group's intended configuration
    pub fingerprint: &'a str,
    /// `None` when the group's policy could not be resolved
    pub approval: Option<ApprovalMode>,
    /// Whether the group still has budget for one more drain
    pub has_free_slot: bool,
}

/// Result of classifying one node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Classification {
    pub current: NodePhase,
    pub target: NodePhase,
}

impl Classification {
    /// True when this transition starts a new drain and takes a budget slot.
    pub fn initiates_drain(&self) -> bool {
        self.target == NodePhase::Draining && self.current != NodePhase::Draining
    }

    /// True when the drain primitive must run to reach the target.
    pub fn completes_drain(&self) -> bool {
        self.current == NodePhase::Draining && self.target == NodePhase::Drained
    }

    pub fn is_steady(&self) -> bool {
        self.current == self.target
    }
}

/// Classify a node against its group.
///
/// `group` is `None` when the node has no group label, or when either the
/// NodeGroup or its fingerprint is missing. Such a node has nothing to be
/// updated towards, so any markers it carries are stale.
pub fn classify(node: &NodeRecord, group: Option<&GroupView<'_>>) -> Classification {
    let marker = node.marker();

    let stale_config = match group {
        Some(view) => node.applied_checksum.as_deref() != Some(view.fingerprint),
        None => false,
    };

    let current = match marker {
        ProgressMarker::DrainRequested => NodePhase::Draining,
        ProgressMarker::Drained => NodePhase::Drained,
        ProgressMarker::None if stale_config => NodePhase::NeedsUpdate,
        ProgressMarker::None => NodePhase::UpToDate,
    };

    let view = match group {
        Some(view) if stale_config => view,
        _ => {
            return Classification {
                current,
                target: NodePhase::UpToDate,
            }
        }
    };

    // Completing an already requested drain is not gated by approval.
    let target = match marker {
        ProgressMarker::DrainRequested | ProgressMarker::Drained => NodePhase::Drained,
        ProgressMarker::None => match view.approval {
            Some(ApprovalMode::Automatic) if view.has_free_slot => NodePhase::Draining,
            Some(ApprovalMode::Automatic) => NodePhase::NeedsUpdate,
            Some(ApprovalMode::Manual) => NodePhase::PendingApproval,
            None => NodePhase::NeedsUpdate,
        },
    };

    Classification { current, target }
}
