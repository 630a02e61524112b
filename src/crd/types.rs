//! Shared types for NodeGroup specifications
//!
//! These types model the parts of a NodeGroup that govern in-place
//! reconfiguration: how nodes are provisioned, who approves disruptions,
//! and how many nodes may be taken out of service at once.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// How the nodes of a group are provisioned
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum NodeType {
    /// Cloud instances that are recreated on every change
    CloudEphemeral,

    /// Cloud instances created once and kept for their lifetime
    CloudPermanent,

    /// Machines provisioned in the cloud by an external tool
    CloudStatic,

    /// Bare-metal or otherwise manually provisioned machines
    #[default]
    Static,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::CloudEphemeral => write!(f, "CloudEphemeral"),
            NodeType::CloudPermanent => write!(f, "CloudPermanent"),
            NodeType::CloudStatic => write!(f, "CloudStatic"),
            NodeType::Static => write!(f, "Static"),
        }
    }
}

/// Who may initiate a node drain
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ApprovalMode {
    /// The reconciler drains nodes on its own, within the disruption budget
    #[default]
    Automatic,

    /// Drains must be requested by an operator; the reconciler only finishes
    /// drains that were already requested
    Manual,
}

impl fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApprovalMode::Automatic => write!(f, "Automatic"),
            ApprovalMode::Manual => write!(f, "Manual"),
        }
    }
}

impl FromStr for ApprovalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Automatic" => Ok(ApprovalMode::Automatic),
            "Manual" => Ok(ApprovalMode::Manual),
            other => Err(format!(
                "unknown approval mode {:?}, expected Automatic or Manual",
                other
            )),
        }
    }
}

/// Disruption settings of a NodeGroup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DisruptionsSpec {
    /// `Automatic` (default) or `Manual`. Kept as a plain string so that a
    /// typo surfaces as a policy error for this group instead of hiding the
    /// whole object from the reconciler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_mode: Option<String>,
}

/// Update settings of a NodeGroup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateSpec {
    /// Maximum number of nodes drained concurrently (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<i32>,
}
