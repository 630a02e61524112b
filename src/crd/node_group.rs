//! NodeGroup Custom Resource Definition
//!
//! A NodeGroup is a named pool of worker nodes sharing one configuration
//! target. The reconciler only reads it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{DisruptionsSpec, NodeType, UpdateSpec};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "deckhouse.io",
    version = "v1",
    kind = "NodeGroup",
    status = "NodeGroupStatus",
    shortname = "ng",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.nodeType"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".status.desired"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSpec {
    #[serde(default)]
    pub node_type: NodeType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disruptions: Option<DisruptionsSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdateSpec>,
}

/// Observed state of a NodeGroup, maintained by the platform
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupStatus {
    /// Number of nodes the group should have
    #[serde(default)]
    pub desired: i32,

    /// Number of nodes currently Ready
    #[serde(default)]
    pub ready: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<i32>,
}

impl NodeGroupSpec {
    /// The raw approval mode string, if one was set
    pub fn approval_mode(&self) -> Option<&str> {
        self.disruptions
            .as_ref()
            .and_then(|d| d.approval_mode.as_deref())
    }

    /// The configured drain concurrency, if one was set
    pub fn max_concurrent(&self) -> Option<i32> {
        self.update.as_ref().and_then(|u| u.max_concurrent)
    }
}
