//! Cluster state snapshot
//!
//! One pass works on a single frozen view of NodeGroups, the configuration
//! checksum record and Nodes. Building the view either succeeds in full or
//! fails the pass; the reconciler never acts on a partial view.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::ResourceExt;

use crate::crd::NodeGroup;
use crate::error::{Error, Result};

use super::phase::ProgressMarker;
use super::reconciler::ReconcilerConfig;

/// Label naming the NodeGroup a Node belongs to
pub const NODE_GROUP_LABEL: &str = "node.deckhouse.io/group";

/// Checksum of the configuration last applied to the Node
pub const CONFIGURATION_CHECKSUM_ANNOTATION: &str = "node.deckhouse.io/configuration-checksum";

/// Presence marks a requested drain
pub const DRAINING_ANNOTATION: &str = "update.node.deckhouse.io/draining";

/// Presence marks a finished drain
pub const DRAINED_ANNOTATION: &str = "update.node.deckhouse.io/drained";

/// Records that this reconciler set `spec.unschedulable`
pub const CORDONED_BY_ANNOTATION: &str = "update.node.deckhouse.io/cordoned-by";

/// Value written to [`CORDONED_BY_ANNOTATION`]
pub const CORDON_OWNER: &str = "nodegroup-drainer";

pub const DEFAULT_CHECKSUM_SECRET: &str = "configuration-checksums";
pub const DEFAULT_CHECKSUM_NAMESPACE: &str = "d8-cloud-instance-manager";

/// The parts of a Node the reconciler reads
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeRecord {
    pub name: String,
    pub group: Option<String>,
    pub applied_checksum: Option<String>,
    pub draining: bool,
    pub drained: bool,
    pub unschedulable: bool,
    pub cordoned_by_us: bool,
    pub resource_version: Option<String>,
}

impl NodeRecord {
    pub fn from_node(node: &Node) -> Result<Self> {
        let name = node
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::SnapshotError("Node object without metadata.name".to_string()))?;

        let annotations = node.annotations();
        Ok(Self {
            name,
            group: node.labels().get(NODE_GROUP_LABEL).cloned(),
            applied_checksum: annotations.get(CONFIGURATION_CHECKSUM_ANNOTATION).cloned(),
            draining: annotations.contains_key(DRAINING_ANNOTATION),
            drained: annotations.contains_key(DRAINED_ANNOTATION),
            unschedulable: node
                .spec
                .as_ref()
                .and_then(|s| s.unschedulable)
                .unwrap_or(false),
            cordoned_by_us: annotations
                .get(CORDONED_BY_ANNOTATION)
                .is_some_and(|owner| owner == CORDON_OWNER),
            resource_version: node.metadata.resource_version.clone(),
        })
    }

    pub fn marker(&self) -> ProgressMarker {
        ProgressMarker::from_flags(self.draining, self.drained)
    }
}

/// Everything one pass needs, as of one logical instant
#[derive(Clone, Debug, Default)]
pub struct ClusterSnapshot {
    pub node_groups: BTreeMap<String, NodeGroup>,
    /// NodeGroup name to configuration checksum
    pub checksums: BTreeMap<String, String>,
    /// Sorted by name
    pub nodes: Vec<NodeRecord>,
}

impl ClusterSnapshot {
    /// Build a snapshot from raw API objects.
    ///
    /// A missing checksum Secret is an empty record. Values that are not
    /// UTF-8 and Nodes without a name make the snapshot malformed.
    pub fn from_objects(
        node_groups: Vec<NodeGroup>,
        checksums: Option<&Secret>,
        nodes: &[Node],
    ) -> Result<Self> {
        let node_groups = node_groups
            .into_iter()
            .map(|ng| (ng.name_any(), ng))
            .collect();

        let mut checksum_map = BTreeMap::new();
        if let Some(secret) = checksums {
            if let Some(string_data) = &secret.string_data {
                checksum_map.extend(string_data.clone());
            }
            if let Some(data) = &secret.data {
                for (group, value) in data {
                    let checksum = String::from_utf8(value.0.clone()).map_err(|_| {
                        Error::SnapshotError(format!(
                            "checksum for NodeGroup {} in Secret {} is not valid UTF-8",
                            group,
                            secret.name_any()
                        ))
                    })?;
                    checksum_map.insert(group.clone(), checksum);
                }
            }
        }

        let mut records = nodes
            .iter()
            .map(NodeRecord::from_node)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Self {
            node_groups,
            checksums: checksum_map,
            nodes: records,
        })
    }

    pub fn fingerprint(&self, group: &str) -> Option<&str> {
        self.checksums.get(group).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.node_groups.is_empty() && self.nodes.is_empty()
    }
}

/// Source of cluster snapshots
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Read NodeGroups, the checksum record and Nodes in one go.
    async fn snapshot(&self, config: &ReconcilerConfig) -> Result<ClusterSnapshot>;
}
