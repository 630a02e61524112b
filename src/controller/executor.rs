//! Transition executor
//!
//! Turns a [`Classification`] into the smallest set of annotation and
//! schedulability changes that realise the target phase, and writes them as
//! conditional updates guarded by the Node's last observed resourceVersion.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, NodeSpec};
use serde_json::{json, Map, Value};
use tracing::{debug, instrument};

use crate::error::Result;

use super::drain::DrainPrimitive;
use super::phase::{Classification, NodePhase};
use super::snapshot::{
    NodeRecord, CORDONED_BY_ANNOTATION, CORDON_OWNER, DRAINED_ANNOTATION, DRAINING_ANNOTATION,
};

/// Single-object write against a Node
#[async_trait]
pub trait NodeWriter: Send + Sync {
    /// Apply `patch` to the Node only if its resourceVersion still equals
    /// `resource_version`. Returns the resourceVersion after the write.
    ///
    /// A lost race is reported as [`crate::Error::ConflictError`].
    async fn patch_node(
        &self,
        name: &str,
        resource_version: Option<&str>,
        patch: &NodePatch,
    ) -> Result<Option<String>>;
}

/// Annotation and schedulability delta for one Node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodePatch {
    /// `Some` sets the annotation, `None` removes it
    pub annotations: BTreeMap<String, Option<String>>,
    /// `Some(true)` cordons, `Some(false)` uncordons
    pub unschedulable: Option<bool>,
}

impl NodePatch {
    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty() && self.unschedulable.is_none()
    }

    fn set(&mut self, key: &str, value: &str) {
        self.annotations
            .insert(key.to_string(), Some(value.to_string()));
    }

    fn remove(&mut self, key: &str) {
        self.annotations.insert(key.to_string(), None);
    }

    /// JSON merge patch carrying `resource_version` as a precondition.
    pub fn to_merge_patch(&self, resource_version: Option<&str>) -> Value {
        let mut metadata = Map::new();
        if let Some(rv) = resource_version {
            metadata.insert("resourceVersion".to_string(), json!(rv));
        }
        if !self.annotations.is_empty() {
            let annotations: Map<String, Value> = self
                .annotations
                .iter()
                .map(|(k, v)| (k.clone(), v.as_ref().map_or(Value::Null, |v| json!(v))))
                .collect();
            metadata.insert("annotations".to_string(), Value::Object(annotations));
        }

        let mut patch = json!({ "metadata": metadata });
        if let Some(unschedulable) = self.unschedulable {
            // Uncordon removes the field rather than writing `false`.
            let value = if unschedulable { json!(true) } else { Value::Null };
            patch["spec"] = json!({ "unschedulable": value });
        }
        patch
    }

    /// Apply the delta to an in-memory Node with merge-patch semantics.
    pub fn apply_to(&self, node: &mut Node) {
        if !self.annotations.is_empty() {
            let annotations = node.metadata.annotations.get_or_insert_with(BTreeMap::new);
            for (key, value) in &self.annotations {
                match value {
                    Some(v) => {
                        annotations.insert(key.clone(), v.clone());
                    }
                    None => {
                        annotations.remove(key);
                    }
                }
            }
        }
        if let Some(unschedulable) = self.unschedulable {
            let spec = node.spec.get_or_insert_with(NodeSpec::default);
            spec.unschedulable = if unschedulable { Some(true) } else { None };
        }
    }
}

/// Everything needed to move one node to its target phase
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeMutation {
    /// Written before the drain primitive runs
    pub cordon: Option<NodePatch>,
    /// Run the node-drain primitive
    pub drain: bool,
    /// Marker changes written last
    pub patch: NodePatch,
}

impl NodeMutation {
    pub fn is_noop(&self) -> bool {
        self.cordon.is_none() && !self.drain && self.patch.is_empty()
    }
}

/// Per-node execution settings decided by the driver
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecutorOptions {
    /// Hold a cordon on this node while it waits for manual approval.
    /// When unset, a cordon we placed earlier is released.
    pub cordon_pending_approval: bool,
}

/// Compute the mutation that moves `node` from its current to its target phase.
///
/// Every change is conditional on the node not already being in the wanted
/// state, so planning against a node that already reached the target yields
/// a no-op.
pub fn plan(node: &NodeRecord, transition: &Classification, opts: &ExecutorOptions) -> NodeMutation {
    let mut mutation = NodeMutation::default();
    let patch = &mut mutation.patch;

    match transition.target {
        NodePhase::UpToDate | NodePhase::NeedsUpdate => {
            want_markers(node, patch, false, false);
            release_cordon(node, patch);
        }
        NodePhase::PendingApproval => {
            want_markers(node, patch, false, false);
            if opts.cordon_pending_approval {
                claim_cordon(node, patch);
            } else {
                release_cordon(node, patch);
            }
        }
        NodePhase::Draining => {
            want_markers(node, patch, true, false);
            claim_cordon(node, patch);
        }
        NodePhase::Drained if transition.completes_drain() => {
            let mut cordon = NodePatch::default();
            claim_cordon(node, &mut cordon);
            if !cordon.is_empty() {
                mutation.cordon = Some(cordon);
            }
            mutation.drain = true;
            want_markers(node, patch, false, true);
        }
        NodePhase::Drained => {
            want_markers(node, patch, false, true);
        }
    }

    mutation
}

fn want_markers(node: &NodeRecord, patch: &mut NodePatch, draining: bool, drained: bool) {
    match (node.draining, draining) {
        (false, true) => patch.set(DRAINING_ANNOTATION, ""),
        (true, false) => patch.remove(DRAINING_ANNOTATION),
        _ => {}
    }
    match (node.drained, drained) {
        (false, true) => patch.set(DRAINED_ANNOTATION, ""),
        (true, false) => patch.remove(DRAINED_ANNOTATION),
        _ => {}
    }
}

/// Cordon the node and record ownership, unless someone else already cordoned it.
fn claim_cordon(node: &NodeRecord, patch: &mut NodePatch) {
    if !node.unschedulable {
        patch.unschedulable = Some(true);
        patch.set(CORDONED_BY_ANNOTATION, CORDON_OWNER);
    }
}

/// Undo a cordon only if this reconciler set it.
fn release_cordon(node: &NodeRecord, patch: &mut NodePatch) {
    if node.cordoned_by_us {
        if node.unschedulable {
            patch.unschedulable = Some(false);
        }
        patch.remove(CORDONED_BY_ANNOTATION);
    }
}

/// Execute a planned mutation. Returns whether anything was written.
///
/// The cordon write (if any) and the marker write are chained through the
/// resourceVersion returned by the previous write, so a concurrent writer
/// anywhere in between makes the later write fail instead of clobbering it.
#[instrument(skip(cluster, node, mutation), fields(node = %node.name))]
pub async fn apply<C>(cluster: &C, node: &NodeRecord, mutation: &NodeMutation) -> Result<bool>
where
    C: NodeWriter + DrainPrimitive + ?Sized,
{
    if mutation.is_noop() {
        return Ok(false);
    }

    let mut version = node.resource_version.clone();

    if let Some(cordon) = &mutation.cordon {
        debug!("Cordoning {} before drain", node.name);
        // A write that reports no new version keeps the old precondition.
        version = cluster
            .patch_node(&node.name, version.as_deref(), cordon)
            .await?
            .or(version);
    }

    if mutation.drain {
        cluster.drain_node(&node.name).await?;
    }

    if !mutation.patch.is_empty() {
        cluster
            .patch_node(&node.name, version.as_deref(), &mutation.patch)
            .await?;
    }

    Ok(true)
}
