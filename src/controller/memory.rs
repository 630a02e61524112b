//! In-memory cluster
//!
//! Holds real `k8s-openapi` objects and behaves like the API server where the
//! reconciler can tell the difference: writes are compare-and-swap on
//! resourceVersion, patches use merge semantics, and missing objects are 404s.
//! Conflicts, drain failures and an unreachable API can be injected.
//!
//! Backs the `plan` subcommand and the test suites.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::ResourceExt;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::crd::NodeGroup;
use crate::error::{Error, Result};

use super::drain::DrainPrimitive;
use super::executor::{NodePatch, NodeWriter};
use super::reconciler::ReconcilerConfig;
use super::snapshot::{ClusterSnapshot, SnapshotSource};

#[derive(Default)]
struct State {
    node_groups: BTreeMap<String, NodeGroup>,
    /// Keyed by (namespace, name)
    secrets: BTreeMap<(String, String), Secret>,
    nodes: BTreeMap<String, Node>,
    next_version: u64,
    unavailable: bool,
    conflicts: BTreeSet<String>,
    drain_failures: BTreeSet<String>,
    drained: Vec<String>,
    writes: usize,
}

impl State {
    fn bump_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<State>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load NodeGroups, Nodes and Secrets from a multi-document YAML string.
    /// Documents of other kinds are ignored.
    pub fn from_manifests(yaml: &str) -> Result<Self> {
        let mut state = State::default();

        for document in serde_yaml::Deserializer::from_str(yaml) {
            let value = serde_yaml::Value::deserialize(document)?;
            if value.is_null() {
                continue;
            }
            let kind = value
                .get("kind")
                .and_then(|k| k.as_str())
                .unwrap_or_default()
                .to_string();

            match kind.as_str() {
                "NodeGroup" => {
                    let ng: NodeGroup = serde_yaml::from_value(value)?;
                    state.node_groups.insert(ng.name_any(), ng);
                }
                "Node" => {
                    let mut node: Node = serde_yaml::from_value(value)?;
                    if node.metadata.resource_version.is_none() {
                        node.metadata.resource_version = Some(state.bump_version());
                    }
                    state.nodes.insert(node.name_any(), node);
                }
                "Secret" => {
                    let secret: Secret = serde_yaml::from_value(value)?;
                    let key = (
                        secret.namespace().unwrap_or_else(|| "default".to_string()),
                        secret.name_any(),
                    );
                    state.secrets.insert(key, secret);
                }
                other => debug!("Ignoring manifest of kind {:?}", other),
            }
        }

        Ok(Self {
            state: Mutex::new(state),
        })
    }

    pub fn from_manifest_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_manifests(&yaml)
    }

    pub async fn add_node_group(&self, node_group: NodeGroup) {
        let mut state = self.state.lock().await;
        state.node_groups.insert(node_group.name_any(), node_group);
    }

    pub async fn add_node(&self, mut node: Node) {
        let mut state = self.state.lock().await;
        node.metadata.resource_version = Some(state.bump_version());
        state.nodes.insert(node.name_any(), node);
    }

    /// Replace the checksum record for `namespace/name`.
    pub async fn set_checksums(&self, namespace: &str, name: &str, checksums: &[(&str, &str)]) {
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(
                checksums
                    .iter()
                    .map(|(group, sum)| {
                        (
                            group.to_string(),
                            k8s_openapi::ByteString(sum.as_bytes().to_vec()),
                        )
                    })
                    .collect(),
            ),
            ..Default::default()
        };
        let mut state = self.state.lock().await;
        state
            .secrets
            .insert((namespace.to_string(), name.to_string()), secret);
    }

    /// Modify a Node out of band, as another controller or an operator would.
    pub async fn update_node(&self, name: &str, f: impl FnOnce(&mut Node)) {
        let mut state = self.state.lock().await;
        let version = state.bump_version();
        if let Some(node) = state.nodes.get_mut(name) {
            f(node);
            node.metadata.resource_version = Some(version);
        }
    }

    pub async fn node(&self, name: &str) -> Option<Node> {
        self.state.lock().await.nodes.get(name).cloned()
    }

    pub async fn nodes(&self) -> Vec<Node> {
        self.state.lock().await.nodes.values().cloned().collect()
    }

    /// Make the next write to `node` lose an optimistic-concurrency race.
    pub async fn inject_conflict(&self, node: &str) {
        self.state.lock().await.conflicts.insert(node.to_string());
    }

    /// Make every drain of `node` fail until cleared.
    pub async fn fail_drain(&self, node: &str, fail: bool) {
        let mut state = self.state.lock().await;
        if fail {
            state.drain_failures.insert(node.to_string());
        } else {
            state.drain_failures.remove(node);
        }
    }

    /// Make snapshots fail as if the API server were unreachable.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Nodes handed to the drain primitive, in call order.
    pub async fn drained_nodes(&self) -> Vec<String> {
        self.state.lock().await.drained.clone()
    }

    /// Successful node writes so far.
    pub async fn write_count(&self) -> usize {
        self.state.lock().await.writes
    }
}

#[async_trait]
impl SnapshotSource for InMemoryCluster {
    async fn snapshot(&self, config: &ReconcilerConfig) -> Result<ClusterSnapshot> {
        let state = self.state.lock().await;
        if state.unavailable {
            return Err(Error::SnapshotError(
                "failed to read NodeGroups: connection refused".to_string(),
            ));
        }

        let checksums = state.secrets.get(&(
            config.checksum_namespace.clone(),
            config.checksum_secret.clone(),
        ));
        let nodes: Vec<Node> = state.nodes.values().cloned().collect();
        ClusterSnapshot::from_objects(
            state.node_groups.values().cloned().collect(),
            checksums,
            &nodes,
        )
    }
}

#[async_trait]
impl NodeWriter for InMemoryCluster {
    async fn patch_node(
        &self,
        name: &str,
        resource_version: Option<&str>,
        patch: &NodePatch,
    ) -> Result<Option<String>> {
        let mut state = self.state.lock().await;

        if state.conflicts.remove(name) {
            return Err(Error::ConflictError(name.to_string()));
        }

        let version = state.bump_version();
        let node = state.nodes.get_mut(name).ok_or_else(|| {
            Error::KubeError(kube::Error::Api(kube::core::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("nodes \"{}\" not found", name),
                reason: "NotFound".to_string(),
                code: 404,
            }))
        })?;

        if let Some(expected) = resource_version {
            if node.metadata.resource_version.as_deref() != Some(expected) {
                return Err(Error::ConflictError(name.to_string()));
            }
        }

        patch.apply_to(node);
        node.metadata.resource_version = Some(version.clone());
        state.writes += 1;
        Ok(Some(version))
    }
}

#[async_trait]
impl DrainPrimitive for InMemoryCluster {
    async fn drain_node(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.drain_failures.contains(name) {
            return Err(Error::DrainError {
                node: name.to_string(),
                message: "eviction refused by a PodDisruptionBudget".to_string(),
            });
        }
        state.drained.push(name.to_string());
        Ok(())
    }
}
