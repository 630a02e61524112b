//! Kubernetes-backed cluster access
//!
//! Reads the snapshot through list/get calls and writes Node changes as
//! JSON merge patches carrying `metadata.resourceVersion`, which the API
//! server treats as a precondition (HTTP 409 on mismatch).

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    Client,
};
use tracing::{debug, instrument};

use crate::crd::NodeGroup;
use crate::error::{Error, Result};

use super::drain::{DrainPrimitive, KubeDrainer};
use super::executor::{NodePatch, NodeWriter};
use super::reconciler::ReconcilerConfig;
use super::snapshot::{ClusterSnapshot, SnapshotSource};

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "nodegroup-drainer";

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    drainer: KubeDrainer,
}

impl KubeCluster {
    pub fn new(client: Client, concurrent_evictions: usize) -> Self {
        Self {
            drainer: KubeDrainer::new(client.clone(), concurrent_evictions),
            client,
        }
    }
}

fn snapshot_error(what: &str, e: kube::Error) -> Error {
    Error::SnapshotError(format!("failed to read {}: {}", what, e))
}

#[async_trait]
impl SnapshotSource for KubeCluster {
    #[instrument(skip(self, config))]
    async fn snapshot(&self, config: &ReconcilerConfig) -> Result<ClusterSnapshot> {
        let node_groups: Api<NodeGroup> = Api::all(self.client.clone());
        let secrets: Api<Secret> =
            Api::namespaced(self.client.clone(), &config.checksum_namespace);
        let nodes: Api<Node> = Api::all(self.client.clone());

        let node_groups = node_groups
            .list(&ListParams::default())
            .await
            .map_err(|e| snapshot_error("NodeGroups", e))?;
        let checksums = secrets
            .get_opt(&config.checksum_secret)
            .await
            .map_err(|e| {
                snapshot_error(
                    &format!(
                        "Secret {}/{}",
                        config.checksum_namespace, config.checksum_secret
                    ),
                    e,
                )
            })?;
        let nodes = nodes
            .list(&ListParams::default())
            .await
            .map_err(|e| snapshot_error("Nodes", e))?;

        ClusterSnapshot::from_objects(node_groups.items, checksums.as_ref(), &nodes.items)
    }
}

#[async_trait]
impl NodeWriter for KubeCluster {
    #[instrument(skip(self, patch))]
    async fn patch_node(
        &self,
        name: &str,
        resource_version: Option<&str>,
        patch: &NodePatch,
    ) -> Result<Option<String>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let body = patch.to_merge_patch(resource_version);
        debug!("Patching node {}: {}", name, body);

        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match api.patch(name, &params, &Patch::Merge(&body)).await {
            Ok(node) => Ok(node.metadata.resource_version),
            Err(kube::Error::Api(e)) if e.code == 409 => Err(Error::ConflictError(name.to_string())),
            Err(e) => Err(Error::KubeError(e)),
        }
    }
}

#[async_trait]
impl DrainPrimitive for KubeCluster {
    async fn drain_node(&self, name: &str) -> Result<()> {
        self.drainer.drain_node(name).await
    }
}
