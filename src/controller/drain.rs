//! Node-drain primitive
//!
//! Evicts the workloads of a cordoned Node through the Eviction API, which
//! respects PodDisruptionBudgets. The reconciler only decides *when* to
//! drain; this module is the *how*.
//!
//! Unlike `kubectl drain` this does not wait for evicted pods to terminate
//! and does not retry within a call: any eviction that is refused fails the
//! drain, and the Node stays in `Draining` until the next pass tries again.

use async_trait::async_trait;
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, EvictParams, ListParams},
    Client, ResourceExt,
};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};

/// Evictions submitted concurrently per node
pub const DEFAULT_CONCURRENT_EVICTIONS: usize = 5;

/// Annotation present on static mirror pods
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

#[async_trait]
pub trait DrainPrimitive: Send + Sync {
    /// Evict everything evictable from the Node.
    async fn drain_node(&self, name: &str) -> Result<()>;
}

/// Drains nodes through the Kubernetes Eviction API
#[derive(Clone)]
pub struct KubeDrainer {
    client: Client,
    concurrent_evictions: usize,
}

impl KubeDrainer {
    pub fn new(client: Client, concurrent_evictions: usize) -> Self {
        Self {
            client,
            concurrent_evictions: concurrent_evictions.max(1),
        }
    }

    async fn target_pods(&self, node_name: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let list = pods
            .list(&ListParams::default().fields(&format!("spec.nodeName={}", node_name)))
            .await?;
        Ok(list.items.into_iter().filter(is_drain_target).collect())
    }

    async fn evict(&self, pod: &Pod) -> std::result::Result<(), String> {
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let name = pod.name_any();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        match api.evict(&name, &EvictParams::default()).await {
            Ok(_) => {
                debug!("Evicted pod {}/{}", namespace, name);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 429 => Err(format!(
                "{}/{}: eviction refused by a PodDisruptionBudget",
                namespace, name
            )),
            Err(e) => Err(format!("{}/{}: {}", namespace, name, e)),
        }
    }
}

#[async_trait]
impl DrainPrimitive for KubeDrainer {
    #[instrument(skip(self))]
    async fn drain_node(&self, name: &str) -> Result<()> {
        let pods = self.target_pods(name).await?;
        info!("Draining node {}: evicting {} pods", name, pods.len());

        let evictions: Vec<_> = pods.iter().map(|pod| self.evict(pod)).collect();
        let failures: Vec<String> = stream::iter(evictions)
            .buffer_unordered(self.concurrent_evictions)
            .filter_map(|res| async move { res.err() })
            .collect()
            .await;

        if failures.is_empty() {
            Ok(())
        } else {
            warn!("Drain of node {} incomplete: {:?}", name, failures);
            Err(Error::DrainError {
                node: name.to_string(),
                message: failures.join("; "),
            })
        }
    }
}

/// Whether a pod must be evicted for its node to count as drained.
///
/// DaemonSet pods are skipped because the DaemonSet controller ignores
/// cordons, mirror pods because they cannot be controlled through the API,
/// and finished pods because they hold no workload.
pub fn is_drain_target(pod: &Pod) -> bool {
    if let Some(phase) = pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        if phase == "Succeeded" || phase == "Failed" {
            return false;
        }
    }

    if pod
        .owner_references()
        .iter()
        .any(|r| r.controller == Some(true) && r.kind == "DaemonSet")
    {
        return false;
    }

    !pod.annotations().contains_key(MIRROR_POD_ANNOTATION)
}
