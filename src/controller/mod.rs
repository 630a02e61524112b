//! Controller module for node-group drain reconciliation
//! This module contains the reconciliation pass, the node phase classifier,
//! and the cluster adapters it runs against.

pub mod drain;
pub mod executor;
pub mod kube_cluster;
pub mod memory;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod phase;
pub mod policy;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
pub mod snapshot;

pub use drain::{DrainPrimitive, KubeDrainer, DEFAULT_CONCURRENT_EVICTIONS};
pub use executor::{NodeMutation, NodePatch, NodeWriter};
pub use kube_cluster::KubeCluster;
pub use memory::InMemoryCluster;
pub use phase::{classify, Classification, GroupView, NodePhase, ProgressMarker};
pub use policy::DisruptionPolicy;
pub use reconciler::{
    run_pass, Cluster, ControllerState, GroupSummary, NodeOutcome, OutcomeResult, PassReport,
    ReconcilerConfig,
};
pub use snapshot::{ClusterSnapshot, NodeRecord, SnapshotSource};
