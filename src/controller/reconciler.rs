//! Reconciliation driver
//!
//! One call to [`run_pass`] is one complete pass: snapshot, resolve the
//! policy of every referenced NodeGroup, classify every node, then execute
//! the transitions. The driver keeps no state between passes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::error::Result;

use super::drain::DrainPrimitive;
use super::executor::{self, ExecutorOptions, NodeWriter};
use super::phase::{classify, Classification, GroupView, NodePhase};
use super::policy::{self, DisruptionPolicy};
use super::snapshot::{
    ClusterSnapshot, NodeRecord, SnapshotSource, DEFAULT_CHECKSUM_NAMESPACE,
    DEFAULT_CHECKSUM_SECRET,
};

/// Everything the reconciler needs from the cluster
pub trait Cluster: SnapshotSource + NodeWriter + DrainPrimitive {}

impl<T: SnapshotSource + NodeWriter + DrainPrimitive> Cluster for T {}

/// Shared state between the trigger loop and the REST API
pub struct ControllerState {
    pub cluster: Arc<dyn Cluster>,
    pub config: ReconcilerConfig,
    /// Report of the most recent successful pass
    pub last_report: RwLock<Option<PassReport>>,
}

impl ControllerState {
    pub fn new(cluster: Arc<dyn Cluster>, config: ReconcilerConfig) -> Self {
        Self {
            cluster,
            config,
            last_report: RwLock::new(None),
        }
    }

    /// Run one pass and remember its report.
    pub async fn reconcile(&self) -> Result<PassReport> {
        let report = run_pass(self.cluster.as_ref(), &self.config).await?;
        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }
}

/// Settings that reach the core
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Name of the Secret holding per-group configuration checksums
    pub checksum_secret: String,
    pub checksum_namespace: String,
    /// Cordon nodes of `Manual` groups while they wait for approval
    pub cordon_pending_approval: bool,
    /// Plan transitions without writing them
    pub dry_run: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            checksum_secret: DEFAULT_CHECKSUM_SECRET.to_string(),
            checksum_namespace: DEFAULT_CHECKSUM_NAMESPACE.to_string(),
            cordon_pending_approval: false,
            dry_run: false,
        }
    }
}

/// What happened to one node during a pass
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum OutcomeResult {
    /// Already in the target state
    Unchanged,
    /// Mutations written
    Applied,
    /// Mutations computed but not written (dry run)
    Planned,
    /// Writing failed; retried on the next pass
    Failed { kind: String, message: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeOutcome {
    pub node: String,
    pub group: Option<String>,
    pub from: NodePhase,
    pub to: NodePhase,
    pub result: OutcomeResult,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSummary {
    pub policy: Option<DisruptionPolicy>,
    /// Nodes in Draining or Drained, plus nodes cordoned while pending
    /// approval, after this pass's decisions
    pub in_flight: u32,
}

/// Per-node outcome of one pass
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub dry_run: bool,
    pub groups: BTreeMap<String, GroupSummary>,
    pub policy_errors: Vec<String>,
    pub nodes: Vec<NodeOutcome>,
}

impl PassReport {
    pub fn applied(&self) -> usize {
        self.count(|r| matches!(r, OutcomeResult::Applied))
    }

    pub fn failed(&self) -> usize {
        self.count(|r| matches!(r, OutcomeResult::Failed { .. }))
    }

    pub fn outcome(&self, node: &str) -> Option<&NodeOutcome> {
        self.nodes.iter().find(|o| o.node == node)
    }

    fn count(&self, pred: impl Fn(&OutcomeResult) -> bool) -> usize {
        self.nodes.iter().filter(|o| pred(&o.result)).count()
    }
}

/// Drain slots of one group during a pass
#[derive(Clone, Copy, Debug)]
struct GroupBudget {
    policy: Option<DisruptionPolicy>,
    in_flight: u32,
}

impl GroupBudget {
    fn has_free_slot(&self) -> bool {
        self.policy
            .map(|p| self.in_flight < p.concurrency_budget)
            .unwrap_or(false)
    }
}

/// The classifier's view of a node's group, or `None` when the node is not
/// managed by any fingerprinted NodeGroup.
fn group_view<'a>(
    snapshot: &'a ClusterSnapshot,
    budgets: &BTreeMap<String, GroupBudget>,
    node: &NodeRecord,
) -> Option<GroupView<'a>> {
    let group = node.group.as_deref()?;
    let budget = budgets.get(group)?;
    let fingerprint = snapshot.fingerprint(group)?;
    Some(GroupView {
        fingerprint,
        approval: budget.policy.map(|p| p.approval_mode),
        has_free_slot: budget.has_free_slot(),
    })
}

/// A node waiting for approval that still carries our cordon keeps its slot.
fn holds_pending_cordon(
    node: &NodeRecord,
    classification: &Classification,
    config: &ReconcilerConfig,
) -> bool {
    config.cordon_pending_approval
        && classification.target == NodePhase::PendingApproval
        && node.cordoned_by_us
        && node.unschedulable
}

/// Resolve policies and count nodes already out of service, per group.
fn resolve_budgets(
    snapshot: &ClusterSnapshot,
    config: &ReconcilerConfig,
    policy_errors: &mut Vec<String>,
) -> BTreeMap<String, GroupBudget> {
    let mut budgets = BTreeMap::new();

    for group in snapshot.nodes.iter().filter_map(|n| n.group.as_deref()) {
        if budgets.contains_key(group) {
            continue;
        }
        let Some(node_group) = snapshot.node_groups.get(group) else {
            continue;
        };
        let policy = match policy::resolve(node_group) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("{}; leaving its nodes untouched until fixed", e);
                #[cfg(feature = "metrics")]
                super::metrics::inc_pass_error(e.kind());
                policy_errors.push(e.to_string());
                None
            }
        };
        budgets.insert(
            group.to_string(),
            GroupBudget {
                policy,
                in_flight: 0,
            },
        );
    }

    // Nodes already out of service hold their slot regardless of name order.
    // A stale marker that is about to be cleared does not.
    for node in &snapshot.nodes {
        let Some(view) = group_view(snapshot, &budgets, node) else {
            continue;
        };
        let c = classify(node, Some(&view));
        let out_of_service = c.current.is_out_of_service() && c.target.is_out_of_service();
        if out_of_service || holds_pending_cordon(node, &c, config) {
            if let Some(group) = node.group.as_deref().and_then(|g| budgets.get_mut(g)) {
                group.in_flight += 1;
            }
        }
    }

    budgets
}

/// Classify every node in name order, handing out free slots as it goes.
///
/// A slot is taken by a newly initiated drain, or by a node newly cordoned
/// while it waits for approval.
fn classify_all(
    snapshot: &ClusterSnapshot,
    config: &ReconcilerConfig,
    budgets: &mut BTreeMap<String, GroupBudget>,
) -> Vec<(Classification, ExecutorOptions)> {
    let mut classifications = Vec::with_capacity(snapshot.nodes.len());

    for node in &snapshot.nodes {
        let view = group_view(snapshot, budgets, node);
        let has_free_slot = view.is_some_and(|v| v.has_free_slot);
        let classification = classify(node, view.as_ref());

        let early_cordon = config.cordon_pending_approval
            && classification.target == NodePhase::PendingApproval;
        let (takes_slot, cordon_pending_approval) =
            if holds_pending_cordon(node, &classification, config) {
                (false, true)
            } else if early_cordon && !node.unschedulable && has_free_slot {
                (true, true)
            } else {
                (classification.initiates_drain(), false)
            };

        if takes_slot {
            if let Some(group) = node.group.as_deref().and_then(|g| budgets.get_mut(g)) {
                group.in_flight += 1;
            }
        }
        classifications.push((
            classification,
            ExecutorOptions {
                cordon_pending_approval,
            },
        ));
    }

    classifications
}

/// Run one reconciliation pass.
///
/// A snapshot failure aborts the pass before anything is written. Failures
/// writing an individual node are recorded in its outcome and do not stop
/// the pass.
#[instrument(skip(cluster, config), fields(dry_run = config.dry_run))]
pub async fn run_pass<C>(cluster: &C, config: &ReconcilerConfig) -> Result<PassReport>
where
    C: Cluster + ?Sized,
{
    let started_at = Utc::now();
    let timer = Instant::now();

    let snapshot = match cluster.snapshot(config).await {
        Ok(s) => s,
        Err(e) => {
            error!("Abandoning pass, cluster snapshot failed: {}", e);
            #[cfg(feature = "metrics")]
            super::metrics::inc_pass_error(e.kind());
            return Err(e);
        }
    };

    debug!(
        "Snapshot: {} node groups, {} checksums, {} nodes",
        snapshot.node_groups.len(),
        snapshot.checksums.len(),
        snapshot.nodes.len()
    );

    let mut policy_errors = Vec::new();
    let mut budgets = resolve_budgets(&snapshot, config, &mut policy_errors);
    let classifications = classify_all(&snapshot, config, &mut budgets);

    let mut outcomes = Vec::with_capacity(snapshot.nodes.len());

    for (node, (classification, opts)) in snapshot.nodes.iter().zip(classifications) {
        let mutation = executor::plan(node, &classification, &opts);

        let result = if mutation.is_noop() {
            OutcomeResult::Unchanged
        } else if config.dry_run {
            info!(
                "[DRY-RUN] Would move node {} from {} to {}: {:?}",
                node.name, classification.current, classification.target, mutation
            );
            OutcomeResult::Planned
        } else {
            match executor::apply(cluster, node, &mutation).await {
                Ok(_) => {
                    info!(
                        "Node {} moved from {} to {}",
                        node.name, classification.current, classification.target
                    );
                    #[cfg(feature = "metrics")]
                    super::metrics::inc_transition(
                        node.group.as_deref().unwrap_or_default(),
                        classification.current.as_str(),
                        classification.target.as_str(),
                    );
                    OutcomeResult::Applied
                }
                Err(e) => {
                    warn!(
                        "Failed to move node {} from {} to {}: {}",
                        node.name, classification.current, classification.target, e
                    );
                    #[cfg(feature = "metrics")]
                    super::metrics::inc_node_failure(
                        node.group.as_deref().unwrap_or_default(),
                        e.kind(),
                    );
                    OutcomeResult::Failed {
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    }
                }
            }
        };

        outcomes.push(NodeOutcome {
            node: node.name.clone(),
            group: node.group.clone(),
            from: classification.current,
            to: classification.target,
            result,
        });
    }

    let groups: BTreeMap<String, GroupSummary> = budgets
        .into_iter()
        .map(|(name, b)| {
            (
                name,
                GroupSummary {
                    policy: b.policy,
                    in_flight: b.in_flight,
                },
            )
        })
        .collect();

    #[cfg(feature = "metrics")]
    {
        super::metrics::set_in_flight(
            groups
                .iter()
                .map(|(name, summary)| (name.as_str(), summary.in_flight)),
        );
        super::metrics::observe_pass_duration_seconds(timer.elapsed().as_secs_f64());
    }

    let report = PassReport {
        started_at,
        duration_ms: timer.elapsed().as_millis() as u64,
        dry_run: config.dry_run,
        groups,
        policy_errors,
        nodes: outcomes,
    };

    info!(
        "Pass complete: {} nodes, {} changed, {} failed",
        report.nodes.len(),
        report.applied(),
        report.failed()
    );

    Ok(report)
}
