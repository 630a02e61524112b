//! Tests for the reconciler module
//!
//! These tests run whole passes against an in-memory cluster and verify:
//! - Stale-marker cleanup and empty clusters
//! - Drain initiation within the group budget, in name order
//! - Completion of requested drains under either approval mode
//! - Return to service once the new configuration is applied
//! - Per-node failures, conflicts and dry runs

#[cfg(test)]
mod tests {
    use super::super::memory::InMemoryCluster;
    use super::super::phase::NodePhase;
    use super::super::reconciler::*;
    use super::super::snapshot::{
        NodeRecord, CONFIGURATION_CHECKSUM_ANNOTATION, CORDONED_BY_ANNOTATION, CORDON_OWNER,
        DEFAULT_CHECKSUM_NAMESPACE, DEFAULT_CHECKSUM_SECRET, DRAINED_ANNOTATION,
        DRAINING_ANNOTATION, NODE_GROUP_LABEL,
    };
    use crate::crd::{
        DisruptionsSpec, NodeGroup, NodeGroupSpec, NodeGroupStatus, NodeType, UpdateSpec,
    };
    use crate::error::Error;
    use k8s_openapi::api::core::v1::{Node, NodeSpec};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    const FINGERPRINT: &str = "updated";

    fn node_group(name: &str, mode: &str, max_concurrent: Option<i32>) -> NodeGroup {
        let mut ng = NodeGroup::new(
            name,
            NodeGroupSpec {
                node_type: NodeType::Static,
                disruptions: Some(DisruptionsSpec {
                    approval_mode: Some(mode.to_string()),
                }),
                update: max_concurrent.map(|n| UpdateSpec {
                    max_concurrent: Some(n),
                }),
            },
        );
        ng.status = Some(NodeGroupStatus {
            desired: 3,
            ready: 3,
            nodes: Some(3),
        });
        ng
    }

    fn node(name: &str, group: &str, checksum: &str, markers: &[&str]) -> Node {
        let mut annotations = BTreeMap::from([(
            CONFIGURATION_CHECKSUM_ANNOTATION.to_string(),
            checksum.to_string(),
        )]);
        for marker in markers {
            annotations.insert(marker.to_string(), String::new());
        }
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(
                    NODE_GROUP_LABEL.to_string(),
                    group.to_string(),
                )])),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            status: None,
        }
    }

    async fn cluster_with(groups: Vec<NodeGroup>, nodes: Vec<Node>) -> InMemoryCluster {
        let cluster = InMemoryCluster::new();
        let mut checksums = Vec::new();
        for ng in groups {
            checksums.push(ng.metadata.name.clone().unwrap());
            cluster.add_node_group(ng).await;
        }
        let pairs: Vec<(&str, &str)> = checksums.iter().map(|g| (g.as_str(), FINGERPRINT)).collect();
        cluster
            .set_checksums(DEFAULT_CHECKSUM_NAMESPACE, DEFAULT_CHECKSUM_SECRET, &pairs)
            .await;
        for n in nodes {
            cluster.add_node(n).await;
        }
        cluster
    }

    async fn record(cluster: &InMemoryCluster, name: &str) -> NodeRecord {
        NodeRecord::from_node(&cluster.node(name).await.unwrap()).unwrap()
    }

    fn config() -> ReconcilerConfig {
        ReconcilerConfig::default()
    }

    #[tokio::test]
    async fn test_empty_cluster_is_noop() {
        let cluster = InMemoryCluster::new();
        let report = run_pass(&cluster, &config()).await.unwrap();

        assert!(report.nodes.is_empty());
        assert!(report.groups.is_empty());
        assert_eq!(cluster.write_count().await, 0);
    }

    #[tokio::test]
    async fn test_stale_marker_cleared_without_group() {
        let cluster = InMemoryCluster::new();
        cluster
            .add_node(node("orphan-1", "ghost", "old", &[DRAINING_ANNOTATION]))
            .await;

        let report = run_pass(&cluster, &config()).await.unwrap();

        let after = record(&cluster, "orphan-1").await;
        assert!(!after.draining);
        assert!(!after.drained);
        assert!(!after.unschedulable);
        assert_eq!(report.outcome("orphan-1").unwrap().to, NodePhase::UpToDate);
    }

    #[tokio::test]
    async fn test_requested_drains_complete_under_both_modes() {
        let mut nodes = Vec::new();
        for group in ["worker", "undisruptable-worker"] {
            for i in 0..3 {
                nodes.push(node(
                    &format!("{}-{}", group, i),
                    group,
                    "old",
                    &[DRAINING_ANNOTATION],
                ));
            }
        }
        let cluster = cluster_with(
            vec![
                node_group("worker", "Automatic", None),
                node_group("undisruptable-worker", "Manual", None),
            ],
            nodes,
        )
        .await;

        let report = run_pass(&cluster, &config()).await.unwrap();
        assert_eq!(report.failed(), 0);

        for group in ["worker", "undisruptable-worker"] {
            for i in 0..3 {
                let name = format!("{}-{}", group, i);
                let after = record(&cluster, &name).await;
                assert!(after.drained, "{} should be drained", name);
                assert!(!after.draining, "{} should not be draining", name);
                assert!(after.unschedulable, "{} should be cordoned", name);
            }
        }
        assert_eq!(cluster.drained_nodes().await.len(), 6);
    }

    #[tokio::test]
    async fn test_fresh_update_initiates_within_budget() {
        let mut nodes = Vec::new();
        for group in ["worker", "undisruptable-worker"] {
            for i in 0..3 {
                nodes.push(node(&format!("{}-{}", group, i), group, "old", &[]));
            }
        }
        let cluster = cluster_with(
            vec![
                node_group("worker", "Automatic", None),
                node_group("undisruptable-worker", "Manual", None),
            ],
            nodes,
        )
        .await;

        let report = run_pass(&cluster, &config()).await.unwrap();

        let first = record(&cluster, "worker-0").await;
        assert!(first.draining);
        assert!(first.unschedulable);
        assert!(first.cordoned_by_us);
        for name in ["worker-1", "worker-2"] {
            let after = record(&cluster, name).await;
            assert!(!after.draining);
            assert!(!after.unschedulable);
            assert_eq!(report.outcome(name).unwrap().to, NodePhase::NeedsUpdate);
        }
        for i in 0..3 {
            let name = format!("undisruptable-worker-{}", i);
            let after = record(&cluster, &name).await;
            assert!(!after.draining);
            assert!(!after.unschedulable);
            assert_eq!(report.outcome(&name).unwrap().to, NodePhase::PendingApproval);
        }

        assert_eq!(report.groups["worker"].in_flight, 1);
        assert_eq!(report.groups["undisruptable-worker"].in_flight, 0);
        // Initiation does not drain in the same pass.
        assert!(cluster.drained_nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_pending_approval_cordon_flag() {
        let cluster = cluster_with(
            vec![node_group("undisruptable-worker", "Manual", None)],
            vec![node("undisruptable-worker-0", "undisruptable-worker", "old", &[])],
        )
        .await;
        let config = ReconcilerConfig {
            cordon_pending_approval: true,
            ..config()
        };

        run_pass(&cluster, &config).await.unwrap();

        let after = record(&cluster, "undisruptable-worker-0").await;
        assert!(after.unschedulable);
        assert!(after.cordoned_by_us);
        assert!(!after.draining);
    }

    #[tokio::test]
    async fn test_pending_approval_cordon_stays_within_budget() {
        let cluster = cluster_with(
            vec![node_group("undisruptable-worker", "Manual", Some(1))],
            vec![
                node("undisruptable-worker-0", "undisruptable-worker", "old", &[]),
                node("undisruptable-worker-1", "undisruptable-worker", "old", &[]),
            ],
        )
        .await;
        let config = ReconcilerConfig {
            cordon_pending_approval: true,
            ..config()
        };

        // The second pass must keep the first node's slot and not hand out another.
        for _ in 0..2 {
            let report = run_pass(&cluster, &config).await.unwrap();
            assert_eq!(report.groups["undisruptable-worker"].in_flight, 1);

            let first = record(&cluster, "undisruptable-worker-0").await;
            let second = record(&cluster, "undisruptable-worker-1").await;
            assert!(first.unschedulable && first.cordoned_by_us);
            assert!(!second.unschedulable);
        }
    }

    #[tokio::test]
    async fn test_pending_approval_cordon_released_when_flag_cleared() {
        let cluster = cluster_with(
            vec![node_group("undisruptable-worker", "Manual", Some(2))],
            vec![
                node("undisruptable-worker-0", "undisruptable-worker", "old", &[]),
                node("undisruptable-worker-1", "undisruptable-worker", "old", &[]),
            ],
        )
        .await;
        let cordoning = ReconcilerConfig {
            cordon_pending_approval: true,
            ..config()
        };
        run_pass(&cluster, &cordoning).await.unwrap();
        assert!(record(&cluster, "undisruptable-worker-0").await.unschedulable);
        assert!(record(&cluster, "undisruptable-worker-1").await.unschedulable);

        let report = run_pass(&cluster, &config()).await.unwrap();

        assert_eq!(report.groups["undisruptable-worker"].in_flight, 0);
        for name in ["undisruptable-worker-0", "undisruptable-worker-1"] {
            let after = record(&cluster, name).await;
            assert!(!after.unschedulable, "{} still cordoned", name);
            assert!(!after.cordoned_by_us, "{} still claimed", name);
            assert!(!after.draining);
        }
    }

    #[tokio::test]
    async fn test_budget_respects_max_concurrent_and_missing_nodes() {
        let mut ng = node_group("worker", "Automatic", Some(3));
        // One desired node is already missing.
        ng.status = Some(NodeGroupStatus {
            desired: 4,
            ready: 3,
            nodes: Some(4),
        });
        let nodes = (0..4)
            .map(|i| node(&format!("worker-{}", i), "worker", "old", &[]))
            .collect();
        let cluster = cluster_with(vec![ng], nodes).await;

        let report = run_pass(&cluster, &config()).await.unwrap();

        assert_eq!(report.groups["worker"].policy.unwrap().concurrency_budget, 2);
        assert_eq!(report.groups["worker"].in_flight, 2);
        assert!(record(&cluster, "worker-0").await.draining);
        assert!(record(&cluster, "worker-1").await.draining);
        assert!(!record(&cluster, "worker-2").await.draining);
        assert!(!record(&cluster, "worker-3").await.draining);
    }

    #[tokio::test]
    async fn test_in_flight_nodes_hold_their_slots() {
        let cluster = cluster_with(
            vec![node_group("worker", "Automatic", Some(1))],
            vec![
                node("worker-a", "worker", "old", &[]),
                node("worker-z", "worker", "old", &[DRAINED_ANNOTATION]),
            ],
        )
        .await;

        let report = run_pass(&cluster, &config()).await.unwrap();

        // worker-z sorts last but already holds the only slot.
        assert!(!record(&cluster, "worker-a").await.draining);
        assert_eq!(report.outcome("worker-a").unwrap().to, NodePhase::NeedsUpdate);
        assert_eq!(report.groups["worker"].in_flight, 1);
    }

    #[tokio::test]
    async fn test_converges_to_up_to_date() {
        let cluster = cluster_with(
            vec![node_group("worker", "Automatic", Some(1))],
            vec![
                node("worker-0", "worker", "old", &[]),
                node("worker-1", "worker", "old", &[]),
            ],
        )
        .await;
        let config = config();

        // Initiate, then drain.
        run_pass(&cluster, &config).await.unwrap();
        run_pass(&cluster, &config).await.unwrap();
        let drained = record(&cluster, "worker-0").await;
        assert!(drained.drained);
        assert!(!record(&cluster, "worker-1").await.draining);

        // The node picks up the new configuration.
        cluster
            .update_node("worker-0", |n| {
                n.metadata.annotations.get_or_insert_with(BTreeMap::new).insert(
                    CONFIGURATION_CHECKSUM_ANNOTATION.to_string(),
                    FINGERPRINT.to_string(),
                );
            })
            .await;

        let report = run_pass(&cluster, &config).await.unwrap();
        let back = record(&cluster, "worker-0").await;
        assert!(!back.drained);
        assert!(!back.draining);
        assert!(!back.unschedulable);
        assert!(!back.cordoned_by_us);
        assert_eq!(report.outcome("worker-0").unwrap().to, NodePhase::UpToDate);
        // The freed slot goes to the next node in the same pass.
        assert!(record(&cluster, "worker-1").await.draining);
    }

    #[tokio::test]
    async fn test_foreign_cordon_survives_return_to_service() {
        let mut n = node("worker-0", "worker", FINGERPRINT, &[DRAINED_ANNOTATION]);
        n.spec = Some(NodeSpec {
            unschedulable: Some(true),
            ..Default::default()
        });
        let cluster = cluster_with(vec![node_group("worker", "Automatic", None)], vec![n]).await;

        run_pass(&cluster, &config()).await.unwrap();

        let after = record(&cluster, "worker-0").await;
        assert!(!after.drained);
        assert!(after.unschedulable);
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let cluster = cluster_with(
            vec![node_group("worker", "Automatic", Some(2))],
            vec![
                node("worker-0", "worker", FINGERPRINT, &[]),
                node("worker-1", "worker", "old", &[DRAINED_ANNOTATION]),
            ],
        )
        .await;

        run_pass(&cluster, &config()).await.unwrap();
        let writes = cluster.write_count().await;
        let report = run_pass(&cluster, &config()).await.unwrap();

        assert_eq!(report.applied(), 0);
        assert_eq!(cluster.write_count().await, writes);
    }

    #[tokio::test]
    async fn test_unknown_approval_mode_blocks_initiation_only() {
        let cluster = cluster_with(
            vec![node_group("worker", "Sometimes", None)],
            vec![
                node("worker-0", "worker", "old", &[]),
                node("worker-1", "worker", "old", &[DRAINING_ANNOTATION]),
            ],
        )
        .await;

        let report = run_pass(&cluster, &config()).await.unwrap();

        assert_eq!(report.policy_errors.len(), 1);
        assert!(report.policy_errors[0].contains("Sometimes"));
        assert!(report.groups["worker"].policy.is_none());
        assert!(!record(&cluster, "worker-0").await.draining);
        assert!(record(&cluster, "worker-1").await.drained);
    }

    #[tokio::test]
    async fn test_conflict_is_isolated_to_one_node() {
        let cluster = cluster_with(
            vec![node_group("worker", "Automatic", Some(2))],
            vec![
                node("worker-0", "worker", "old", &[]),
                node("worker-1", "worker", "old", &[]),
            ],
        )
        .await;
        cluster.inject_conflict("worker-0").await;

        let report = run_pass(&cluster, &config()).await.unwrap();

        assert_eq!(report.failed(), 1);
        assert!(matches!(
            &report.outcome("worker-0").unwrap().result,
            OutcomeResult::Failed { kind, .. } if kind == "conflict"
        ));
        assert!(!record(&cluster, "worker-0").await.draining);
        assert!(record(&cluster, "worker-1").await.draining);

        // Retried on the next pass.
        run_pass(&cluster, &config()).await.unwrap();
        assert!(record(&cluster, "worker-0").await.draining);
    }

    #[tokio::test]
    async fn test_failed_drain_retries_next_pass() {
        let cluster = cluster_with(
            vec![node_group("worker", "Automatic", None)],
            vec![node("worker-0", "worker", "old", &[DRAINING_ANNOTATION])],
        )
        .await;
        cluster.fail_drain("worker-0", true).await;

        let report = run_pass(&cluster, &config()).await.unwrap();
        assert!(matches!(
            &report.outcome("worker-0").unwrap().result,
            OutcomeResult::Failed { kind, .. } if kind == "drain"
        ));
        let after = record(&cluster, "worker-0").await;
        assert!(after.draining);
        assert!(!after.drained);
        // The cordon written before the drain stays.
        assert!(after.unschedulable);

        cluster.fail_drain("worker-0", false).await;
        run_pass(&cluster, &config()).await.unwrap();
        assert!(record(&cluster, "worker-0").await.drained);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let cluster = cluster_with(
            vec![node_group("worker", "Automatic", None)],
            vec![
                node("worker-0", "worker", "old", &[]),
                node("worker-1", "worker", "old", &[DRAINING_ANNOTATION]),
            ],
        )
        .await;
        let config = ReconcilerConfig {
            dry_run: true,
            ..config()
        };

        let report = run_pass(&cluster, &config).await.unwrap();

        assert!(report.dry_run);
        assert_eq!(
            report.outcome("worker-1").unwrap().result,
            OutcomeResult::Planned
        );
        assert_eq!(cluster.write_count().await, 0);
        assert!(cluster.drained_nodes().await.is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_api_aborts_pass() {
        let cluster = InMemoryCluster::new();
        cluster.set_unavailable(true).await;

        let err = run_pass(&cluster, &config()).await.unwrap_err();
        assert!(matches!(err, Error::SnapshotError(_)));
    }

    #[tokio::test]
    async fn test_controller_state_keeps_last_report() {
        let cluster = cluster_with(
            vec![node_group("worker", "Automatic", None)],
            vec![node("worker-0", "worker", "old", &[])],
        )
        .await;
        let state = ControllerState::new(Arc::new(cluster), config());
        assert!(state.last_report.read().await.is_none());

        state.reconcile().await.unwrap();

        let report = state.last_report.read().await;
        let report = report.as_ref().unwrap();
        assert_eq!(report.outcome("worker-0").unwrap().to, NodePhase::Draining);
    }

    #[tokio::test]
    async fn test_report_serializes_camel_case() {
        let cluster = cluster_with(
            vec![node_group("worker", "Automatic", None)],
            vec![node("worker-0", "worker", "old", &[])],
        )
        .await;
        let report = run_pass(&cluster, &config()).await.unwrap();
        let json = serde_json::to_value(&report).unwrap();

        assert_eq!(json["groups"]["worker"]["inFlight"], 1);
        assert_eq!(json["groups"]["worker"]["policy"]["approvalMode"], "Automatic");
        assert_eq!(json["nodes"][0]["to"], "Draining");
        assert_eq!(json["nodes"][0]["result"]["status"], "applied");
    }

    #[test]
    fn test_owner_constant_matches_field_manager() {
        assert_eq!(CORDON_OWNER, super::super::kube_cluster::FIELD_MANAGER);
        assert!(CORDONED_BY_ANNOTATION.starts_with("update.node.deckhouse.io/"));
    }
}
