//! Prometheus metrics for the node-group drain reconciler
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `nodegroup_drain_pass_duration_seconds` (histogram): duration of one reconciliation pass.
//! - `nodegroup_drain_pass_errors_total` (counter): snapshot and policy errors labeled by kind.
//! - `nodegroup_drain_transitions_total` (counter): applied node transitions labeled by group/from/to.
//! - `nodegroup_drain_node_failures_total` (counter): failed node writes labeled by group and kind.
//! - `nodegroup_drain_in_flight` (gauge): nodes of a group in Draining or Drained.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

/// Labels for pass-level error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Error kind, e.g. "snapshot", "policy"
    pub kind: String,
}

/// Labels for node transition metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    pub group: String,
    pub from: String,
    pub to: String,
}

/// Labels for failed node writes
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeFailureLabels {
    pub group: String,
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct GroupLabels {
    pub group: String,
}

/// Histogram tracking pass duration (seconds)
pub static PASS_DURATION_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    // 10ms .. ~5.5min across 16 buckets.
    Histogram::new(exponential_buckets(0.01, 2.0, 16))
});

pub static PASS_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static TRANSITIONS_TOTAL: Lazy<Family<TransitionLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static NODE_FAILURES_TOTAL: Lazy<Family<NodeFailureLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static IN_FLIGHT: Lazy<Family<GroupLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
///
/// Counters are registered without the `_total` suffix; the encoder adds it.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "nodegroup_drain_pass_duration_seconds",
        "Duration of reconciliation passes in seconds",
        PASS_DURATION_SECONDS.clone(),
    );
    registry.register(
        "nodegroup_drain_pass_errors",
        "Total number of snapshot and policy errors",
        PASS_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "nodegroup_drain_transitions",
        "Total number of node phase transitions written",
        TRANSITIONS_TOTAL.clone(),
    );
    registry.register(
        "nodegroup_drain_node_failures",
        "Total number of node transitions that failed to apply",
        NODE_FAILURES_TOTAL.clone(),
    );
    registry.register(
        "nodegroup_drain_in_flight",
        "Nodes of a group currently Draining or Drained",
        IN_FLIGHT.clone(),
    );

    registry
});

/// Observe a pass duration in seconds.
pub fn observe_pass_duration_seconds(seconds: f64) {
    PASS_DURATION_SECONDS.observe(seconds);
}

pub fn inc_pass_error(kind: &str) {
    let labels = ErrorLabels {
        kind: kind.to_string(),
    };
    PASS_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_transition(group: &str, from: &str, to: &str) {
    let labels = TransitionLabels {
        group: group.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    };
    TRANSITIONS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_node_failure(group: &str, kind: &str) {
    let labels = NodeFailureLabels {
        group: group.to_string(),
        kind: kind.to_string(),
    };
    NODE_FAILURES_TOTAL.get_or_create(&labels).inc();
}

/// Replace the in-flight series with the groups of the latest pass, so
/// groups that are gone stop being exported.
pub fn set_in_flight<'a>(groups: impl IntoIterator<Item = (&'a str, u32)>) {
    replace_group_gauges(&IN_FLIGHT, groups);
}

fn replace_group_gauges<'a>(
    family: &Family<GroupLabels, Gauge<i64, AtomicI64>>,
    groups: impl IntoIterator<Item = (&'a str, u32)>,
) {
    family.clear();
    for (group, value) in groups {
        let labels = GroupLabels {
            group: group.to_string(),
        };
        family.get_or_create(&labels).set(value as i64);
    }
}
