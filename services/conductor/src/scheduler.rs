//! Capacity-aware node selection.
//!
//! The scheduler proposes, the ledger decides: eligibility and scoring
//! run against a registry snapshot, then the choice is committed with
//! `try_reserve`. Losing the commit race triggers a bounded recompute.
//! Running deployments are never moved; reassignment happens only on
//! node loss or an explicit stop/start cycle.

use thiserror::Error;
use tracing::debug;

use crate::assignments::{reasons, AssignmentTable};
use crate::ledger::{CapacityLedger, LedgerError};
use crate::registry::{NodeEntry, NodeRegistry};
use crate::store::DeploymentRecord;

/// Retries after losing a `try_reserve` race to a concurrent placement.
const COMMIT_RETRIES: usize = 3;

/// Placement failure, surfaced as `assignment_reason` on the record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    /// No live node matches the group or carries the requested labels.
    #[error("no eligible node")]
    NoEligibleNode,

    /// Eligible nodes exist but none has room for the request.
    #[error("insufficient capacity")]
    InsufficientCapacity,

    /// Every commit attempt lost the reservation race.
    #[error("no capacity")]
    NoCapacity,
}

impl PlacementError {
    pub fn as_reason(&self) -> &'static str {
        match self {
            PlacementError::NoEligibleNode => reasons::NO_ELIGIBLE_NODE,
            PlacementError::InsufficientCapacity => reasons::INSUFFICIENT_CAPACITY,
            PlacementError::NoCapacity => reasons::NO_CAPACITY,
        }
    }
}

/// Normalized load after hypothetically placing the deployment:
/// `max over requested labels of (reserved + request) / total`.
/// Lower is better.
fn load_score(
    node: &NodeEntry,
    ledger: &CapacityLedger,
    deployment: &DeploymentRecord,
) -> f64 {
    let reserved = ledger.reserved(&node.node_id).unwrap_or_default();
    deployment
        .capacity_requests
        .iter()
        .map(|(label, request)| {
            let total = node.capacities_total.get(label).copied().unwrap_or(0);
            if total == 0 {
                return f64::INFINITY;
            }
            let used = reserved.get(label).copied().unwrap_or(0);
            ((used + request) as f64) / (total as f64)
        })
        .fold(0.0, f64::max)
}

/// Pick a node for `deployment` and reserve its capacity requests.
///
/// On success the reservation is already committed; the caller records
/// the assignment and sends the start command.
pub fn place(
    deployment: &DeploymentRecord,
    registry: &NodeRegistry,
    ledger: &CapacityLedger,
    assignments: &AssignmentTable,
) -> Result<String, PlacementError> {
    let mut last_error = PlacementError::NoEligibleNode;

    for attempt in 0..COMMIT_RETRIES {
        let candidates = registry.nodes_in_group(&deployment.node_group);
        if candidates.is_empty() {
            return Err(PlacementError::NoEligibleNode);
        }

        // A node must carry every requested label; whether enough of it
        // is free is a separate question so the failure reason can
        // distinguish the two.
        let carrying: Vec<&NodeEntry> = candidates
            .iter()
            .filter(|n| {
                deployment
                    .capacity_requests
                    .keys()
                    .all(|label| n.capacities_total.contains_key(label))
            })
            .collect();
        if carrying.is_empty() {
            return Err(PlacementError::NoEligibleNode);
        }

        let mut best: Option<(f64, usize, &NodeEntry)> = None;
        for node in carrying {
            let Some(available) = ledger.available(&node.node_id) else {
                continue;
            };
            let fits = deployment
                .capacity_requests
                .iter()
                .all(|(label, request)| available.get(label).copied().unwrap_or(0) >= *request);
            if !fits {
                continue;
            }

            let score = load_score(node, ledger, deployment);
            let count = assignments.count_on(&node.node_id);
            let better = match &best {
                None => true,
                Some((best_score, best_count, best_node)) => {
                    (score, count, node.node_id.as_str())
                        < (*best_score, *best_count, best_node.node_id.as_str())
                }
            };
            if better {
                best = Some((score, count, node));
            }
        }

        let Some((score, _, chosen)) = best else {
            return Err(PlacementError::InsufficientCapacity);
        };

        match ledger.try_reserve(&chosen.node_id, &deployment.capacity_requests) {
            Ok(()) => {
                debug!(
                    deployment_id = %deployment.id,
                    node_id = %chosen.node_id,
                    score,
                    attempt,
                    "placement committed"
                );
                return Ok(chosen.node_id.clone());
            }
            Err(LedgerError::Insufficient { .. }) => {
                debug!(
                    deployment_id = %deployment.id,
                    node_id = %chosen.node_id,
                    attempt,
                    "reservation race lost, recomputing"
                );
                last_error = PlacementError::NoCapacity;
            }
            Err(_) => {
                // Node row vanished between snapshot and commit.
                last_error = PlacementError::NoCapacity;
            }
        }
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use symphony_id::DeploymentId;
    use symphony_proto::{DeployKind, DesiredState, NodeHello, StaticResources};
    use tokio::sync::{mpsc, watch};

    fn caps(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn register(registry: &NodeRegistry, ledger: &CapacityLedger, id: &str, group: &str, total: &[(&str, u64)]) {
        let hello = NodeHello {
            node_id: id.to_string(),
            groups: vec![group.to_string()],
            capacities_total: caps(total),
            heartbeat_interval_ms: 3000,
            static_resources: StaticResources::default(),
        };
        let (tx, rx) = mpsc::channel(8);
        std::mem::forget(rx);
        let (shutdown, _) = watch::channel(false);
        registry
            .register(
                &hello,
                crate::registry::SessionHandle {
                    outbound: tx,
                    shutdown,
                },
            )
            .unwrap();
        ledger.register_node(id, &caps(total));
    }

    fn deployment(group: &str, requests: &[(&str, u64)]) -> DeploymentRecord {
        DeploymentRecord {
            id: DeploymentId::new(),
            name: "d".to_string(),
            kind: DeployKind::Exec,
            node_group: group.to_string(),
            capacity_requests: caps(requests),
            specification: serde_json::json!({}),
            desired_state: DesiredState::Running,
            created_at_ms: 0,
            updated_at_ms: 0,
            spec_revision: 1,
            deleted: false,
        }
    }

    #[test]
    fn places_on_the_only_eligible_node() {
        let registry = NodeRegistry::new();
        let ledger = CapacityLedger::new();
        let assignments = AssignmentTable::new();
        register(&registry, &ledger, "n1", "gpu", &[("A", 10)]);

        let dep = deployment("gpu", &[("A", 3)]);
        let node = place(&dep, &registry, &ledger, &assignments).unwrap();
        assert_eq!(node, "n1");
        assert_eq!(ledger.available("n1").unwrap(), caps(&[("A", 7)]));
    }

    #[test]
    fn group_mismatch_is_no_eligible_node() {
        let registry = NodeRegistry::new();
        let ledger = CapacityLedger::new();
        let assignments = AssignmentTable::new();
        register(&registry, &ledger, "n1", "cpu", &[("A", 10)]);

        let dep = deployment("gpu", &[("A", 3)]);
        let err = place(&dep, &registry, &ledger, &assignments).unwrap_err();
        assert_eq!(err, PlacementError::NoEligibleNode);
    }

    #[test]
    fn missing_label_is_no_eligible_node() {
        let registry = NodeRegistry::new();
        let ledger = CapacityLedger::new();
        let assignments = AssignmentTable::new();
        register(&registry, &ledger, "n1", "gpu", &[("A", 10)]);

        let dep = deployment("gpu", &[("GPU", 1)]);
        let err = place(&dep, &registry, &ledger, &assignments).unwrap_err();
        assert_eq!(err, PlacementError::NoEligibleNode);
    }

    #[test]
    fn full_node_is_insufficient_capacity() {
        let registry = NodeRegistry::new();
        let ledger = CapacityLedger::new();
        let assignments = AssignmentTable::new();
        register(&registry, &ledger, "n1", "gpu", &[("A", 5)]);
        ledger.try_reserve("n1", &caps(&[("A", 4)])).unwrap();

        let dep = deployment("gpu", &[("A", 3)]);
        let err = place(&dep, &registry, &ledger, &assignments).unwrap_err();
        assert_eq!(err, PlacementError::InsufficientCapacity);
    }

    #[test]
    fn balances_by_normalized_load() {
        let registry = NodeRegistry::new();
        let ledger = CapacityLedger::new();
        let assignments = AssignmentTable::new();
        register(&registry, &ledger, "n1", "cpu", &[("A", 10)]);
        register(&registry, &ledger, "n2", "cpu", &[("A", 10)]);

        // Four identical requests land 2 + 2, not 3 + 1.
        for _ in 0..4 {
            let dep = deployment("cpu", &[("A", 3)]);
            let node = place(&dep, &registry, &ledger, &assignments).unwrap();
            let held = assignments.count_on(&node);
            assert!(assignments.assign(dep.id, &node, true), "double assignment");
            assert_eq!(assignments.count_on(&node), held + 1);
        }
        assert_eq!(assignments.count_on("n1"), 2);
        assert_eq!(assignments.count_on("n2"), 2);
        assert_eq!(ledger.available("n1").unwrap(), caps(&[("A", 4)]));
        assert_eq!(ledger.available("n2").unwrap(), caps(&[("A", 4)]));
    }

    #[test]
    fn ties_break_on_lexicographic_node_id() {
        let registry = NodeRegistry::new();
        let ledger = CapacityLedger::new();
        let assignments = AssignmentTable::new();
        register(&registry, &ledger, "n2", "cpu", &[("A", 10)]);
        register(&registry, &ledger, "n1", "cpu", &[("A", 10)]);

        let dep = deployment("cpu", &[("A", 3)]);
        let node = place(&dep, &registry, &ledger, &assignments).unwrap();
        assert_eq!(node, "n1");
    }

    #[test]
    fn prefers_less_loaded_even_when_totals_differ() {
        let registry = NodeRegistry::new();
        let ledger = CapacityLedger::new();
        let assignments = AssignmentTable::new();
        register(&registry, &ledger, "big", "cpu", &[("A", 100)]);
        register(&registry, &ledger, "small", "cpu", &[("A", 10)]);
        ledger.try_reserve("big", &caps(&[("A", 80)])).unwrap();

        // big: (80+3)/100 = 0.83, small: 3/10 = 0.3 → small wins.
        let dep = deployment("cpu", &[("A", 3)]);
        assert_eq!(place(&dep, &registry, &ledger, &assignments).unwrap(), "small");
    }
}
