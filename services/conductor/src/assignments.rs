//! Live deployment ⇄ node assignment tracking.
//!
//! At most one assignment per deployment; a node may hold many. The
//! table also carries what the node last reported (state, acked
//! revision, exit code) and whether the assignment currently holds a
//! capacity reservation, so the reconciler can join records, nodes and
//! reservations at read time.

use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;
use std::time::Instant;

use symphony_id::DeploymentId;
use symphony_proto::{CurrentState, DeploymentStatus};

/// Reasons surfaced in deployment records while unassigned.
pub mod reasons {
    pub const NO_ELIGIBLE_NODE: &str = "no-eligible-node";
    pub const NO_CAPACITY: &str = "no-capacity";
    pub const INSUFFICIENT_CAPACITY: &str = "insufficient-capacity";
    pub const NODE_DISCONNECTED: &str = "node-disconnected";
}

/// One live assignment.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub node_id: String,
    pub assigned_at_ms: i64,
    /// Highest spec revision the node has confirmed. Non-decreasing.
    pub revision_acked: u64,
    pub reported_state: CurrentState,
    pub exit_code: Option<i32>,
    /// Whether the ledger currently holds this deployment's requests.
    pub capacity_held: bool,
    /// When the last command for this deployment was queued, for the
    /// command-ack timeout.
    pub last_command_at: Option<Instant>,
    /// Spec revision carried by the last issued command; gates
    /// edge-triggered sends against timeout re-issues.
    pub last_command_revision: u64,
    /// A cancel was issued; teardown confirmation pending.
    pub cancel_sent: bool,
}

#[derive(Default)]
struct Inner {
    by_deployment: HashMap<DeploymentId, Assignment>,
    by_node: HashMap<String, BTreeSet<DeploymentId>>,
    unassigned_reason: HashMap<DeploymentId, String>,
}

/// Concurrent assignment table.
pub struct AssignmentTable {
    inner: RwLock<Inner>,
}

impl AssignmentTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Record a new assignment. Returns `false` (leaving the table
    /// untouched) if the deployment is already assigned — the caller
    /// must treat that as an exclusive-assignment invariant breach.
    pub fn assign(&self, deployment_id: DeploymentId, node_id: &str, capacity_held: bool) -> bool {
        let mut inner = self.inner.write().expect("assignment lock poisoned");
        if inner.by_deployment.contains_key(&deployment_id) {
            return false;
        }
        inner.by_deployment.insert(
            deployment_id,
            Assignment {
                node_id: node_id.to_string(),
                assigned_at_ms: chrono::Utc::now().timestamp_millis(),
                revision_acked: 0,
                reported_state: CurrentState::Pending,
                exit_code: None,
                capacity_held,
                last_command_at: None,
                last_command_revision: 0,
                cancel_sent: false,
            },
        );
        inner
            .by_node
            .entry(node_id.to_string())
            .or_default()
            .insert(deployment_id);
        inner.unassigned_reason.remove(&deployment_id);
        true
    }

    /// Drop an assignment, returning it for capacity cleanup.
    pub fn remove(&self, deployment_id: DeploymentId) -> Option<Assignment> {
        let mut inner = self.inner.write().expect("assignment lock poisoned");
        let assignment = inner.by_deployment.remove(&deployment_id)?;
        if let Some(set) = inner.by_node.get_mut(&assignment.node_id) {
            set.remove(&deployment_id);
            if set.is_empty() {
                inner.by_node.remove(&assignment.node_id);
            }
        }
        Some(assignment)
    }

    pub fn get(&self, deployment_id: DeploymentId) -> Option<Assignment> {
        let inner = self.inner.read().expect("assignment lock poisoned");
        inner.by_deployment.get(&deployment_id).cloned()
    }

    pub fn node_of(&self, deployment_id: DeploymentId) -> Option<String> {
        let inner = self.inner.read().expect("assignment lock poisoned");
        inner
            .by_deployment
            .get(&deployment_id)
            .map(|a| a.node_id.clone())
    }

    /// Deployments currently assigned to a node, in stable order.
    pub fn deployments_on(&self, node_id: &str) -> Vec<DeploymentId> {
        let inner = self.inner.read().expect("assignment lock poisoned");
        inner
            .by_node
            .get(node_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn count_on(&self, node_id: &str) -> usize {
        let inner = self.inner.read().expect("assignment lock poisoned");
        inner.by_node.get(node_id).map_or(0, |set| set.len())
    }

    /// Apply a node's status report. Ignored unless the deployment is
    /// assigned to the reporting node. `revision_acked` only moves
    /// forward. Returns the updated assignment.
    pub fn record_status(&self, node_id: &str, status: &DeploymentStatus) -> Option<Assignment> {
        let mut inner = self.inner.write().expect("assignment lock poisoned");
        let assignment = inner.by_deployment.get_mut(&status.deployment_id)?;
        if assignment.node_id != node_id {
            return None;
        }
        assignment.reported_state = status.current_state;
        assignment.exit_code = status.exit_code;
        assignment.revision_acked = assignment.revision_acked.max(status.revision_acked);
        Some(assignment.clone())
    }

    pub fn mark_command_sent(&self, deployment_id: DeploymentId, revision: u64) {
        let mut inner = self.inner.write().expect("assignment lock poisoned");
        if let Some(assignment) = inner.by_deployment.get_mut(&deployment_id) {
            assignment.last_command_at = Some(Instant::now());
            assignment.last_command_revision = assignment.last_command_revision.max(revision);
        }
    }

    /// Zero the acked and issued revisions for every assignment on a
    /// node, forcing commands to be re-issued after the node
    /// reconnects. Reported state drops to `Unknown` until the node
    /// reports again.
    pub fn reset_acks_for_node(&self, node_id: &str) {
        let mut inner = self.inner.write().expect("assignment lock poisoned");
        let ids: Vec<DeploymentId> = inner
            .by_node
            .get(node_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for id in ids {
            if let Some(assignment) = inner.by_deployment.get_mut(&id) {
                assignment.revision_acked = 0;
                assignment.last_command_revision = 0;
                assignment.last_command_at = None;
                assignment.reported_state = CurrentState::Unknown;
            }
        }
    }

    pub fn mark_cancel_sent(&self, deployment_id: DeploymentId) {
        let mut inner = self.inner.write().expect("assignment lock poisoned");
        if let Some(assignment) = inner.by_deployment.get_mut(&deployment_id) {
            assignment.cancel_sent = true;
            assignment.last_command_at = Some(Instant::now());
        }
    }

    pub fn set_capacity_held(&self, deployment_id: DeploymentId, held: bool) {
        let mut inner = self.inner.write().expect("assignment lock poisoned");
        if let Some(assignment) = inner.by_deployment.get_mut(&deployment_id) {
            assignment.capacity_held = held;
        }
    }

    /// Record why a deployment could not be placed.
    pub fn set_unassigned_reason(&self, deployment_id: DeploymentId, reason: &str) {
        let mut inner = self.inner.write().expect("assignment lock poisoned");
        inner
            .unassigned_reason
            .insert(deployment_id, reason.to_string());
    }

    pub fn unassigned_reason(&self, deployment_id: DeploymentId) -> Option<String> {
        let inner = self.inner.read().expect("assignment lock poisoned");
        inner.unassigned_reason.get(&deployment_id).cloned()
    }

    /// Forget a deployment entirely (deletion cleanup).
    pub fn forget(&self, deployment_id: DeploymentId) {
        self.remove(deployment_id);
        let mut inner = self.inner.write().expect("assignment lock poisoned");
        inner.unassigned_reason.remove(&deployment_id);
    }
}

impl Default for AssignmentTable {
    fn default() -> Self {
        Self::new()
    }
}
