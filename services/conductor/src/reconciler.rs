//! The deployment reconciliation loop.
//!
//! A single coordinating task compares desired state (store) against
//! observed state (assignment table, fed by node status reports) and
//! drives placement, update, stop and teardown commands. It runs on two
//! triggers: edge-triggered events from sessions and the API, and a
//! periodic sweep that re-evaluates unassigned deployments in case
//! capacity freed up silently. Per-tick work is capped; the remainder
//! carries over FIFO so nothing starves.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use symphony_id::DeploymentId;
use symphony_proto::{
    ConductorToNode, DeploymentAction, DeploymentCancel, DeploymentReq, DeploymentStatusList,
    DesiredState,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::assignments::{reasons, Assignment, AssignmentTable};
use crate::ledger::{CapacityLedger, LedgerError};
use crate::registry::NodeRegistry;
use crate::scheduler;
use crate::store::{DeploymentRecord, DeploymentRepository};
use crate::stream::{ChangeEvent, EventBus};

/// Bounded queue between sessions/API and the reconciler. Sessions use
/// `try_send`; a full queue closes the offending session.
pub const EVENT_QUEUE: usize = 256;

/// Inputs the reconciler reacts to between sweeps.
#[derive(Debug)]
pub enum ReconcileEvent {
    /// A record was created, patched or deleted.
    DeploymentChanged(DeploymentId),
    /// A node session completed its handshake.
    NodeConnected(String),
    /// A node session terminated. Assignment cleanup waits for the
    /// grace window; this is informational.
    NodeLost { node_id: String, reason: String },
    /// A session forwarded a status list frame.
    StatusReport {
        node_id: String,
        statuses: DeploymentStatusList,
    },
}

/// Cloneable sender half used by sessions and API handlers.
#[derive(Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::Sender<ReconcileEvent>,
}

impl ReconcilerHandle {
    /// Queue an event without blocking. Returns false when the queue is
    /// full; sessions treat that as a slow-consumer condition.
    pub fn notify(&self, event: ReconcileEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }
}

/// Tuning knobs for the loop.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub sweep_interval: Duration,
    pub command_ack_timeout: Duration,
    /// Deployments processed per tick before re-queueing the rest.
    pub max_per_tick: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(2),
            command_ack_timeout: Duration::from_secs(30),
            max_per_tick: 128,
        }
    }
}

/// Counters from one sweep pass.
#[derive(Debug, Default, Clone)]
pub struct SweepStats {
    pub processed: usize,
    pub placed: usize,
    pub commands_sent: usize,
}

/// The reconciliation loop.
pub struct Reconciler {
    registry: Arc<NodeRegistry>,
    ledger: Arc<CapacityLedger>,
    repo: Arc<dyn DeploymentRepository>,
    assignments: Arc<AssignmentTable>,
    bus: Arc<EventBus>,
    rx: mpsc::Receiver<ReconcileEvent>,
    config: ReconcilerConfig,
    /// FIFO carry-over across capped ticks.
    queue: VecDeque<DeploymentId>,
    queued: HashSet<DeploymentId>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<NodeRegistry>,
        ledger: Arc<CapacityLedger>,
        repo: Arc<dyn DeploymentRepository>,
        assignments: Arc<AssignmentTable>,
        bus: Arc<EventBus>,
        config: ReconcilerConfig,
    ) -> (Self, ReconcilerHandle) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        (
            Self {
                registry,
                ledger,
                repo,
                assignments,
                bus,
                rx,
                config,
                queue: VecDeque::new(),
                queued: HashSet::new(),
            },
            ReconcilerHandle { tx },
        )
    }

    /// Run until shutdown. Decisions are linearized per deployment by
    /// virtue of the single task; the reconciler never holds two
    /// component locks simultaneously.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            ack_timeout_ms = self.config.command_ack_timeout.as_millis() as u64,
            "reconciler started"
        );
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconciler shutting down");
                        break;
                    }
                }
            }
        }

        // Drain whatever is already queued so in-flight store writes
        // observe their effects before the process exits.
        while let Ok(event) = self.rx.try_recv() {
            self.handle_event(event).await;
        }
    }

    pub async fn handle_event(&mut self, event: ReconcileEvent) {
        match event {
            ReconcileEvent::DeploymentChanged(id) => match self.repo.get(id).await {
                Ok(Some(record)) => self.reconcile_deployment(&record).await,
                Ok(None) => self.assignments.forget(id),
                Err(e) => warn!(deployment_id = %id, error = %e, "store read failed"),
            },
            ReconcileEvent::NodeConnected(node_id) => {
                // A reconnecting node may have restarted and lost its
                // children; zeroing the acks makes the next sweep
                // re-issue commands. A node that kept state ignores the
                // stale revisions.
                self.assignments.reset_acks_for_node(&node_id);
                self.bus.notify(ChangeEvent::Nodes);
                if let Err(e) = self.sweep().await {
                    error!(error = %e, "sweep after node connect failed");
                }
            }
            ReconcileEvent::NodeLost { node_id, reason } => {
                debug!(node_id = %node_id, reason = %reason, "node lost; grace window running");
                self.bus.notify(ChangeEvent::Nodes);
            }
            ReconcileEvent::StatusReport { node_id, statuses } => {
                self.apply_status_reports(&node_id, statuses).await;
            }
        }
    }

    async fn apply_status_reports(&mut self, node_id: &str, statuses: DeploymentStatusList) {
        for status in statuses.deployments {
            let Some(assignment) = self.assignments.record_status(node_id, &status) else {
                continue;
            };

            let record = match self.repo.get(status.deployment_id).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(deployment_id = %status.deployment_id, error = %e, "store read failed");
                    continue;
                }
            };

            if record.deleted {
                if status.current_state.is_terminal() {
                    self.reconcile_deletion(&record).await;
                }
            } else if record.desired_state == DesiredState::Stopped
                && status.current_state.is_terminal()
                && assignment.capacity_held
            {
                // The deployment no longer occupies the node: release
                // its reservation but keep the assignment affinity.
                self.release_capacity(&record, &assignment.node_id);
                self.assignments.set_capacity_held(record.id, false);
            }
        }
        self.bus.notify(ChangeEvent::Deployments);
    }

    /// One full pass: expire dead sessions, reap disconnected nodes
    /// past their grace window, then walk the deployment queue.
    pub async fn sweep(&mut self) -> anyhow::Result<SweepStats> {
        let mut stats = SweepStats::default();

        let timed_out = self.registry.enforce_heartbeat_timeouts();
        if !timed_out.is_empty() {
            self.bus.notify(ChangeEvent::Nodes);
        }

        for node_id in self.registry.reap_disconnected() {
            self.unassign_node(&node_id).await;
        }

        for record in self.repo.list_all().await? {
            if self.queued.insert(record.id) {
                self.queue.push_back(record.id);
            }
        }

        for _ in 0..self.config.max_per_tick {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            self.queued.remove(&id);
            stats.processed += 1;

            match self.repo.get(id).await {
                Ok(Some(record)) => self.reconcile_deployment(&record).await,
                Ok(None) => self.assignments.forget(id),
                Err(e) => warn!(deployment_id = %id, error = %e, "store read failed"),
            }
        }

        Ok(stats)
    }

    /// A node's grace window expired: its assignments become unassigned
    /// with reason `node-disconnected` and its capacity row is dropped.
    /// The placement pass later in the same sweep will replace them.
    async fn unassign_node(&mut self, node_id: &str) {
        let deployments = self.assignments.deployments_on(node_id);
        for deployment_id in deployments {
            if self.assignments.remove(deployment_id).is_some() {
                self.assignments
                    .set_unassigned_reason(deployment_id, reasons::NODE_DISCONNECTED);
                warn!(
                    deployment_id = %deployment_id,
                    node_id,
                    "assignment lost to node disconnect"
                );
            }
        }
        self.ledger.remove_node(node_id);
        self.bus.notify(ChangeEvent::Nodes);
        self.bus.notify(ChangeEvent::Deployments);
    }

    async fn reconcile_deployment(&mut self, record: &DeploymentRecord) {
        if record.deleted {
            self.reconcile_deletion(record).await;
            return;
        }
        match record.desired_state {
            DesiredState::Running => self.converge_running(record).await,
            DesiredState::Stopped => self.converge_stopped(record).await,
        }
    }

    async fn converge_running(&mut self, record: &DeploymentRecord) {
        let Some(assignment) = self.assignments.get(record.id) else {
            self.place(record).await;
            return;
        };

        // Backstop: the owning node vanished without passing through
        // the reap path (should not happen).
        if self.registry.get(&assignment.node_id).is_none() {
            self.assignments.remove(record.id);
            self.assignments
                .set_unassigned_reason(record.id, reasons::NODE_DISCONNECTED);
            self.ledger.remove_node(&assignment.node_id);
            self.place(record).await;
            return;
        }

        // Re-start after a completed stop: the reservation was released
        // when the deployment went terminal, so re-reserve on the same
        // node before commanding it. No preemption: if it no longer
        // fits, the assignment dissolves and placement starts over.
        if !assignment.capacity_held {
            match self
                .ledger
                .try_reserve(&assignment.node_id, &record.capacity_requests)
            {
                Ok(()) => {
                    self.assignments.set_capacity_held(record.id, true);
                }
                Err(LedgerError::Insufficient { .. }) => {
                    self.assignments.remove(record.id);
                    self.assignments
                        .set_unassigned_reason(record.id, reasons::INSUFFICIENT_CAPACITY);
                    self.place(record).await;
                    return;
                }
                Err(_) => {
                    self.assignments.remove(record.id);
                    self.assignments
                        .set_unassigned_reason(record.id, reasons::NODE_DISCONNECTED);
                    return;
                }
            }
        }

        if assignment.revision_acked < record.spec_revision {
            let action = if assignment.last_command_revision == 0 {
                DeploymentAction::Start
            } else {
                DeploymentAction::Update
            };
            if self.command_due(&assignment, record.spec_revision) {
                self.send_command(record, &assignment.node_id, action);
            }
        }
    }

    async fn converge_stopped(&mut self, record: &DeploymentRecord) {
        let Some(assignment) = self.assignments.get(record.id) else {
            return;
        };

        if assignment.reported_state.is_terminal() {
            if assignment.capacity_held {
                self.release_capacity(record, &assignment.node_id);
                self.assignments.set_capacity_held(record.id, false);
                self.bus.notify(ChangeEvent::Deployments);
            }
            return;
        }

        if assignment.revision_acked < record.spec_revision
            && self.command_due(&assignment, record.spec_revision)
        {
            self.send_command(record, &assignment.node_id, DeploymentAction::Stop);
        }
    }

    /// Deletion is tombstoned until node-side teardown is confirmed (or
    /// the node is gone, or the cancel ack timed out).
    async fn reconcile_deletion(&mut self, record: &DeploymentRecord) {
        let Some(assignment) = self.assignments.get(record.id) else {
            self.finish_purge(record).await;
            return;
        };

        let node_live = self
            .registry
            .get(&assignment.node_id)
            .is_some_and(|n| n.connected);
        let torn_down = assignment.cancel_sent && assignment.reported_state.is_terminal();
        let cancel_timed_out = assignment.cancel_sent
            && assignment
                .last_command_at
                .is_some_and(|t| t.elapsed() >= self.config.command_ack_timeout);

        if !node_live || torn_down || cancel_timed_out {
            if let Some(removed) = self.assignments.remove(record.id) {
                if removed.capacity_held {
                    self.release_capacity(record, &removed.node_id);
                }
            }
            self.finish_purge(record).await;
        } else if !assignment.cancel_sent || cancel_timed_out {
            let msg = ConductorToNode::DeploymentCancel(DeploymentCancel {
                deployment_id: record.id,
            });
            match self.registry.send(&assignment.node_id, msg) {
                Ok(()) => self.assignments.mark_cancel_sent(record.id),
                Err(e) => warn!(
                    deployment_id = %record.id,
                    node_id = %assignment.node_id,
                    error = %e,
                    "cancel not delivered, will retry"
                ),
            }
        }
    }

    async fn finish_purge(&mut self, record: &DeploymentRecord) {
        if let Err(e) = self.repo.purge(record.id).await {
            warn!(deployment_id = %record.id, error = %e, "purge failed");
            return;
        }
        self.assignments.forget(record.id);
        self.bus.notify(ChangeEvent::Deployments);
        info!(deployment_id = %record.id, name = %record.name, "deployment removed");
    }

    async fn place(&mut self, record: &DeploymentRecord) {
        match scheduler::place(record, &self.registry, &self.ledger, &self.assignments) {
            Ok(node_id) => {
                // try_reserve committed inside the scheduler; the
                // assignment is recorded before the command goes out.
                if !self.assignments.assign(record.id, &node_id, true) {
                    crate::fatal_invariant("deployment already assigned during placement");
                }
                info!(
                    deployment_id = %record.id,
                    name = %record.name,
                    node_id = %node_id,
                    "deployment placed"
                );
                self.send_command(record, &node_id, DeploymentAction::Start);
                self.bus.notify(ChangeEvent::Deployments);
            }
            Err(e) => {
                let reason = e.as_reason();
                if self.assignments.unassigned_reason(record.id).as_deref() != Some(reason) {
                    warn!(
                        deployment_id = %record.id,
                        name = %record.name,
                        reason,
                        "deployment not placed"
                    );
                    self.assignments.set_unassigned_reason(record.id, reason);
                    self.bus.notify(ChangeEvent::Deployments);
                }
            }
        }
    }

    /// A command for `revision` is due when it has never been issued at
    /// this revision, or the previous issue exceeded the ack timeout.
    fn command_due(&self, assignment: &Assignment, revision: u64) -> bool {
        if assignment.last_command_revision < revision {
            return true;
        }
        assignment
            .last_command_at
            .map_or(true, |t| t.elapsed() >= self.config.command_ack_timeout)
    }

    fn send_command(&mut self, record: &DeploymentRecord, node_id: &str, action: DeploymentAction) {
        let msg = ConductorToNode::DeploymentReq(DeploymentReq {
            action,
            deployment_id: record.id,
            spec_revision: record.spec_revision,
            kind: record.kind,
            capacity_requests: record.capacity_requests.clone(),
            specification: record.specification.clone(),
        });
        match self.registry.send(node_id, msg) {
            Ok(()) => {
                debug!(
                    deployment_id = %record.id,
                    node_id,
                    ?action,
                    revision = record.spec_revision,
                    "command queued"
                );
                self.assignments
                    .mark_command_sent(record.id, record.spec_revision);
            }
            Err(e) => {
                // Re-issued on a later tick via the ack timeout.
                warn!(
                    deployment_id = %record.id,
                    node_id,
                    ?action,
                    error = %e,
                    "command not delivered"
                );
            }
        }
    }

    fn release_capacity(&self, record: &DeploymentRecord, node_id: &str) {
        match self.ledger.release(node_id, &record.capacity_requests) {
            Ok(()) => {}
            // The node's row was dropped with the node itself.
            Err(LedgerError::UnknownNode(_)) => {}
            Err(e @ LedgerError::Underflow { .. }) => {
                crate::fatal_invariant(&format!("capacity release underflow: {e}"));
            }
            Err(e) => warn!(error = %e, "capacity release failed"),
        }
    }
}
