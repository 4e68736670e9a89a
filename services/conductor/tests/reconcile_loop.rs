//! End-to-end reconciliation scenarios against fake node sessions.
//!
//! Each test wires the real registry, ledger, store, assignment table
//! and reconciler together and drives ticks by hand; node sessions are
//! stand-ins holding the command receiver.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use symphony_conductor::assignments::AssignmentTable;
use symphony_conductor::ledger::CapacityLedger;
use symphony_conductor::reconciler::{
    ReconcileEvent, Reconciler, ReconcilerConfig, ReconcilerHandle,
};
use symphony_conductor::registry::{NodeRegistry, SessionHandle};
use symphony_conductor::store::{DeploymentRepository, MemoryRepository, NewDeployment};
use symphony_conductor::stream::EventBus;
use symphony_id::DeploymentId;
use symphony_proto::{
    ConductorToNode, CurrentState, DeployKind, DeploymentAction, DeploymentStatus,
    DeploymentStatusList, DesiredState, NodeHello, StaticResources,
};
use tokio::sync::{mpsc, watch};

struct Harness {
    registry: Arc<NodeRegistry>,
    ledger: Arc<CapacityLedger>,
    repo: Arc<dyn DeploymentRepository>,
    assignments: Arc<AssignmentTable>,
    reconciler: Reconciler,
    #[allow(dead_code)]
    handle: ReconcilerHandle,
}

struct FakeNode {
    node_id: String,
    commands: mpsc::Receiver<ConductorToNode>,
    #[allow(dead_code)]
    shutdown: watch::Receiver<bool>,
}

impl FakeNode {
    fn next_command(&mut self) -> Option<ConductorToNode> {
        self.commands.try_recv().ok()
    }

    fn drain(&mut self) -> Vec<ConductorToNode> {
        let mut commands = Vec::new();
        while let Ok(msg) = self.commands.try_recv() {
            commands.push(msg);
        }
        commands
    }
}

fn caps(pairs: &[(&str, u64)]) -> BTreeMap<String, u64> {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn harness() -> Harness {
    let registry = Arc::new(NodeRegistry::new());
    let ledger = Arc::new(CapacityLedger::new());
    let repo: Arc<dyn DeploymentRepository> = Arc::new(MemoryRepository::new());
    let assignments = Arc::new(AssignmentTable::new());
    let bus = Arc::new(EventBus::new());

    let (reconciler, handle) = Reconciler::new(
        Arc::clone(&registry),
        Arc::clone(&ledger),
        Arc::clone(&repo),
        Arc::clone(&assignments),
        bus,
        ReconcilerConfig {
            sweep_interval: Duration::from_millis(100),
            command_ack_timeout: Duration::from_millis(200),
            max_per_tick: 128,
        },
    );

    Harness {
        registry,
        ledger,
        repo,
        assignments,
        reconciler,
        handle,
    }
}

impl Harness {
    fn connect_node(&self, node_id: &str, groups: &[&str], total: &[(&str, u64)]) -> FakeNode {
        self.connect_node_with_interval(node_id, groups, total, 1000)
    }

    fn connect_node_with_interval(
        &self,
        node_id: &str,
        groups: &[&str],
        total: &[(&str, u64)],
        heartbeat_interval_ms: u64,
    ) -> FakeNode {
        let hello = NodeHello {
            node_id: node_id.to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            capacities_total: caps(total),
            heartbeat_interval_ms,
            static_resources: StaticResources::default(),
        };
        let (tx, rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.registry
            .register(
                &hello,
                SessionHandle {
                    outbound: tx,
                    shutdown: shutdown_tx,
                },
            )
            .expect("register fake node");
        self.ledger.register_node(node_id, &caps(total));

        FakeNode {
            node_id: node_id.to_string(),
            commands: rx,
            shutdown: shutdown_rx,
        }
    }

    async fn create_deployment(
        &self,
        name: &str,
        group: &str,
        requests: &[(&str, u64)],
    ) -> DeploymentId {
        // Keep created_at_ms strictly increasing so FIFO processing
        // order is deterministic in assertions.
        tokio::time::sleep(Duration::from_millis(2)).await;
        let record = self
            .repo
            .create(NewDeployment {
                name: name.to_string(),
                kind: DeployKind::Exec,
                node_group: group.to_string(),
                capacity_requests: caps(requests),
                specification: serde_json::json!({"command": ["/bin/true"]}),
                desired_state: DesiredState::Running,
            })
            .await
            .expect("create deployment");
        record.id
    }

    async fn report(&mut self, node: &FakeNode, id: DeploymentId, state: CurrentState, rev: u64) {
        self.reconciler
            .handle_event(ReconcileEvent::StatusReport {
                node_id: node.node_id.clone(),
                statuses: DeploymentStatusList {
                    deployments: vec![DeploymentStatus {
                        deployment_id: id,
                        current_state: state,
                        revision_acked: rev,
                        exit_code: None,
                        pid: None,
                        started_at_ms: None,
                        restart_count: 0,
                    }],
                },
            })
            .await;
    }
}

// S1: one eligible node, one deployment; placed within a single tick
// with the reservation visible in the ledger.
#[tokio::test]
async fn simple_placement() {
    let mut h = harness();
    let mut n1 = h.connect_node("n1", &["gpu"], &[("A", 10)]);
    let d1 = h.create_deployment("d1", "gpu", &[("A", 3)]).await;

    h.reconciler.sweep().await.unwrap();

    assert_eq!(h.assignments.node_of(d1).as_deref(), Some("n1"));
    assert_eq!(h.ledger.available("n1").unwrap(), caps(&[("A", 7)]));

    match n1.next_command() {
        Some(ConductorToNode::DeploymentReq(req)) => {
            assert_eq!(req.action, DeploymentAction::Start);
            assert_eq!(req.deployment_id, d1);
            assert_eq!(req.spec_revision, 1);
        }
        other => panic!("expected start command, got {other:?}"),
    }
}

// S2: four identical deployments over two identical nodes land 2 + 2.
#[tokio::test]
async fn balanced_distribution() {
    let mut h = harness();
    let _n1 = h.connect_node("n1", &["cpu"], &[("A", 10)]);
    let _n2 = h.connect_node("n2", &["cpu"], &[("A", 10)]);

    for name in ["d1", "d2", "d3", "d4"] {
        h.create_deployment(name, "cpu", &[("A", 3)]).await;
    }
    h.reconciler.sweep().await.unwrap();

    assert_eq!(h.assignments.count_on("n1"), 2);
    assert_eq!(h.assignments.count_on("n2"), 2);
}

// S3: the second deployment does not fit until the first is deleted
// and reaped; then it is placed on the next sweep.
#[tokio::test]
async fn insufficient_capacity_then_recovery() {
    let mut h = harness();
    let mut n1 = h.connect_node("n1", &["cpu"], &[("A", 5)]);
    let d1 = h.create_deployment("d1", "cpu", &[("A", 4)]).await;
    let d2 = h.create_deployment("d2", "cpu", &[("A", 3)]).await;

    h.reconciler.sweep().await.unwrap();

    assert_eq!(h.assignments.node_of(d1).as_deref(), Some("n1"));
    assert!(h.assignments.node_of(d2).is_none());
    assert_eq!(
        h.assignments.unassigned_reason(d2).as_deref(),
        Some("insufficient-capacity")
    );

    // Delete d1; the reconciler cancels it on the node.
    h.repo.delete(d1).await.unwrap();
    h.reconciler.sweep().await.unwrap();
    let cancel = n1
        .drain()
        .into_iter()
        .find(|c| matches!(c, ConductorToNode::DeploymentCancel(_)));
    assert!(cancel.is_some(), "expected a cancel command");

    // Node confirms teardown; the record purges and capacity frees.
    h.report(&n1, d1, CurrentState::Stopped, 1).await;
    assert!(h.repo.get(d1).await.unwrap().is_none());

    // d2 lands within one sweep.
    h.reconciler.sweep().await.unwrap();
    assert_eq!(h.assignments.node_of(d2).as_deref(), Some("n1"));
    assert_eq!(h.ledger.available("n1").unwrap(), caps(&[("A", 2)]));
}

// S4: node loss. After the grace window the deployment is unassigned
// with reason node-disconnected and a second eligible node picks it up
// within the same sweep.
#[tokio::test]
async fn node_loss_reassignment() {
    let mut h = harness();
    let n1 = h.connect_node_with_interval("n1", &["cpu"], &[("A", 10)], 1000);
    let d1 = h.create_deployment("d1", "cpu", &[("A", 3)]).await;

    h.reconciler.sweep().await.unwrap();
    assert_eq!(h.assignments.node_of(d1).as_deref(), Some("n1"));
    h.report(&n1, d1, CurrentState::Running, 1).await;

    // Session dies; the record survives its one-interval grace window.
    h.registry.deregister("n1", "transport-error");
    h.reconciler.sweep().await.unwrap();
    assert_eq!(
        h.assignments.node_of(d1).as_deref(),
        Some("n1"),
        "assignment must survive the grace window"
    );

    let mut n2 = h.connect_node("n2", &["cpu"], &[("A", 10)]);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    h.reconciler.sweep().await.unwrap();

    assert_eq!(h.assignments.node_of(d1).as_deref(), Some("n2"));
    assert_eq!(h.ledger.available("n2").unwrap(), caps(&[("A", 7)]));
    assert!(h.registry.get("n1").is_none(), "n1 reaped after grace");

    match n2.next_command() {
        Some(ConductorToNode::DeploymentReq(req)) => {
            assert_eq!(req.action, DeploymentAction::Start);
            assert_eq!(req.deployment_id, d1);
        }
        other => panic!("expected start on n2, got {other:?}"),
    }
}

// S5: desired-state toggle. Stop releases capacity but keeps the node
// affinity; starting again re-reserves on the same node.
#[tokio::test]
async fn desired_state_toggle() {
    let mut h = harness();
    let mut n1 = h.connect_node("n1", &["cpu"], &[("A", 10)]);
    let d1 = h.create_deployment("d1", "cpu", &[("A", 3)]).await;

    h.reconciler.sweep().await.unwrap();
    h.report(&n1, d1, CurrentState::Running, 1).await;
    n1.drain();

    // PATCH desired → STOPPED bumps the revision and triggers a stop.
    h.repo
        .update(
            d1,
            symphony_conductor::store::DeploymentPatch {
                desired_state: Some(DesiredState::Stopped),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.reconciler
        .handle_event(ReconcileEvent::DeploymentChanged(d1))
        .await;

    match n1.next_command() {
        Some(ConductorToNode::DeploymentReq(req)) => {
            assert_eq!(req.action, DeploymentAction::Stop);
            assert_eq!(req.spec_revision, 2);
        }
        other => panic!("expected stop command, got {other:?}"),
    }

    // Node reports the stop; capacity frees, assignment stays.
    h.report(&n1, d1, CurrentState::Stopped, 2).await;
    let assignment = h.assignments.get(d1).unwrap();
    assert_eq!(assignment.node_id, "n1");
    assert_eq!(assignment.reported_state, CurrentState::Stopped);
    assert!(!assignment.capacity_held);
    assert_eq!(h.ledger.available("n1").unwrap(), caps(&[("A", 10)]));

    // Toggle back to RUNNING: re-reserve on the same node, start again.
    h.repo
        .update(
            d1,
            symphony_conductor::store::DeploymentPatch {
                desired_state: Some(DesiredState::Running),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.reconciler
        .handle_event(ReconcileEvent::DeploymentChanged(d1))
        .await;

    assert_eq!(h.ledger.available("n1").unwrap(), caps(&[("A", 7)]));
    let commands = n1.drain();
    assert!(
        commands.iter().any(|c| matches!(
            c,
            ConductorToNode::DeploymentReq(req) if req.spec_revision == 3
        )),
        "expected a command at revision 3, got {commands:?}"
    );
}

// A spec PATCH on a running deployment sends an UPDATE immediately
// rather than waiting out the ack timeout.
#[tokio::test]
async fn spec_patch_sends_update_immediately() {
    let mut h = harness();
    let mut n1 = h.connect_node("n1", &["cpu"], &[("A", 10)]);
    let d1 = h.create_deployment("d1", "cpu", &[("A", 3)]).await;

    h.reconciler.sweep().await.unwrap();
    h.report(&n1, d1, CurrentState::Running, 1).await;
    n1.drain();

    h.repo
        .update(
            d1,
            symphony_conductor::store::DeploymentPatch {
                specification: Some(serde_json::json!({"command": ["/bin/sleep", "1"]})),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.reconciler
        .handle_event(ReconcileEvent::DeploymentChanged(d1))
        .await;

    match n1.next_command() {
        Some(ConductorToNode::DeploymentReq(req)) => {
            assert_eq!(req.action, DeploymentAction::Update);
            assert_eq!(req.spec_revision, 2);
        }
        other => panic!("expected update command, got {other:?}"),
    }
}

// No eligible node: the reason distinguishes a group mismatch from a
// capacity shortage.
#[tokio::test]
async fn group_mismatch_reason() {
    let mut h = harness();
    let _n1 = h.connect_node("n1", &["cpu"], &[("A", 10)]);
    let d1 = h.create_deployment("d1", "gpu", &[("A", 1)]).await;

    h.reconciler.sweep().await.unwrap();

    assert!(h.assignments.node_of(d1).is_none());
    assert_eq!(
        h.assignments.unassigned_reason(d1).as_deref(),
        Some("no-eligible-node")
    );
}

// An unacknowledged command is re-issued once the ack timeout passes.
#[tokio::test]
async fn command_reissued_after_ack_timeout() {
    let mut h = harness();
    let mut n1 = h.connect_node("n1", &["cpu"], &[("A", 10)]);
    let d1 = h.create_deployment("d1", "cpu", &[("A", 3)]).await;

    h.reconciler.sweep().await.unwrap();
    assert!(matches!(
        n1.next_command(),
        Some(ConductorToNode::DeploymentReq(_))
    ));

    // No ack arrives. Within the timeout nothing is re-sent …
    h.reconciler.sweep().await.unwrap();
    assert!(n1.next_command().is_none());

    // … but after it, the command goes out again.
    tokio::time::sleep(Duration::from_millis(250)).await;
    h.reconciler.sweep().await.unwrap();
    match n1.next_command() {
        Some(ConductorToNode::DeploymentReq(req)) => assert_eq!(req.deployment_id, d1),
        other => panic!("expected re-issued command, got {other:?}"),
    }
}
