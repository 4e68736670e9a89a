//! Supervisor lifecycle scenarios with real child processes.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::json;
use symphony_id::DeploymentId;
use symphony_proto::{
    CurrentState, DeployKind, DeploymentAction, DeploymentReq, DeploymentStatus, LogStream,
};
use symphony_node::supervisor::Supervisor;

fn exec_req(
    id: DeploymentId,
    revision: u64,
    spec: serde_json::Value,
    action: DeploymentAction,
) -> DeploymentReq {
    DeploymentReq {
        action,
        deployment_id: id,
        spec_revision: revision,
        kind: DeployKind::Exec,
        capacity_requests: BTreeMap::from([("A".to_string(), 1)]),
        specification: spec,
    }
}

async fn status_of(supervisor: &Supervisor, id: DeploymentId) -> Option<DeploymentStatus> {
    supervisor
        .status_list()
        .await
        .deployments
        .into_iter()
        .find(|s| s.deployment_id == id)
}

/// Poll until the deployment reaches `state` or the timeout passes.
async fn wait_for_state(
    supervisor: &Supervisor,
    id: DeploymentId,
    state: CurrentState,
    timeout: Duration,
) -> DeploymentStatus {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = status_of(supervisor, id).await {
            if status.current_state == state {
                return status;
            }
        }
        if Instant::now() >= deadline {
            let status = status_of(supervisor, id).await;
            panic!("deployment never reached {state:?}, last: {status:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn start_then_stop_lifecycle() {
    let (supervisor, _pulse) = Supervisor::new();
    let id = DeploymentId::new();

    supervisor
        .apply(exec_req(
            id,
            1,
            json!({"command": ["/bin/sh", "-c", "sleep 30"]}),
            DeploymentAction::Start,
        ))
        .await;

    let status = status_of(&supervisor, id).await.unwrap();
    assert!(matches!(
        status.current_state,
        CurrentState::Starting | CurrentState::Running
    ));
    assert!(status.pid.is_some());

    // Starting → Running after the one-second grace.
    let status = wait_for_state(&supervisor, id, CurrentState::Running, Duration::from_secs(3)).await;
    assert_eq!(status.revision_acked, 1);

    supervisor.stop(id, 2).await;
    let status = wait_for_state(&supervisor, id, CurrentState::Stopped, Duration::from_secs(3)).await;
    assert!(status.pid.is_none());
    assert_eq!(status.revision_acked, 2);
}

#[tokio::test]
async fn zero_exit_lands_in_stopped() {
    let (supervisor, _pulse) = Supervisor::new();
    let id = DeploymentId::new();

    supervisor
        .apply(exec_req(
            id,
            1,
            json!({"command": ["/bin/true"], "restart_policy": {"type": "never"}}),
            DeploymentAction::Start,
        ))
        .await;

    let status = wait_for_state(&supervisor, id, CurrentState::Stopped, Duration::from_secs(5)).await;
    assert_eq!(status.exit_code, Some(0));
}

#[tokio::test]
async fn nonzero_exit_fails_without_restart() {
    let (supervisor, _pulse) = Supervisor::new();
    let id = DeploymentId::new();

    supervisor
        .apply(exec_req(
            id,
            1,
            json!({"command": ["/bin/sh", "-c", "exit 7"], "restart_policy": {"type": "never"}}),
            DeploymentAction::Start,
        ))
        .await;

    let status = wait_for_state(&supervisor, id, CurrentState::Failed, Duration::from_secs(5)).await;
    assert_eq!(status.exit_code, Some(7));
    assert_eq!(status.restart_count, 0);
}

#[tokio::test]
async fn on_failure_policy_restarts_with_budget() {
    let (supervisor, _pulse) = Supervisor::new();
    let id = DeploymentId::new();

    supervisor
        .apply(exec_req(
            id,
            1,
            json!({
                "command": ["/bin/sh", "-c", "exit 1"],
                "restart_policy": {
                    "type": "on-failure",
                    "backoff_seconds": 0.05,
                    "max_restarts": 2,
                    "restart_window_sec": 60,
                },
            }),
            DeploymentAction::Start,
        ))
        .await;

    // Two restart attempts, then the budget suppresses further ones
    // and the deployment settles in Failed.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = status_of(&supervisor, id).await.unwrap();
        if status.restart_count == 2 && status.current_state == CurrentState::Failed {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "restart budget never settled: {status:?}"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Give it a moment to prove no third attempt happens.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let status = status_of(&supervisor, id).await.unwrap();
    assert_eq!(status.restart_count, 2);

    let ring = supervisor.log_ring(id).unwrap();
    assert!(ring
        .tail(50)
        .iter()
        .any(|e| e.line.contains("restart suppressed")));
}

#[tokio::test]
async fn stop_grace_escalates_to_kill() {
    let (supervisor, _pulse) = Supervisor::new();
    let id = DeploymentId::new();

    supervisor
        .apply(exec_req(
            id,
            1,
            json!({
                "command": ["/bin/sh", "-c", "trap '' TERM; sleep 30"],
                "stop_grace_ms": 300,
            }),
            DeploymentAction::Start,
        ))
        .await;
    wait_for_state(&supervisor, id, CurrentState::Running, Duration::from_secs(3)).await;

    let stop_started = Instant::now();
    supervisor.stop(id, 2).await;
    let status = wait_for_state(&supervisor, id, CurrentState::Stopped, Duration::from_secs(3)).await;

    // SIGTERM was ignored; SIGKILL (−9) finished the job after grace.
    assert_eq!(status.exit_code, Some(-libc::SIGKILL));
    assert!(stop_started.elapsed() >= Duration::from_millis(300));

    let ring = supervisor.log_ring(id).unwrap();
    assert!(ring
        .tail(20)
        .iter()
        .any(|e| e.line.contains("stop grace expired")));
}

#[tokio::test]
async fn stdout_and_stderr_are_captured_and_tagged() {
    let (supervisor, _pulse) = Supervisor::new();
    let id = DeploymentId::new();

    supervisor
        .apply(exec_req(
            id,
            1,
            json!({"command": ["/bin/sh", "-c", "echo out-line; echo err-line 1>&2; sleep 5"]}),
            DeploymentAction::Start,
        ))
        .await;

    let ring = supervisor.log_ring(id).unwrap();
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let entries = ring.tail(50);
        let has_out = entries
            .iter()
            .any(|e| e.stream == LogStream::Stdout && e.line == "out-line");
        let has_err = entries
            .iter()
            .any(|e| e.stream == LogStream::Stderr && e.line == "err-line");
        if has_out && has_err {
            break;
        }
        assert!(Instant::now() < deadline, "log lines never arrived");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    supervisor.stop(id, 2).await;
}

#[tokio::test]
async fn auto_restart_schedule_is_armed_on_spawn() {
    let (supervisor, _pulse) = Supervisor::new();
    let id = DeploymentId::new();

    supervisor
        .apply(exec_req(
            id,
            1,
            json!({
                "command": ["/bin/sleep", "30"],
                "auto_restart": {"enabled": true, "cron": "* * * * *"},
            }),
            DeploymentAction::Start,
        ))
        .await;

    let ring = supervisor.log_ring(id).unwrap();
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if ring
            .tail(20)
            .iter()
            .any(|e| e.stream == LogStream::System && e.line.contains("auto restart scheduled at"))
        {
            break;
        }
        assert!(Instant::now() < deadline, "schedule never armed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    supervisor.stop(id, 2).await;
}

#[tokio::test]
async fn cancel_removes_and_reports_once() {
    let (supervisor, _pulse) = Supervisor::new();
    let id = DeploymentId::new();

    supervisor
        .apply(exec_req(
            id,
            1,
            json!({"command": ["/bin/sleep", "30"]}),
            DeploymentAction::Start,
        ))
        .await;
    supervisor.cancel(id).await;

    // The final Stopped report is delivered exactly once.
    let first = supervisor.status_list().await;
    let final_report = first
        .deployments
        .iter()
        .find(|s| s.deployment_id == id)
        .expect("final status present");
    assert_eq!(final_report.current_state, CurrentState::Stopped);

    let second = supervisor.status_list().await;
    assert!(second.deployments.iter().all(|s| s.deployment_id != id));
    assert!(supervisor.log_ring(id).is_none());
}

#[tokio::test]
async fn update_with_new_spec_restarts_the_child() {
    let (supervisor, _pulse) = Supervisor::new();
    let id = DeploymentId::new();

    supervisor
        .apply(exec_req(
            id,
            1,
            json!({"command": ["/bin/sh", "-c", "sleep 30"]}),
            DeploymentAction::Start,
        ))
        .await;
    wait_for_state(&supervisor, id, CurrentState::Running, Duration::from_secs(3)).await;
    let first_pid = status_of(&supervisor, id).await.unwrap().pid;

    supervisor
        .apply(exec_req(
            id,
            2,
            json!({"command": ["/bin/sh", "-c", "sleep 60"]}),
            DeploymentAction::Update,
        ))
        .await;
    wait_for_state(&supervisor, id, CurrentState::Running, Duration::from_secs(5)).await;

    let status = status_of(&supervisor, id).await.unwrap();
    assert_eq!(status.revision_acked, 2);
    assert_ne!(status.pid, first_pid);

    supervisor.stop(id, 3).await;
}
