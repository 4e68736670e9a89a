//! Execution supervisor: realizes deployment assignments as managed
//! child processes.
//!
//! One entry per deployment id. Lifecycle per child:
//! Pending → Starting → Running → Stopping → Stopped, with Failed on
//! non-zero exit or spawn failure. Stop sends the configured signal and
//! escalates to SIGKILL after the stop grace. The on-failure restart
//! policy re-enters Starting after an exponential backoff, bounded by a
//! restart budget window. Every state change emits a pulse so the agent
//! can push a status report immediately.

use std::collections::{BTreeMap, HashMap};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use symphony_id::DeploymentId;
use symphony_proto::{
    CurrentState, DeployKind, DeploymentReq, DeploymentStatus, DeploymentStatusList, DesiredState,
    LogStream,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::logs::LogRing;
use crate::workload::{self, ExecSpec, RestartPolicyType, WorkloadError};
use crate::{conda, cron, repo};

/// A child that survives this long past Starting is considered Running.
const START_GRACE: Duration = Duration::from_secs(1);
/// Poll cadence while waiting for a signaled child to exit.
const EXIT_POLL: Duration = Duration::from_millis(25);
/// Cap on the exponential restart backoff.
const MAX_RESTART_BACKOFF: Duration = Duration::from_secs(60);
/// Exit code synthesized when the child could not be spawned.
const SPAWN_FAILURE_EXIT_CODE: i32 = -1;

struct ManagedState {
    spec: Option<ExecSpec>,
    kind: DeployKind,
    capacity_requests: BTreeMap<String, u64>,
    desired: DesiredState,
    status: CurrentState,
    revision_acked: u64,
    pid: Option<i32>,
    /// Bumped on every spawn; stale grace/waiter tasks check it.
    generation: u64,
    started_at_ms: Option<i64>,
    stopped_at_ms: Option<i64>,
    last_exit_code: Option<i32>,
    restart_count: u32,
    restart_times: Vec<Instant>,
}

/// One supervised deployment.
pub struct Managed {
    id: DeploymentId,
    logs: Arc<LogRing>,
    state: Mutex<ManagedState>,
}

impl Managed {
    fn new(id: DeploymentId) -> Self {
        Self {
            id,
            logs: Arc::new(LogRing::new(crate::logs::DEFAULT_LOG_CAPACITY)),
            state: Mutex::new(ManagedState {
                spec: None,
                kind: DeployKind::Exec,
                capacity_requests: BTreeMap::new(),
                desired: DesiredState::Stopped,
                status: CurrentState::Pending,
                revision_acked: 0,
                pid: None,
                generation: 0,
                started_at_ms: None,
                stopped_at_ms: None,
                last_exit_code: None,
                restart_count: 0,
                restart_times: Vec::new(),
            }),
        }
    }

    fn status_snapshot(&self, state: &ManagedState) -> DeploymentStatus {
        DeploymentStatus {
            deployment_id: self.id,
            current_state: state.status,
            revision_acked: state.revision_acked,
            exit_code: state.last_exit_code,
            pid: state.pid.map(|p| p as u32),
            started_at_ms: state.started_at_ms,
            restart_count: state.restart_count,
        }
    }
}

struct Inner {
    deployments: StdMutex<HashMap<DeploymentId, Arc<Managed>>>,
    /// Last reports of deployments removed by cancel, delivered once.
    final_statuses: StdMutex<Vec<DeploymentStatus>>,
    /// Base directory for git-repo workdirs.
    repo_dir: PathBuf,
    pulse: mpsc::Sender<()>,
}

/// The node's deployment supervisor. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create the supervisor and the pulse channel the agent listens
    /// on for immediate status pushes.
    pub fn new() -> (Self, mpsc::Receiver<()>) {
        Self::with_repo_dir(std::env::temp_dir().join("symphony").join("repos"))
    }

    /// Like [`Supervisor::new`], with an explicit git workdir base.
    pub fn with_repo_dir(repo_dir: PathBuf) -> (Self, mpsc::Receiver<()>) {
        let (pulse, pulse_rx) = mpsc::channel(16);
        (
            Self {
                inner: Arc::new(Inner {
                    deployments: StdMutex::new(HashMap::new()),
                    final_statuses: StdMutex::new(Vec::new()),
                    repo_dir,
                    pulse,
                }),
            },
            pulse_rx,
        )
    }

    fn pulse(&self) {
        // A full channel already has a pending pulse; that is enough.
        let _ = self.inner.pulse.try_send(());
    }

    fn get(&self, id: DeploymentId) -> Option<Arc<Managed>> {
        let deployments = self.inner.deployments.lock().expect("supervisor lock poisoned");
        deployments.get(&id).cloned()
    }

    fn get_or_create(&self, id: DeploymentId) -> Arc<Managed> {
        let mut deployments = self.inner.deployments.lock().expect("supervisor lock poisoned");
        Arc::clone(
            deployments
                .entry(id)
                .or_insert_with(|| Arc::new(Managed::new(id))),
        )
    }

    /// Apply a conductor command. Start/Update with a stale revision
    /// are ignored; Stop always applies.
    pub async fn apply(&self, req: DeploymentReq) {
        match req.action {
            symphony_proto::DeploymentAction::Stop => {
                self.stop(req.deployment_id, req.spec_revision).await;
            }
            symphony_proto::DeploymentAction::Start | symphony_proto::DeploymentAction::Update => {
                self.ensure(req).await;
            }
        }
    }

    async fn ensure(&self, req: DeploymentReq) {
        let managed = self.get_or_create(req.deployment_id);

        let action = {
            let mut state = managed.state.lock().await;
            if req.spec_revision <= state.revision_acked {
                debug!(
                    deployment_id = %req.deployment_id,
                    revision = req.spec_revision,
                    acked = state.revision_acked,
                    "ignoring stale command"
                );
                return;
            }
            state.revision_acked = req.spec_revision;
            state.kind = req.kind;
            state.capacity_requests = req.capacity_requests.clone();
            state.desired = DesiredState::Running;

            match workload::decode(req.kind, &req.specification) {
                Err(e) => {
                    // A live child keeps running on its previous spec;
                    // only a never-started deployment fails outright.
                    if state.pid.is_none() {
                        state.status = CurrentState::Failed;
                        state.last_exit_code = Some(SPAWN_FAILURE_EXIT_CODE);
                    }
                    let detail = match &e {
                        WorkloadError::UnsupportedKind(kind) => {
                            format!("no runtime backend for kind {kind:?} on this node")
                        }
                        other => format!("specification rejected: {other}"),
                    };
                    managed.logs.push(LogStream::System, detail.clone());
                    warn!(deployment_id = %req.deployment_id, detail = %detail, "spec not applied");
                    EnsureAction::Report
                }
                Ok(spec) => {
                    managed.logs.set_capacity(spec.log_limit_lines);
                    let changed = state.spec.as_ref() != Some(&spec);
                    let running = state.pid.is_some()
                        && matches!(state.status, CurrentState::Starting | CurrentState::Running);
                    state.spec = Some(spec);
                    if running && changed {
                        EnsureAction::Restart
                    } else if running {
                        EnsureAction::Nothing
                    } else {
                        EnsureAction::Spawn
                    }
                }
            }
        };

        match action {
            EnsureAction::Report => self.pulse(),
            EnsureAction::Nothing => {
                debug!(deployment_id = %req.deployment_id, "spec unchanged, child kept");
                self.pulse();
            }
            EnsureAction::Spawn => self.spawn_child(&managed).await,
            EnsureAction::Restart => {
                managed
                    .logs
                    .push(LogStream::System, "spec updated; restarting to apply");
                self.halt_child(&managed, "spec updated").await;
                self.spawn_child(&managed).await;
            }
        }
    }

    /// Drive the deployment to Stopped. Applies regardless of revision.
    pub async fn stop(&self, id: DeploymentId, revision: u64) {
        let Some(managed) = self.get(id) else {
            // Nothing to stop here (e.g. this node restarted and lost
            // the child). Report it terminal once so the conductor
            // converges instead of re-issuing the command forever.
            debug!(deployment_id = %id, "stop for unknown deployment");
            self.push_final_status(id, revision);
            return;
        };

        {
            let mut state = managed.state.lock().await;
            state.desired = DesiredState::Stopped;
            state.revision_acked = state.revision_acked.max(revision);
        }

        let had_child = self.halt_child(&managed, "stop requested").await;
        {
            let mut state = managed.state.lock().await;
            if !had_child && !state.status.is_terminal() {
                state.status = CurrentState::Stopped;
                state.stopped_at_ms = Some(chrono::Utc::now().timestamp_millis());
            }
        }
        info!(deployment_id = %id, "stop completed");
        self.pulse();
    }

    /// Tear the deployment down entirely (deletion). The final Stopped
    /// status is delivered once on the next report.
    pub async fn cancel(&self, id: DeploymentId) {
        let Some(managed) = self.get(id) else {
            self.push_final_status(id, 0);
            return;
        };

        {
            let mut state = managed.state.lock().await;
            state.desired = DesiredState::Stopped;
        }
        self.halt_child(&managed, "cancelled").await;

        let final_status = {
            let mut state = managed.state.lock().await;
            state.status = CurrentState::Stopped;
            managed.status_snapshot(&state)
        };

        {
            let mut deployments =
                self.inner.deployments.lock().expect("supervisor lock poisoned");
            deployments.remove(&id);
        }
        {
            let mut finals = self
                .inner
                .final_statuses
                .lock()
                .expect("supervisor lock poisoned");
            finals.push(final_status);
        }
        info!(deployment_id = %id, "deployment cancelled and removed");
        self.pulse();
    }

    /// Current state of every deployment, plus one-shot final reports
    /// for recently removed ones.
    pub async fn status_list(&self) -> DeploymentStatusList {
        let managed: Vec<Arc<Managed>> = {
            let deployments = self.inner.deployments.lock().expect("supervisor lock poisoned");
            deployments.values().cloned().collect()
        };

        let mut deployments = Vec::with_capacity(managed.len());
        for entry in managed {
            let state = entry.state.lock().await;
            deployments.push(entry.status_snapshot(&state));
        }

        let mut finals = self
            .inner
            .final_statuses
            .lock()
            .expect("supervisor lock poisoned");
        deployments.extend(finals.drain(..));

        DeploymentStatusList { deployments }
    }

    /// Sum of capacity requests over deployments that currently occupy
    /// this node.
    pub async fn capacities_used(&self) -> BTreeMap<String, u64> {
        let managed: Vec<Arc<Managed>> = {
            let deployments = self.inner.deployments.lock().expect("supervisor lock poisoned");
            deployments.values().cloned().collect()
        };

        let mut used = BTreeMap::new();
        for entry in managed {
            let state = entry.state.lock().await;
            if matches!(
                state.status,
                CurrentState::Starting | CurrentState::Running | CurrentState::Stopping
            ) {
                for (label, amount) in &state.capacity_requests {
                    *used.entry(label.clone()).or_insert(0) += amount;
                }
            }
        }
        used
    }

    /// One-shot terminal report for a deployment this node holds no
    /// runtime for.
    fn push_final_status(&self, id: DeploymentId, revision: u64) {
        let mut finals = self
            .inner
            .final_statuses
            .lock()
            .expect("supervisor lock poisoned");
        finals.push(DeploymentStatus {
            deployment_id: id,
            current_state: CurrentState::Stopped,
            revision_acked: revision,
            exit_code: None,
            pid: None,
            started_at_ms: None,
            restart_count: 0,
        });
        drop(finals);
        self.pulse();
    }

    /// The log ring for a deployment, for subscription forwarding.
    pub fn log_ring(&self, id: DeploymentId) -> Option<Arc<LogRing>> {
        self.get(id).map(|m| Arc::clone(&m.logs))
    }

    pub fn deployment_ids(&self) -> Vec<DeploymentId> {
        let deployments = self.inner.deployments.lock().expect("supervisor lock poisoned");
        deployments.keys().copied().collect()
    }

    /// Spawn the child for the current spec. No-op if one is running.
    async fn spawn_child(&self, managed: &Arc<Managed>) {
        let (spec, generation) = {
            let mut state = managed.state.lock().await;
            if state.pid.is_some() {
                return;
            }
            let Some(spec) = state.spec.clone() else {
                return;
            };
            state.generation += 1;
            state.status = CurrentState::Starting;
            state.started_at_ms = Some(chrono::Utc::now().timestamp_millis());
            state.stopped_at_ms = None;
            state.last_exit_code = None;
            (spec, state.generation)
        };

        managed
            .logs
            .push(LogStream::System, format!("starting: {:?}", spec.command));
        self.pulse();

        let mut workdir = spec.cwd.clone().map(PathBuf::from);
        if let Some(repo_config) = spec.repo_config() {
            let key = managed.id.to_string();
            match repo::prepare(&self.inner.repo_dir, &key, &repo_config).await {
                Ok(dir) => {
                    managed.logs.push(
                        LogStream::System,
                        format!("git repo prepared at {}", dir.display()),
                    );
                    workdir = Some(dir);
                }
                Err(e) => {
                    {
                        let mut state = managed.state.lock().await;
                        if state.generation != generation {
                            return;
                        }
                        state.status = CurrentState::Failed;
                        state.last_exit_code = Some(SPAWN_FAILURE_EXIT_CODE);
                        state.stopped_at_ms = Some(chrono::Utc::now().timestamp_millis());
                    }
                    managed
                        .logs
                        .push(LogStream::System, format!("git repo prep failed: {e}"));
                    warn!(deployment_id = %managed.id, error = %e, "git repo prep failed");
                    self.pulse();
                    return;
                }
            }
        }

        let argv = match spec.conda_env.as_deref().map(str::trim) {
            Some(env) if !env.is_empty() => conda::activation_command(env, &spec.command),
            _ => spec.command.clone(),
        };

        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &workdir {
            command.current_dir(cwd);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                {
                    let mut state = managed.state.lock().await;
                    state.status = CurrentState::Failed;
                    state.last_exit_code = Some(SPAWN_FAILURE_EXIT_CODE);
                    state.stopped_at_ms = Some(chrono::Utc::now().timestamp_millis());
                }
                managed
                    .logs
                    .push(LogStream::System, format!("failed to spawn: {e}"));
                warn!(deployment_id = %managed.id, error = %e, "spawn failed");
                self.pulse();
                self.maybe_restart(managed, generation, SPAWN_FAILURE_EXIT_CODE)
                    .await;
                return;
            }
        };

        let pid = child.id().map(|p| p as i32);
        let stop_raced = {
            let mut state = managed.state.lock().await;
            state.pid = pid;
            state.desired == DesiredState::Stopped
        };
        info!(deployment_id = %managed.id, pid = ?pid, "child started");
        self.pulse();

        if let Some(stdout) = child.stdout.take() {
            let logs = Arc::clone(&managed.logs);
            tokio::spawn(pump_stream(logs, LogStream::Stdout, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            let logs = Arc::clone(&managed.logs);
            tokio::spawn(pump_stream(logs, LogStream::Stderr, stderr));
        }

        // Starting → Running after the grace period without an exit.
        {
            let supervisor = self.clone();
            let managed = Arc::clone(managed);
            tokio::spawn(async move {
                tokio::time::sleep(START_GRACE).await;
                let promoted = {
                    let mut state = managed.state.lock().await;
                    if state.generation == generation && state.status == CurrentState::Starting {
                        state.status = CurrentState::Running;
                        true
                    } else {
                        false
                    }
                };
                if promoted {
                    debug!(deployment_id = %managed.id, "child running");
                    supervisor.pulse();
                }
            });
        }

        // Waiter owns the child handle.
        {
            let supervisor = self.clone();
            let managed = Arc::clone(managed);
            tokio::spawn(async move {
                supervisor.wait_child(managed, child, generation).await;
            });
        }

        // Scheduled restart: one task per spawn, firing once at the
        // next cron match for this generation.
        if let Some((schedule, zone)) = spec.auto_restart_schedule() {
            let supervisor = self.clone();
            let managed = Arc::clone(managed);
            tokio::spawn(async move {
                supervisor
                    .run_auto_restart(managed, schedule, zone, generation)
                    .await;
            });
        }

        // A stop that raced the spawn wins.
        if stop_raced {
            self.halt_child(managed, "stopped during spawn").await;
        }
    }

    /// Sleep until the next schedule match, then restart the child if
    /// this spawn generation is still the live one. The replacement
    /// spawn arms the following occurrence.
    async fn run_auto_restart(
        &self,
        managed: Arc<Managed>,
        schedule: cron::CronSchedule,
        zone: cron::CronZone,
        generation: u64,
    ) {
        let now = chrono::Utc::now();
        let Some(next) = cron::next_fire(&schedule, &zone, now) else {
            managed.logs.push(
                LogStream::System,
                "auto restart disabled: no matching schedule time in horizon",
            );
            return;
        };

        managed.logs.push(
            LogStream::System,
            format!("auto restart scheduled at {}", next.to_rfc3339()),
        );
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(delay).await;

        let due = {
            let state = managed.state.lock().await;
            state.generation == generation && state.desired == DesiredState::Running
        };
        if !due {
            return;
        }

        managed
            .logs
            .push(LogStream::System, "scheduled restart triggered");
        info!(deployment_id = %managed.id, "scheduled restart triggered");
        self.halt_child(&managed, "scheduled restart").await;
        self.schedule_spawn(managed);
    }

    async fn wait_child(
        &self,
        managed: Arc<Managed>,
        mut child: tokio::process::Child,
        generation: u64,
    ) {
        let exit = child.wait().await;
        let code = match &exit {
            Ok(status) => status
                .code()
                .unwrap_or_else(|| status.signal().map(|s| -s).unwrap_or(-1)),
            Err(_) => -1,
        };

        {
            let mut state = managed.state.lock().await;
            if state.generation != generation {
                return;
            }
            state.pid = None;
            state.last_exit_code = Some(code);
            state.stopped_at_ms = Some(chrono::Utc::now().timestamp_millis());

            let was_stopping = state.status == CurrentState::Stopping;
            state.status = if was_stopping || state.desired == DesiredState::Stopped || code == 0 {
                CurrentState::Stopped
            } else {
                CurrentState::Failed
            };
        }

        managed
            .logs
            .push(LogStream::System, format!("process exited (code={code})"));
        info!(deployment_id = %managed.id, code, "child exited");
        self.pulse();

        if code != 0 {
            self.maybe_restart(&managed, generation, code).await;
        }
    }

    /// Apply the restart policy after a failure exit. Restart attempts
    /// do not change the acked revision.
    async fn maybe_restart(&self, managed: &Arc<Managed>, generation: u64, exit_code: i32) {
        let backoff = {
            let mut state = managed.state.lock().await;
            if state.generation != generation
                || state.desired != DesiredState::Running
                || state.status != CurrentState::Failed
            {
                return;
            }
            let Some(spec) = state.spec.clone() else {
                return;
            };
            if spec.restart_policy.policy_type == RestartPolicyType::Never {
                return;
            }

            let window = Duration::from_secs(spec.restart_policy.restart_window_sec);
            let now = Instant::now();
            state
                .restart_times
                .retain(|t| now.saturating_duration_since(*t) <= window);
            if state.restart_times.len() >= spec.restart_policy.max_restarts as usize {
                managed.logs.push(
                    LogStream::System,
                    format!(
                        "restart suppressed: {} restarts within {}s",
                        spec.restart_policy.max_restarts, spec.restart_policy.restart_window_sec
                    ),
                );
                return;
            }
            state.restart_times.push(now);
            state.restart_count += 1;

            let attempt = state.restart_times.len().max(1) as u32;
            let base_ms = (spec.restart_policy.backoff_seconds.max(0.0) * 1000.0) as u64;
            let backoff = Duration::from_millis(
                base_ms.saturating_mul(1u64 << (attempt - 1).min(16)),
            )
            .min(MAX_RESTART_BACKOFF);
            backoff
        };

        managed.logs.push(
            LogStream::System,
            format!(
                "restarting after failure (exit_code={exit_code}) in {:.1}s",
                backoff.as_secs_f64()
            ),
        );
        tokio::time::sleep(backoff).await;

        let still_wanted = {
            let state = managed.state.lock().await;
            state.generation == generation
                && state.desired == DesiredState::Running
                && state.pid.is_none()
        };
        if still_wanted {
            self.schedule_spawn(Arc::clone(managed));
        }
    }

    /// Re-enter spawn from a fresh task; keeps the restart path out of
    /// the spawn future itself.
    fn schedule_spawn(&self, managed: Arc<Managed>) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.spawn_child(&managed).await;
        });
    }

    /// Signal the child and wait for it to exit, escalating to SIGKILL
    /// after the stop grace. Returns whether a child existed.
    async fn halt_child(&self, managed: &Arc<Managed>, reason: &str) -> bool {
        let (pid, generation, signal, grace) = {
            let mut state = managed.state.lock().await;
            let Some(pid) = state.pid else {
                return false;
            };
            state.status = CurrentState::Stopping;
            let spec = state.spec.as_ref();
            let signal = spec
                .and_then(|s| workload::signal_number(&s.stop_signal))
                .unwrap_or(libc::SIGTERM);
            let grace = spec.map(|s| s.stop_grace_ms).unwrap_or(10_000);
            (pid, state.generation, signal, grace)
        };

        managed
            .logs
            .push(LogStream::System, format!("stopping ({reason})"));
        self.pulse();
        send_signal(pid, signal);

        let deadline = Instant::now() + Duration::from_millis(grace);
        let mut killed = false;
        loop {
            {
                let state = managed.state.lock().await;
                if state.generation != generation || state.pid.is_none() {
                    return true;
                }
            }
            if !killed && Instant::now() >= deadline {
                managed
                    .logs
                    .push(LogStream::System, "stop grace expired, killing");
                warn!(deployment_id = %managed.id, pid, "escalating to SIGKILL");
                send_signal(pid, libc::SIGKILL);
                killed = true;
            }
            tokio::time::sleep(EXIT_POLL).await;
        }
    }
}

enum EnsureAction {
    Spawn,
    Restart,
    Nothing,
    Report,
}

fn send_signal(pid: i32, signal: i32) {
    // SAFETY: plain kill(2); ESRCH for an already-gone pid is benign.
    unsafe {
        libc::kill(pid, signal);
    }
}

async fn pump_stream(
    logs: Arc<LogRing>,
    stream: LogStream,
    source: impl tokio::io::AsyncRead + Unpin,
) {
    let mut lines = BufReader::new(source).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => logs.push(stream, line),
            Ok(None) => break,
            Err(e) => {
                logs.push(LogStream::System, format!("log pump error ({stream:?}): {e}"));
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use symphony_proto::DeploymentAction;

    fn start_req(id: DeploymentId, revision: u64, spec: serde_json::Value) -> DeploymentReq {
        DeploymentReq {
            action: DeploymentAction::Start,
            deployment_id: id,
            spec_revision: revision,
            kind: DeployKind::Exec,
            capacity_requests: BTreeMap::from([("A".to_string(), 1)]),
            specification: spec,
        }
    }

    async fn state_of(supervisor: &Supervisor, id: DeploymentId) -> Option<DeploymentStatus> {
        supervisor
            .status_list()
            .await
            .deployments
            .into_iter()
            .find(|s| s.deployment_id == id)
    }

    #[tokio::test]
    async fn stale_revision_is_ignored() {
        let (supervisor, _pulse) = Supervisor::new();
        let id = DeploymentId::new();

        supervisor
            .apply(start_req(id, 3, json!({"command": ["/bin/sleep", "5"]})))
            .await;
        let status = state_of(&supervisor, id).await.unwrap();
        assert_eq!(status.revision_acked, 3);

        // Same revision again: no effect.
        supervisor
            .apply(start_req(id, 3, json!({"command": ["/bin/sleep", "99"]})))
            .await;
        let status = state_of(&supervisor, id).await.unwrap();
        assert_eq!(status.revision_acked, 3);

        supervisor.stop(id, 4).await;
    }

    #[tokio::test]
    async fn invalid_spec_fails_with_synthesized_exit_code() {
        let (supervisor, _pulse) = Supervisor::new();
        let id = DeploymentId::new();

        supervisor.apply(start_req(id, 1, json!({}))).await;

        let status = state_of(&supervisor, id).await.unwrap();
        assert_eq!(status.current_state, CurrentState::Failed);
        assert_eq!(status.exit_code, Some(SPAWN_FAILURE_EXIT_CODE));

        let ring = supervisor.log_ring(id).unwrap();
        assert!(ring
            .tail(10)
            .iter()
            .any(|e| e.stream == LogStream::System && e.line.contains("rejected")));
    }

    #[tokio::test]
    async fn docker_kind_is_rejected_at_apply() {
        let (supervisor, _pulse) = Supervisor::new();
        let id = DeploymentId::new();

        let mut req = start_req(id, 1, json!({"image": "alpine:3"}));
        req.kind = DeployKind::Docker;
        supervisor.apply(req).await;

        let status = state_of(&supervisor, id).await.unwrap();
        assert_eq!(status.current_state, CurrentState::Failed);
        let ring = supervisor.log_ring(id).unwrap();
        assert!(ring
            .tail(10)
            .iter()
            .any(|e| e.line.contains("no runtime backend")));
    }

    #[tokio::test]
    async fn capacities_sum_over_live_deployments() {
        let (supervisor, _pulse) = Supervisor::new();
        let id = DeploymentId::new();

        supervisor
            .apply(start_req(id, 1, json!({"command": ["/bin/sleep", "5"]})))
            .await;
        let used = supervisor.capacities_used().await;
        assert_eq!(used.get("A"), Some(&1));

        supervisor.stop(id, 2).await;
        let used = supervisor.capacities_used().await;
        assert!(used.get("A").is_none());
    }
}
