//! Node-side agent: maintains the persistent stream to the conductor.
//!
//! One connection at a time, re-established with backoff. The inbound
//! half of the stream applies conductor commands in receive order; a
//! separate reporting task carries heartbeats and immediate status
//! pushes so a slow stop never delays liveness. Log subscriptions get
//! one forwarding task each.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use symphony_id::DeploymentId;
use symphony_proto::{
    CondaEnvReport, ConductorToNode, FrameCodec, Heartbeat, LogBatch, LogEntry, LogStream,
    NodeHello, NodeToConductor,
};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::conda::CondaEnvManager;
use crate::config::Config;
use crate::resources::ResourceMonitor;
use crate::supervisor::Supervisor;
use crate::tls;

/// Outbound frames queued before senders feel backpressure.
const OUTBOUND_QUEUE: usize = 64;
/// Live entries batched into one log frame.
const LOG_BATCH_MAX: usize = 64;
/// A connection that survived this long resets the reconnect backoff.
const STABLE_CONNECTION: Duration = Duration::from_secs(30);

/// The node agent.
pub struct Agent {
    config: Config,
    supervisor: Supervisor,
    conda: Arc<CondaEnvManager>,
    pulse: Arc<Mutex<mpsc::Receiver<()>>>,
    monitor: Arc<StdMutex<ResourceMonitor>>,
    tls: Arc<rustls::ClientConfig>,
}

impl Agent {
    pub fn new(config: Config) -> Result<Self> {
        let tls = tls::client_config(&config.cert_dir).context("loading TLS client bundle")?;
        let (supervisor, pulse_rx) = Supervisor::with_repo_dir(config.repo_dir.clone());
        let monitor = Arc::new(StdMutex::new(ResourceMonitor::new(
            config.mount_points.clone(),
        )));
        Ok(Self {
            config,
            supervisor,
            conda: Arc::new(CondaEnvManager::new()),
            pulse: Arc::new(Mutex::new(pulse_rx)),
            monitor,
            tls,
        })
    }

    /// Run until the process is stopped, reconnecting with backoff.
    pub async fn run(&self) {
        let policy = BackoffPolicy::default();
        let mut attempt: u32 = 0;

        loop {
            let started = Instant::now();
            match self.connect_once().await {
                Ok(()) => {
                    info!("conductor stream closed, reconnecting");
                    attempt = 0;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => {
                    if started.elapsed() >= STABLE_CONNECTION {
                        attempt = 0;
                    }
                    let delay = policy.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "connection to conductor failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One full session: dial, hello, then serve until the stream ends.
    async fn connect_once(&self) -> Result<()> {
        info!(addr = %self.config.conductor_addr, "connecting to conductor");

        let tcp = TcpStream::connect(&self.config.conductor_addr)
            .await
            .context("TCP connect")?;
        let connector = TlsConnector::from(Arc::clone(&self.tls));
        let server_name = tls::server_name_for(self.config.conductor_host())?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .context("TLS handshake")?;

        let framed = Framed::new(stream, FrameCodec::new());
        let (mut sink, mut frames) = framed.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<NodeToConductor>(OUTBOUND_QUEUE);

        // Writer drains the queue in order; the hello below is queued
        // first and therefore the first frame on the wire.
        let writer: JoinHandle<()> = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let bytes = match msg.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!(error = %e, "outbound encode failed");
                        continue;
                    }
                };
                if sink.send(bytes).await.is_err() {
                    break;
                }
            }
        });

        let static_resources = {
            let monitor = Arc::clone(&self.monitor);
            tokio::task::spawn_blocking(move || {
                monitor
                    .lock()
                    .expect("resource monitor lock poisoned")
                    .static_snapshot()
            })
            .await
            .context("resource probe")?
        };

        outbound_tx
            .send(NodeToConductor::Hello(NodeHello {
                node_id: self.config.node_id.clone(),
                groups: self.config.groups.clone(),
                capacities_total: self.config.capacities_total.clone(),
                heartbeat_interval_ms: self.config.heartbeat_interval.as_millis() as u64,
                static_resources,
            }))
            .await
            .context("queueing hello")?;

        // Initial environment inventory, right behind the hello.
        {
            let conda = Arc::clone(&self.conda);
            let outbound = outbound_tx.clone();
            tokio::spawn(async move {
                let env_names = conda.list_env_names().await;
                let _ = outbound
                    .send(NodeToConductor::CondaEnvReport(CondaEnvReport { env_names }))
                    .await;
            });
        }

        let reporter = {
            let supervisor = self.supervisor.clone();
            let monitor = Arc::clone(&self.monitor);
            let pulse = Arc::clone(&self.pulse);
            let outbound = outbound_tx.clone();
            let node_id = self.config.node_id.clone();
            let interval = self.config.heartbeat_interval;
            tokio::spawn(async move {
                report_loop(supervisor, monitor, pulse, outbound, node_id, interval).await;
            })
        };

        let mut log_tasks: HashMap<DeploymentId, JoinHandle<()>> = HashMap::new();

        // Inbound: commands apply in receive order.
        let result = loop {
            let Some(frame) = frames.next().await else {
                break Ok(());
            };
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => break Err(anyhow::anyhow!("stream read: {e}")),
            };
            let msg = match ConductorToNode::decode(&frame) {
                Ok(msg) => msg,
                Err(e) => break Err(anyhow::anyhow!("malformed frame: {e}")),
            };

            match msg {
                ConductorToNode::Ack(ack) => info!(message = %ack.message, "conductor ack"),
                ConductorToNode::Pong => {}
                ConductorToNode::DeploymentReq(req) => {
                    debug!(
                        deployment_id = %req.deployment_id,
                        action = ?req.action,
                        revision = req.spec_revision,
                        "deployment command"
                    );
                    self.supervisor.apply(req).await;
                }
                ConductorToNode::DeploymentCancel(cancel) => {
                    if let Some(task) = log_tasks.remove(&cancel.deployment_id) {
                        task.abort();
                    }
                    self.supervisor.cancel(cancel.deployment_id).await;
                }
                ConductorToNode::LogSubscribe(sub) => {
                    if let Some(previous) = log_tasks.remove(&sub.deployment_id) {
                        previous.abort();
                    }
                    let supervisor = self.supervisor.clone();
                    let outbound = outbound_tx.clone();
                    let task = tokio::spawn(async move {
                        forward_logs(supervisor, outbound, sub.deployment_id, sub.tail as usize)
                            .await;
                    });
                    log_tasks.insert(sub.deployment_id, task);
                }
                ConductorToNode::LogUnsubscribe(unsub) => {
                    if let Some(task) = log_tasks.remove(&unsub.deployment_id) {
                        task.abort();
                    }
                }
                ConductorToNode::CondaEnvEnsure(ensure) => {
                    // Env creation can take minutes; run it off the
                    // command path and report the outcome when done.
                    info!(envs = ensure.envs.len(), "conda env ensure received");
                    let conda = Arc::clone(&self.conda);
                    let outbound = outbound_tx.clone();
                    tokio::spawn(async move {
                        let env_names = conda.ensure_envs(&ensure.envs).await;
                        let _ = outbound
                            .send(NodeToConductor::CondaEnvReport(CondaEnvReport {
                                env_names,
                            }))
                            .await;
                    });
                }
            }
        };

        reporter.abort();
        for (_, task) in log_tasks {
            task.abort();
        }
        drop(outbound_tx);
        let _ = writer.await;
        result
    }
}

/// Heartbeats on the declared cadence, plus immediate status pushes on
/// supervisor pulses.
async fn report_loop(
    supervisor: Supervisor,
    monitor: Arc<StdMutex<ResourceMonitor>>,
    pulse: Arc<Mutex<mpsc::Receiver<()>>>,
    outbound: mpsc::Sender<NodeToConductor>,
    node_id: String,
    interval: Duration,
) {
    let mut pulse = pulse.lock().await;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let resources = {
                    let monitor = Arc::clone(&monitor);
                    match tokio::task::spawn_blocking(move || {
                        monitor
                            .lock()
                            .expect("resource monitor lock poisoned")
                            .sample()
                    })
                    .await
                    {
                        Ok(resources) => resources,
                        Err(_) => continue,
                    }
                };
                let heartbeat = Heartbeat {
                    node_id: node_id.clone(),
                    timestamp_unix_ms: chrono::Utc::now().timestamp_millis(),
                    total_capacities_used: supervisor.capacities_used().await,
                    resources,
                };
                if outbound.send(NodeToConductor::Heartbeat(heartbeat)).await.is_err() {
                    return;
                }
                let statuses = supervisor.status_list().await;
                if outbound
                    .send(NodeToConductor::DeploymentStatusList(statuses))
                    .await
                    .is_err()
                {
                    return;
                }
            }
            pulsed = pulse.recv() => {
                if pulsed.is_none() {
                    return;
                }
                let statuses = supervisor.status_list().await;
                if outbound
                    .send(NodeToConductor::DeploymentStatusList(statuses))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

/// Forward one deployment's logs: backfill the newest `tail` ring
/// entries, then live entries in order. A lagged live feed ends the
/// stream with a slow-consumer notice.
async fn forward_logs(
    supervisor: Supervisor,
    outbound: mpsc::Sender<NodeToConductor>,
    deployment_id: DeploymentId,
    tail: usize,
) {
    let Some(ring) = supervisor.log_ring(deployment_id) else {
        debug!(deployment_id = %deployment_id, "log subscribe for unknown deployment");
        return;
    };

    // Subscribe before snapshotting the tail so nothing pushed in
    // between is missed; the backlog overlapping the snapshot is
    // discarded.
    let mut live = ring.subscribe();
    while live.try_recv().is_ok() {}
    let backfill = ring.tail(tail);

    if !backfill.is_empty() {
        let batch = NodeToConductor::LogBatch(LogBatch {
            deployment_id,
            entries: backfill,
            dropped: ring.dropped(),
        });
        if outbound.send(batch).await.is_err() {
            return;
        }
    }

    loop {
        let first = match live.recv().await {
            Ok(entry) => entry,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                let notice = LogEntry {
                    timestamp_unix_ms: chrono::Utc::now().timestamp_millis(),
                    stream: LogStream::System,
                    line: format!("log subscriber dropped: slow-consumer ({missed} lines lost)"),
                };
                let _ = outbound
                    .send(NodeToConductor::LogBatch(LogBatch {
                        deployment_id,
                        entries: vec![notice],
                        dropped: missed,
                    }))
                    .await;
                return;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let mut entries = vec![first];
        while entries.len() < LOG_BATCH_MAX {
            match live.try_recv() {
                Ok(entry) => entries.push(entry),
                Err(_) => break,
            }
        }

        let batch = NodeToConductor::LogBatch(LogBatch {
            deployment_id,
            entries,
            dropped: 0,
        });
        if outbound.send(batch).await.is_err() {
            return;
        }
    }
}
