//! Node session handling: one bidirectional framed stream per node.
//!
//! Each accepted TLS connection gets a reader (this task) and a writer
//! task draining a bounded outbound queue. The session begins in
//! `AwaitingHello`; the first frame must be a valid `NodeHello` or the
//! stream is closed with a logged reason. Frames are processed in
//! arrival order and forwarded to the reconciler over its bounded
//! queue — the reader never blocks on downstream consumers; if the
//! queue is full the session is closed as a slow consumer.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use symphony_proto::{
    Ack, CondaEnvEnsure, CondaEnvSpec, ConductorToNode, FrameCodec, NodeHello, NodeToConductor,
};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::ledger::CapacityLedger;
use crate::reconciler::{ReconcileEvent, ReconcilerHandle};
use crate::registry::{NodeRegistry, RegistryError, SessionHandle};
use crate::store::{CondaEnvRecord, CondaEnvRepository};
use crate::stream::{ChangeEvent, EventBus};

/// The hello frame must arrive within this window.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
/// Outbound frames queued per session before the writer applies
/// backpressure to senders.
const OUTBOUND_QUEUE: usize = 64;

/// Why a session ended. Logged, never retried by the conductor.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no hello frame within {0:?}")]
    HelloTimeout(Duration),

    #[error("invalid hello: {0}")]
    InvalidHello(String),

    #[error("node '{0}' already has a live session")]
    Duplicate(String),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("event queue full")]
    SlowConsumer,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Shared components a session needs.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<NodeRegistry>,
    pub ledger: Arc<CapacityLedger>,
    pub envs: Arc<dyn CondaEnvRepository>,
    pub bus: Arc<EventBus>,
    pub reconciler: ReconcilerHandle,
}

/// Wire form of one required environment.
pub fn env_spec(record: &CondaEnvRecord) -> CondaEnvSpec {
    CondaEnvSpec {
        name: record.name.clone(),
        python_version: record.python_version.clone(),
        packages: record.packages.clone(),
        custom_script: record.custom_script.clone(),
    }
}

/// Accept loop for the node wire listener.
pub async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ctx: SessionContext,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("node wire listener started");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let tls = match acceptor.accept(stream).await {
                        Ok(tls) => tls,
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "TLS handshake failed");
                            return;
                        }
                    };
                    if let Err(e) = run_session(tls, ctx).await {
                        warn!(peer = %peer, error = %e, "session ended with error");
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("node wire listener shutting down");
                    break;
                }
            }
        }
    }
}

fn validate_hello(hello: &NodeHello) -> Result<(), SessionError> {
    if hello.node_id.trim().is_empty() {
        return Err(SessionError::InvalidHello("empty node_id".to_string()));
    }
    if hello.groups.is_empty() {
        return Err(SessionError::InvalidHello("no groups declared".to_string()));
    }
    if hello.capacities_total.values().any(|v| *v == 0) {
        return Err(SessionError::InvalidHello(
            "capacities must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Drive one session from handshake to teardown.
pub async fn run_session(
    tls: TlsStream<TcpStream>,
    ctx: SessionContext,
) -> Result<(), SessionError> {
    let framed = Framed::new(tls, FrameCodec::new());
    let (mut sink, mut frames) = framed.split();

    // AwaitingHello: the first frame decides whether a node exists.
    let first = tokio::time::timeout(HELLO_TIMEOUT, frames.next())
        .await
        .map_err(|_| SessionError::HelloTimeout(HELLO_TIMEOUT))?
        .ok_or_else(|| SessionError::Transport("closed before hello".to_string()))?
        .map_err(|e| SessionError::Transport(e.to_string()))?;

    let hello = match NodeToConductor::decode(&first) {
        Ok(NodeToConductor::Hello(hello)) => hello,
        Ok(other) => {
            return Err(SessionError::InvalidHello(format!(
                "expected hello, got {other:?}"
            )))
        }
        Err(e) => return Err(SessionError::Malformed(e.to_string())),
    };
    validate_hello(&hello)?;

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<ConductorToNode>(OUTBOUND_QUEUE);
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    ctx.registry
        .register(
            &hello,
            SessionHandle {
                outbound: outbound_tx.clone(),
                shutdown: shutdown_tx.clone(),
            },
        )
        .map_err(|e| match e {
            RegistryError::Conflict(id) => SessionError::Duplicate(id),
            other => SessionError::Transport(other.to_string()),
        })?;
    ctx.ledger
        .register_node(&hello.node_id, &hello.capacities_total);
    let node_id = hello.node_id.clone();

    // Writer task: owns the sink, drains the outbound queue. Session
    // shutdown cancels it and drops anything still queued.
    let mut writer_shutdown = shutdown_rx.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    let Some(msg) = msg else { break };
                    let bytes = match msg.encode() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!(error = %e, "outbound encode failed");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(bytes).await {
                        debug!(error = %e, "session write failed");
                        break;
                    }
                }
                _ = writer_shutdown.changed() => {
                    if *writer_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    let _ = outbound_tx
        .send(ConductorToNode::Ack(Ack {
            message: format!("hello {node_id}"),
        }))
        .await;
    let _ = ctx
        .reconciler
        .notify(ReconcileEvent::NodeConnected(node_id.clone()));
    ctx.bus.notify(ChangeEvent::Nodes);

    // Steady state: process frames in arrival order.
    let result = read_loop(&node_id, &mut frames, &ctx, &mut shutdown_rx).await;

    // Teardown: cancel the writer, mark the node disconnected, let the
    // reconciler's grace window decide about its assignments.
    let _ = shutdown_tx.send(true);
    let _ = writer.await;
    let reason = match &result {
        Ok(()) => "stream-closed".to_string(),
        Err(e) => e.to_string(),
    };
    ctx.registry.deregister(&node_id, &reason);
    let _ = ctx.reconciler.notify(ReconcileEvent::NodeLost {
        node_id: node_id.clone(),
        reason,
    });
    ctx.bus.notify(ChangeEvent::Nodes);
    info!(node_id = %node_id, "session closed");
    result
}

async fn read_loop(
    node_id: &str,
    frames: &mut (impl futures::Stream<Item = Result<bytes::Bytes, symphony_proto::FrameError>> + Unpin),
    ctx: &SessionContext,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<(), SessionError> {
    loop {
        let frame = tokio::select! {
            frame = frames.next() => frame,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
                continue;
            }
        };

        let Some(frame) = frame else {
            return Ok(());
        };
        let frame = frame.map_err(|e| SessionError::Transport(e.to_string()))?;
        let msg =
            NodeToConductor::decode(&frame).map_err(|e| SessionError::Malformed(e.to_string()))?;

        match msg {
            NodeToConductor::Hello(_) => {
                return Err(SessionError::InvalidHello(
                    "duplicate hello on live session".to_string(),
                ));
            }
            NodeToConductor::Heartbeat(hb) => {
                if hb.node_id != node_id {
                    return Err(SessionError::Malformed(
                        "heartbeat for a different node".to_string(),
                    ));
                }
                ctx.registry.heartbeat(&hb);
                // Best-effort liveness echo; a full queue is not fatal.
                let _ = ctx.registry.send(node_id, ConductorToNode::Pong);
                ctx.bus.notify(ChangeEvent::Nodes);
            }
            NodeToConductor::DeploymentStatusList(statuses) => {
                ctx.registry.touch(node_id);
                let delivered = ctx.reconciler.notify(ReconcileEvent::StatusReport {
                    node_id: node_id.to_string(),
                    statuses,
                });
                if !delivered {
                    return Err(SessionError::SlowConsumer);
                }
            }
            NodeToConductor::LogBatch(batch) => {
                ctx.registry.touch(node_id);
                ctx.bus.publish_logs(&batch);
            }
            NodeToConductor::CondaEnvReport(report) => {
                ctx.registry
                    .update_conda_envs(node_id, report.env_names.clone());
                ctx.bus.notify(ChangeEvent::Nodes);

                // Push whatever required environments the node is
                // missing.
                let required = match ctx.envs.list_envs().await {
                    Ok(required) => required,
                    Err(e) => {
                        warn!(error = %e, "conda env store read failed");
                        continue;
                    }
                };
                let missing: Vec<_> = required
                    .iter()
                    .filter(|r| !report.env_names.contains(&r.name))
                    .map(env_spec)
                    .collect();
                if !missing.is_empty() {
                    debug!(
                        node_id = %node_id,
                        missing = missing.len(),
                        "pushing missing conda environments"
                    );
                    let _ = ctx.registry.send(
                        node_id,
                        ConductorToNode::CondaEnvEnsure(CondaEnvEnsure { envs: missing }),
                    );
                }
            }
        }
    }
}
