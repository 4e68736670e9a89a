//! Streaming endpoints: per-deployment logs and the snapshot stream.
//!
//! Both are served as SSE. The first log subscriber for a deployment
//! opens the node-side stream; the last one dropping closes it again.
//! Snapshot subscribers get the full deployments+nodes view once on
//! connect and again on every change tick.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::{Deserialize, Serialize};
use symphony_id::DeploymentId;
use symphony_proto::{ConductorToNode, LogSubscribe, LogUnsubscribe};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::deployments::{parse_id, render, DeploymentResponse};
use super::error::ApiError;
use super::nodes::{node_views, NodeView};
use crate::state::AppState;
use crate::stream::LogFrame;

/// Default backfill when no `tail` query parameter is given.
const DEFAULT_TAIL: u32 = 200;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub tail: Option<u32>,
}

/// Drops the bus subscription with the HTTP stream; the last
/// subscriber also closes the node-side log stream.
struct LogStreamGuard {
    state: AppState,
    deployment_id: DeploymentId,
    subscriber_id: u64,
}

impl Drop for LogStreamGuard {
    fn drop(&mut self) {
        let last = self
            .state
            .bus()
            .unsubscribe_logs(self.deployment_id, self.subscriber_id);
        if last {
            if let Some(node_id) = self.state.assignments().node_of(self.deployment_id) {
                let msg = ConductorToNode::LogUnsubscribe(LogUnsubscribe {
                    deployment_id: self.deployment_id,
                });
                if let Err(e) = self.state.registry().send(&node_id, msg) {
                    debug!(
                        deployment_id = %self.deployment_id,
                        error = %e,
                        "log unsubscribe not delivered"
                    );
                }
            }
        }
    }
}

pub async fn deployment_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let id = parse_id(&id)?;
    state
        .repo()
        .get(id)
        .await?
        .filter(|r| !r.deleted)
        .ok_or_else(|| ApiError::not_found("not-found", format!("deployment '{id}' not found")))?;

    let node_id = state.assignments().node_of(id).ok_or_else(|| {
        ApiError::conflict("not-assigned", "deployment has no assigned node to stream from")
    })?;

    let (subscriber_id, rx, first) = state.bus().subscribe_logs(id);
    let guard = LogStreamGuard {
        state: state.clone(),
        deployment_id: id,
        subscriber_id,
    };

    if first {
        let msg = ConductorToNode::LogSubscribe(LogSubscribe {
            deployment_id: id,
            tail: query.tail.unwrap_or(DEFAULT_TAIL),
            streams: None,
        });
        if let Err(e) = state.registry().send(&node_id, msg) {
            warn!(deployment_id = %id, error = %e, "log subscribe not delivered");
            return Err(ApiError::conflict(
                "node-unreachable",
                "owning node session is unavailable",
            ));
        }
    }

    let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let frame: LogFrame = rx.recv().await?;
        Some((Event::default().json_data(&frame), (rx, guard)))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Full deployments+nodes view pushed on every change.
#[derive(Debug, Serialize)]
pub struct SnapshotView {
    pub deployments: Vec<DeploymentResponse>,
    pub nodes: BTreeMap<String, NodeView>,
}

async fn build_snapshot(state: &AppState) -> Result<SnapshotView, ApiError> {
    let records = state.repo().list(500, 0).await?;
    let deployments = records
        .into_iter()
        .map(|record| render(state, record))
        .collect();
    let nodes = node_views(state).await?;
    Ok(SnapshotView { deployments, nodes })
}

struct SnapshotStreamState {
    state: AppState,
    rx: broadcast::Receiver<crate::stream::ChangeEvent>,
    primed: bool,
}

pub async fn snapshot_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let rx = state.bus().subscribe_changes();
    let initial = SnapshotStreamState {
        state,
        rx,
        primed: false,
    };

    let stream = futures::stream::unfold(initial, |mut s| async move {
        if !s.primed {
            s.primed = true;
        } else {
            loop {
                match s.rx.recv().await {
                    Ok(_) => break,
                    // Missed ticks collapse into one extra render.
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        }

        let event = match build_snapshot(&s.state).await {
            Ok(snapshot) => Event::default().json_data(&snapshot),
            Err(e) => Event::default().json_data(&serde_json::json!({
                "error": e.problem.detail,
            })),
        };
        Some((event, s))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
