//! Node snapshot endpoint.

use std::collections::BTreeMap;
use std::time::Instant;

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use symphony_id::DeploymentId;
use symphony_proto::{DynamicResources, StaticResources};

use super::error::ApiError;
use crate::registry::NodeHealth;
use crate::state::AppState;

/// One assigned deployment, as shown in the node view.
#[derive(Debug, Serialize)]
pub struct AssignedDeployment {
    pub id: DeploymentId,
    pub name: String,
}

/// Full view of one node: declared identity, capacity vectors and the
/// latest resource snapshot.
#[derive(Debug, Serialize)]
pub struct NodeView {
    pub node_id: String,
    pub groups: Vec<String>,
    pub health: String,
    pub heartbeat_interval_ms: u64,
    pub last_heartbeat_ms: i64,
    pub capacities_total: BTreeMap<String, u64>,
    pub capacities_reserved: BTreeMap<String, u64>,
    pub capacities_available: BTreeMap<String, u64>,
    /// Usage as the node itself reports it; advisory, the ledger is
    /// authoritative.
    pub capacities_reported_used: BTreeMap<String, u64>,
    pub static_resources: StaticResources,
    pub dynamic_resources: DynamicResources,
    pub dynamic_timestamp_unix_ms: i64,
    /// Conda environments the node reports holding.
    pub conda_envs: Vec<String>,
    pub assigned_deployments: Vec<AssignedDeployment>,
}

#[derive(Debug, Serialize)]
pub struct NodesResponse {
    pub nodes: BTreeMap<String, NodeView>,
}

fn health_str(health: NodeHealth) -> &'static str {
    match health {
        NodeHealth::Connected => "connected",
        NodeHealth::Stale => "stale",
        NodeHealth::Disconnected => "disconnected",
    }
}

pub async fn list(State(state): State<AppState>) -> Result<Json<NodesResponse>, ApiError> {
    let nodes = node_views(&state).await?;
    Ok(Json(NodesResponse { nodes }))
}

/// Render the full node view; shared with the snapshot stream.
pub(crate) async fn node_views(
    state: &AppState,
) -> Result<BTreeMap<String, NodeView>, ApiError> {
    let now = Instant::now();
    let mut nodes = BTreeMap::new();

    for entry in state.registry().snapshot() {
        let mut assigned = Vec::new();
        for deployment_id in state.assignments().deployments_on(&entry.node_id) {
            let name = state
                .repo()
                .get(deployment_id)
                .await?
                .map(|r| r.name)
                .unwrap_or_default();
            assigned.push(AssignedDeployment {
                id: deployment_id,
                name,
            });
        }

        let reserved = state.ledger().reserved(&entry.node_id).unwrap_or_default();
        let available = state.ledger().available(&entry.node_id).unwrap_or_default();

        nodes.insert(
            entry.node_id.clone(),
            NodeView {
                health: health_str(entry.health(now)).to_string(),
                heartbeat_interval_ms: entry.heartbeat_interval.as_millis() as u64,
                node_id: entry.node_id,
                groups: entry.groups,
                last_heartbeat_ms: entry.last_heartbeat_ms,
                capacities_total: entry.capacities_total,
                capacities_reserved: reserved,
                capacities_available: available,
                capacities_reported_used: entry.reported_capacities_used,
                static_resources: entry.static_resources,
                dynamic_resources: entry.dynamic,
                dynamic_timestamp_unix_ms: entry.dynamic_timestamp_unix_ms,
                conda_envs: entry.conda_envs,
                assigned_deployments: assigned,
            },
        );
    }

    Ok(nodes)
}
