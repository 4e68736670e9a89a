//! Deployment CRUD endpoints.

use std::collections::BTreeMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use symphony_id::DeploymentId;
use symphony_proto::{CurrentState, DeployKind, DesiredState};

use super::error::ApiError;
use crate::reconciler::ReconcileEvent;
use crate::state::AppState;
use crate::store::{DeploymentPatch, DeploymentRecord, NewDeployment};
use crate::stream::ChangeEvent;

const MAX_NAME_LEN: usize = 200;

/// Request body for `POST /deployments`.
#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub name: String,
    pub kind: DeployKind,
    pub node_group: String,
    #[serde(default)]
    pub capacity_requests: BTreeMap<String, u64>,
    #[serde(default)]
    pub specification: serde_json::Value,
    pub desired_state: DesiredState,
}

/// Request body for `PATCH /deployments/{id}`.
#[derive(Debug, Deserialize)]
pub struct PatchDeploymentRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub desired_state: Option<DesiredState>,
    #[serde(default)]
    pub specification: Option<serde_json::Value>,
}

/// A deployment record joined with its runtime state.
#[derive(Debug, Serialize)]
pub struct DeploymentResponse {
    pub id: DeploymentId,
    pub name: String,
    pub kind: DeployKind,
    pub node_group: String,
    pub capacity_requests: BTreeMap<String, u64>,
    pub specification: serde_json::Value,
    pub desired_state: DesiredState,
    pub current_state: CurrentState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignment_reason: Option<String>,
    pub spec_revision: u64,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

/// Join a stored record with assignment-table state.
pub(crate) fn render(state: &AppState, record: DeploymentRecord) -> DeploymentResponse {
    let assignment = state.assignments().get(record.id);
    let (current_state, assigned_node_id) = match &assignment {
        Some(a) => (a.reported_state, Some(a.node_id.clone())),
        None => (CurrentState::Pending, None),
    };
    let assignment_reason = if assignment.is_none() {
        state.assignments().unassigned_reason(record.id)
    } else {
        None
    };

    DeploymentResponse {
        id: record.id,
        name: record.name,
        kind: record.kind,
        node_group: record.node_group,
        capacity_requests: record.capacity_requests,
        specification: record.specification,
        desired_state: record.desired_state,
        current_state,
        assigned_node_id,
        assignment_reason,
        spec_revision: record.spec_revision,
        created_at_ms: record.created_at_ms,
        updated_at_ms: record.updated_at_ms,
    }
}

fn validate_name(name: &str) -> Result<(), ApiError> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(ApiError::bad_request(
            "invalid-name",
            format!("name must be 1–{MAX_NAME_LEN} characters"),
        ));
    }
    Ok(())
}

/// Per-kind specification check at the boundary, before any state
/// mutation. The node supervisor revalidates the full schema.
fn validate_specification(kind: DeployKind, spec: &serde_json::Value) -> Result<(), ApiError> {
    match kind {
        DeployKind::Exec => {
            let command_ok = spec
                .get("command")
                .and_then(|c| c.as_array())
                .is_some_and(|parts| {
                    !parts.is_empty()
                        && parts
                            .iter()
                            .all(|p| p.as_str().is_some_and(|s| !s.is_empty()))
                });
            if !command_ok {
                return Err(ApiError::bad_request(
                    "invalid-spec",
                    "exec specification requires a non-empty 'command' string array",
                ));
            }
        }
        DeployKind::Docker => {
            let image_ok = spec
                .get("image")
                .and_then(|i| i.as_str())
                .is_some_and(|s| !s.is_empty());
            if !image_ok {
                return Err(ApiError::bad_request(
                    "invalid-spec",
                    "docker specification requires a non-empty 'image' string",
                ));
            }
        }
    }
    Ok(())
}

fn validate_requests(requests: &BTreeMap<String, u64>) -> Result<(), ApiError> {
    if requests.values().any(|v| *v == 0) {
        return Err(ApiError::bad_request(
            "invalid-capacity-request",
            "capacity requests must be positive",
        ));
    }
    Ok(())
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateDeploymentRequest>,
) -> Result<(StatusCode, Json<DeploymentResponse>), ApiError> {
    validate_name(&body.name)?;
    if body.node_group.is_empty() {
        return Err(ApiError::bad_request(
            "invalid-node-group",
            "node_group is required",
        ));
    }
    validate_requests(&body.capacity_requests)?;
    validate_specification(body.kind, &body.specification)?;

    let record = state
        .repo()
        .create(NewDeployment {
            name: body.name,
            kind: body.kind,
            node_group: body.node_group,
            capacity_requests: body.capacity_requests,
            specification: body.specification,
            desired_state: body.desired_state,
        })
        .await?;

    state
        .reconciler()
        .notify(ReconcileEvent::DeploymentChanged(record.id));
    state.bus().notify(ChangeEvent::Deployments);

    Ok((StatusCode::CREATED, Json(render(&state, record))))
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DeploymentResponse>>, ApiError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let offset = query.offset.unwrap_or(0);

    let records = state.repo().list(limit, offset).await?;
    Ok(Json(
        records
            .into_iter()
            .map(|record| render(&state, record))
            .collect(),
    ))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    let id = parse_id(&id)?;
    let record = state
        .repo()
        .get(id)
        .await?
        .filter(|r| !r.deleted)
        .ok_or_else(|| ApiError::not_found("not-found", format!("deployment '{id}' not found")))?;
    Ok(Json(render(&state, record)))
}

pub async fn patch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PatchDeploymentRequest>,
) -> Result<Json<DeploymentResponse>, ApiError> {
    let id = parse_id(&id)?;
    if let Some(name) = &body.name {
        validate_name(name)?;
    }

    let existing = state
        .repo()
        .get(id)
        .await?
        .filter(|r| !r.deleted)
        .ok_or_else(|| ApiError::not_found("not-found", format!("deployment '{id}' not found")))?;
    if let Some(spec) = &body.specification {
        validate_specification(existing.kind, spec)?;
    }

    let record = state
        .repo()
        .update(
            id,
            DeploymentPatch {
                name: body.name,
                desired_state: body.desired_state,
                specification: body.specification,
            },
        )
        .await?;

    state
        .reconciler()
        .notify(ReconcileEvent::DeploymentChanged(id));
    state.bus().notify(ChangeEvent::Deployments);

    Ok(Json(render(&state, record)))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = parse_id(&id)?;
    state.repo().delete(id).await?;

    state
        .reconciler()
        .notify(ReconcileEvent::DeploymentChanged(id));
    state.bus().notify(ChangeEvent::Deployments);

    Ok(StatusCode::NO_CONTENT)
}

pub(crate) fn parse_id(raw: &str) -> Result<DeploymentId, ApiError> {
    DeploymentId::parse(raw)
        .map_err(|e| ApiError::bad_request("invalid-id", format!("invalid deployment id: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exec_spec_requires_command() {
        assert!(validate_specification(DeployKind::Exec, &json!({})).is_err());
        assert!(validate_specification(DeployKind::Exec, &json!({"command": []})).is_err());
        assert!(
            validate_specification(DeployKind::Exec, &json!({"command": ["", "x"]})).is_err()
        );
        assert!(
            validate_specification(DeployKind::Exec, &json!({"command": ["/bin/true"]})).is_ok()
        );
    }

    #[test]
    fn docker_spec_requires_image() {
        assert!(validate_specification(DeployKind::Docker, &json!({})).is_err());
        assert!(
            validate_specification(DeployKind::Docker, &json!({"image": "alpine:3"})).is_ok()
        );
    }

    #[test]
    fn zero_capacity_requests_are_rejected() {
        let requests = BTreeMap::from([("A".to_string(), 0u64)]);
        assert!(validate_requests(&requests).is_err());
    }
}
