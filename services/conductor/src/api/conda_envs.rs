//! Conda environment CRUD endpoints.
//!
//! Required environments are stored centrally; creating or updating one
//! pushes an ensure command to every connected node so workloads can
//! rely on the environment existing before they are placed there.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use symphony_proto::{CondaEnvEnsure, ConductorToNode};
use tracing::debug;

use super::error::ApiError;
use crate::session::env_spec;
use crate::state::AppState;
use crate::store::{CondaEnvPatch, CondaEnvRecord, NewCondaEnv};
use crate::stream::ChangeEvent;

const MAX_NAME_LEN: usize = 100;

/// Request body for `POST /conda-envs`.
#[derive(Debug, Deserialize)]
pub struct CreateCondaEnvRequest {
    pub name: String,
    pub python_version: String,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub custom_script: String,
}

/// Request body for `PATCH /conda-envs/{name}`.
#[derive(Debug, Deserialize)]
pub struct PatchCondaEnvRequest {
    #[serde(default)]
    pub packages: Option<Vec<String>>,
    #[serde(default)]
    pub custom_script: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CondaEnvResponse {
    pub name: String,
    pub python_version: String,
    pub packages: Vec<String>,
    pub custom_script: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl From<CondaEnvRecord> for CondaEnvResponse {
    fn from(record: CondaEnvRecord) -> Self {
        Self {
            name: record.name,
            python_version: record.python_version,
            packages: record.packages,
            custom_script: record.custom_script,
            created_at_ms: record.created_at_ms,
            updated_at_ms: record.updated_at_ms,
        }
    }
}

fn validate_create(body: &CreateCondaEnvRequest) -> Result<(), ApiError> {
    if body.name.is_empty() || body.name.len() > MAX_NAME_LEN {
        return Err(ApiError::bad_request(
            "invalid-name",
            format!("name must be 1–{MAX_NAME_LEN} characters"),
        ));
    }
    if body.name.contains(char::is_whitespace) || body.name.contains('/') {
        return Err(ApiError::bad_request(
            "invalid-name",
            "name must not contain whitespace or '/'",
        ));
    }
    if body.python_version.is_empty() {
        return Err(ApiError::bad_request(
            "invalid-python-version",
            "python_version is required",
        ));
    }
    Ok(())
}

/// Push one environment to every connected node.
fn ensure_on_all_nodes(state: &AppState, record: &CondaEnvRecord) {
    let ensure = ConductorToNode::CondaEnvEnsure(CondaEnvEnsure {
        envs: vec![env_spec(record)],
    });
    for entry in state.registry().snapshot() {
        if !entry.connected {
            continue;
        }
        if let Err(e) = state.registry().send(&entry.node_id, ensure.clone()) {
            debug!(node_id = %entry.node_id, error = %e, "conda ensure not delivered");
        }
    }
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateCondaEnvRequest>,
) -> Result<(StatusCode, Json<CondaEnvResponse>), ApiError> {
    validate_create(&body)?;

    let record = state
        .envs()
        .create_env(NewCondaEnv {
            name: body.name,
            python_version: body.python_version,
            packages: body.packages,
            custom_script: body.custom_script,
        })
        .await?;

    ensure_on_all_nodes(&state, &record);
    state.bus().notify(ChangeEvent::Nodes);

    Ok((StatusCode::CREATED, Json(record.into())))
}

pub async fn list(
    State(state): State<AppState>,
) -> Result<Json<Vec<CondaEnvResponse>>, ApiError> {
    let records = state.envs().list_envs().await?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<CondaEnvResponse>, ApiError> {
    let record = state.envs().get_env(&name).await?.ok_or_else(|| {
        ApiError::not_found("not-found", format!("conda env '{name}' not found"))
    })?;
    Ok(Json(record.into()))
}

pub async fn patch(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<PatchCondaEnvRequest>,
) -> Result<Json<CondaEnvResponse>, ApiError> {
    let record = state
        .envs()
        .update_env(
            &name,
            CondaEnvPatch {
                packages: body.packages,
                custom_script: body.custom_script,
            },
        )
        .await?;

    ensure_on_all_nodes(&state, &record);
    state.bus().notify(ChangeEvent::Nodes);

    Ok(Json(record.into()))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.envs().delete_env(&name).await?;
    state.bus().notify(ChangeEvent::Nodes);
    Ok(StatusCode::NO_CONTENT)
}
