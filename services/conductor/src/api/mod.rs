//! Control HTTP surface.
//!
//! The conductor's user-facing boundary: deployment CRUD, the node
//! snapshot, and the two streaming endpoints (per-deployment logs and
//! the full snapshot stream). Validation happens here, before any
//! state mutation.

mod conda_envs;
mod deployments;
mod error;
mod nodes;
mod streams;

use axum::routing::get;
use axum::Router;

pub use error::ApiError;

use crate::state::AppState;

/// Build the control-plane router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/deployments",
            get(deployments::list).post(deployments::create),
        )
        .route(
            "/deployments/{id}",
            get(deployments::get_one)
                .patch(deployments::patch)
                .delete(deployments::delete),
        )
        .route("/deployments/{id}/logs", get(streams::deployment_logs))
        .route("/conda-envs", get(conda_envs::list).post(conda_envs::create))
        .route(
            "/conda-envs/{name}",
            get(conda_envs::get_one)
                .patch(conda_envs::patch)
                .delete(conda_envs::delete),
        )
        .route("/nodes", get(nodes::list))
        .route("/stream", get(streams::snapshot_stream))
        .with_state(state)
}
