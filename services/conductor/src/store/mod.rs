//! Deployment store: the source of truth for desired state and specs.
//!
//! The durable medium is pluggable behind [`DeploymentRepository`]: the
//! conductor binary opens the SQLite repository when a database path is
//! configured, the in-memory repository otherwise (and in tests). Both
//! enforce the same contract: unique names over non-deleted records,
//! monotonic revision writes, and tombstones that linger until the
//! reconciler has confirmed node-side teardown.

mod memory;
mod sqlite;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use symphony_id::DeploymentId;
use symphony_proto::{DeployKind, DesiredState};
use thiserror::Error;

pub use memory::MemoryRepository;
pub use sqlite::SqliteRepository;

/// Errors from repository operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another non-purged record (live or tombstoned) holds this name.
    #[error("deployment name '{0}' already exists")]
    NameConflict(String),

    #[error("deployment '{0}' not found")]
    NotFound(DeploymentId),

    #[error("conda environment '{0}' not found")]
    EnvNotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A stored deployment record.
///
/// Runtime state (assignment, reported current state) is deliberately
/// not stored here; the reconciler joins it at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: DeploymentId,
    pub name: String,
    pub kind: DeployKind,
    /// Placement affinity; a deployment targets exactly one group.
    pub node_group: String,
    /// Per-label virtual capacity requests (all positive).
    pub capacity_requests: BTreeMap<String, u64>,
    /// Opaque to the conductor; interpreted by the node supervisor.
    pub specification: serde_json::Value,
    pub desired_state: DesiredState,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    /// Bumped on every accepted content change; gates out-of-order
    /// node-side application.
    pub spec_revision: u64,
    /// Tombstone: awaiting node-side teardown confirmation.
    pub deleted: bool,
}

/// Input for creating a record.
#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub name: String,
    pub kind: DeployKind,
    pub node_group: String,
    pub capacity_requests: BTreeMap<String, u64>,
    pub specification: serde_json::Value,
    pub desired_state: DesiredState,
}

/// Partial update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default)]
pub struct DeploymentPatch {
    pub name: Option<String>,
    pub desired_state: Option<DesiredState>,
    pub specification: Option<serde_json::Value>,
}

impl DeploymentPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.desired_state.is_none() && self.specification.is_none()
    }
}

/// A conda environment every node is expected to provide.
///
/// `name` is the primary key; nodes report which environments they
/// hold and the conductor pushes the missing ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CondaEnvRecord {
    pub name: String,
    pub python_version: String,
    pub packages: Vec<String>,
    /// Extra shell script run after `conda create`; a leading
    /// force-recreate marker line rebuilds an existing environment.
    pub custom_script: String,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Input for creating a conda environment record.
#[derive(Debug, Clone)]
pub struct NewCondaEnv {
    pub name: String,
    pub python_version: String,
    pub packages: Vec<String>,
    pub custom_script: String,
}

/// Partial update; the name and python version are immutable.
#[derive(Debug, Clone, Default)]
pub struct CondaEnvPatch {
    pub packages: Option<Vec<String>>,
    pub custom_script: Option<String>,
}

/// Storage contract for required conda environments.
#[async_trait]
pub trait CondaEnvRepository: Send + Sync {
    /// Insert a new record; the name must be unused.
    async fn create_env(&self, new: NewCondaEnv) -> Result<CondaEnvRecord, StoreError>;

    async fn get_env(&self, name: &str) -> Result<Option<CondaEnvRecord>, StoreError>;

    /// Records in stable `(created_at_ms, name)` order.
    async fn list_envs(&self) -> Result<Vec<CondaEnvRecord>, StoreError>;

    async fn update_env(
        &self,
        name: &str,
        patch: CondaEnvPatch,
    ) -> Result<CondaEnvRecord, StoreError>;

    async fn delete_env(&self, name: &str) -> Result<(), StoreError>;
}

/// Storage contract for deployment records.
#[async_trait]
pub trait DeploymentRepository: Send + Sync {
    /// Insert a new record. Fails with `NameConflict` while any
    /// non-purged record (including tombstones) holds the name.
    async fn create(&self, new: NewDeployment) -> Result<DeploymentRecord, StoreError>;

    async fn get(&self, id: DeploymentId) -> Result<Option<DeploymentRecord>, StoreError>;

    /// Non-deleted records in stable `(created_at_ms, id)` order.
    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<DeploymentRecord>, StoreError>;

    /// Every record including tombstones, in stable order. The
    /// reconciler drives teardown from this view.
    async fn list_all(&self) -> Result<Vec<DeploymentRecord>, StoreError>;

    /// Apply a patch. `spec_revision` bumps only when the patch actually
    /// changes content; a no-op patch returns the record unchanged.
    async fn update(
        &self,
        id: DeploymentId,
        patch: DeploymentPatch,
    ) -> Result<DeploymentRecord, StoreError>;

    /// Tombstone a record. Name collisions persist until `purge`.
    async fn delete(&self, id: DeploymentId) -> Result<(), StoreError>;

    /// Remove a tombstoned record for good.
    async fn purge(&self, id: DeploymentId) -> Result<(), StoreError>;
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Applies a patch to a record in place, returning whether any content
/// changed. Shared by both repository implementations so revision
/// semantics cannot drift between them.
pub(crate) fn apply_patch(record: &mut DeploymentRecord, patch: &DeploymentPatch) -> bool {
    let mut changed = false;
    if let Some(name) = &patch.name {
        if *name != record.name {
            record.name = name.clone();
            changed = true;
        }
    }
    if let Some(desired) = patch.desired_state {
        if desired != record.desired_state {
            record.desired_state = desired;
            changed = true;
        }
    }
    if let Some(spec) = &patch.specification {
        if *spec != record.specification {
            record.specification = spec.clone();
            changed = true;
        }
    }
    if changed {
        record.spec_revision += 1;
        record.updated_at_ms = now_ms();
    }
    changed
}
