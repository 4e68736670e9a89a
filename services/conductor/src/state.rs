//! Application state shared across request handlers.

use std::sync::Arc;

use crate::assignments::AssignmentTable;
use crate::ledger::CapacityLedger;
use crate::reconciler::ReconcilerHandle;
use crate::registry::NodeRegistry;
use crate::store::{CondaEnvRepository, DeploymentRepository};
use crate::stream::EventBus;

/// Shared application state, passed to all handlers via Axum's state
/// extractor and to the session/reconciler tasks.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    registry: Arc<NodeRegistry>,
    ledger: Arc<CapacityLedger>,
    repo: Arc<dyn DeploymentRepository>,
    envs: Arc<dyn CondaEnvRepository>,
    assignments: Arc<AssignmentTable>,
    bus: Arc<EventBus>,
    reconciler: ReconcilerHandle,
}

impl AppState {
    pub fn new(
        registry: Arc<NodeRegistry>,
        ledger: Arc<CapacityLedger>,
        repo: Arc<dyn DeploymentRepository>,
        envs: Arc<dyn CondaEnvRepository>,
        assignments: Arc<AssignmentTable>,
        bus: Arc<EventBus>,
        reconciler: ReconcilerHandle,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                registry,
                ledger,
                repo,
                envs,
                assignments,
                bus,
                reconciler,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.inner.registry
    }

    pub fn ledger(&self) -> &Arc<CapacityLedger> {
        &self.inner.ledger
    }

    pub fn repo(&self) -> &Arc<dyn DeploymentRepository> {
        &self.inner.repo
    }

    pub fn envs(&self) -> &Arc<dyn CondaEnvRepository> {
        &self.inner.envs
    }

    pub fn assignments(&self) -> &Arc<AssignmentTable> {
        &self.inner.assignments
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    pub fn reconciler(&self) -> &ReconcilerHandle {
        &self.inner.reconciler
    }
}
