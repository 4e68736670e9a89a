//! In-memory repository, used in tests and when no database path is
//! configured.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use symphony_id::DeploymentId;

use super::{
    apply_patch, now_ms, CondaEnvPatch, CondaEnvRecord, CondaEnvRepository, DeploymentPatch,
    DeploymentRecord, DeploymentRepository, NewCondaEnv, NewDeployment, StoreError,
};

pub struct MemoryRepository {
    records: Mutex<HashMap<DeploymentId, DeploymentRecord>>,
    envs: Mutex<HashMap<String, CondaEnvRecord>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            envs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted(mut records: Vec<DeploymentRecord>) -> Vec<DeploymentRecord> {
    records.sort_by(|a, b| {
        a.created_at_ms
            .cmp(&b.created_at_ms)
            .then_with(|| a.id.cmp(&b.id))
    });
    records
}

#[async_trait]
impl DeploymentRepository for MemoryRepository {
    async fn create(&self, new: NewDeployment) -> Result<DeploymentRecord, StoreError> {
        let mut records = self.records.lock().expect("store lock poisoned");
        if records.values().any(|r| r.name == new.name) {
            return Err(StoreError::NameConflict(new.name));
        }

        let now = now_ms();
        let record = DeploymentRecord {
            id: DeploymentId::new(),
            name: new.name,
            kind: new.kind,
            node_group: new.node_group,
            capacity_requests: new.capacity_requests,
            specification: new.specification,
            desired_state: new.desired_state,
            created_at_ms: now,
            updated_at_ms: now,
            spec_revision: 1,
            deleted: false,
        };
        records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: DeploymentId) -> Result<Option<DeploymentRecord>, StoreError> {
        let records = self.records.lock().expect("store lock poisoned");
        Ok(records.get(&id).cloned())
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<DeploymentRecord>, StoreError> {
        let records = self.records.lock().expect("store lock poisoned");
        let live: Vec<_> = records.values().filter(|r| !r.deleted).cloned().collect();
        Ok(sorted(live).into_iter().skip(offset).take(limit).collect())
    }

    async fn list_all(&self) -> Result<Vec<DeploymentRecord>, StoreError> {
        let records = self.records.lock().expect("store lock poisoned");
        Ok(sorted(records.values().cloned().collect()))
    }

    async fn update(
        &self,
        id: DeploymentId,
        patch: DeploymentPatch,
    ) -> Result<DeploymentRecord, StoreError> {
        let mut records = self.records.lock().expect("store lock poisoned");

        if let Some(name) = &patch.name {
            if records.values().any(|r| r.id != id && r.name == *name) {
                return Err(StoreError::NameConflict(name.clone()));
            }
        }

        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        apply_patch(record, &patch);
        Ok(record.clone())
    }

    async fn delete(&self, id: DeploymentId) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("store lock poisoned");
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.deleted = true;
        record.updated_at_ms = now_ms();
        Ok(())
    }

    async fn purge(&self, id: DeploymentId) -> Result<(), StoreError> {
        let mut records = self.records.lock().expect("store lock poisoned");
        records.remove(&id).ok_or(StoreError::NotFound(id))?;
        Ok(())
    }
}

#[async_trait]
impl CondaEnvRepository for MemoryRepository {
    async fn create_env(&self, new: NewCondaEnv) -> Result<CondaEnvRecord, StoreError> {
        let mut envs = self.envs.lock().expect("store lock poisoned");
        if envs.contains_key(&new.name) {
            return Err(StoreError::NameConflict(new.name));
        }

        let now = now_ms();
        let record = CondaEnvRecord {
            name: new.name,
            python_version: new.python_version,
            packages: new.packages,
            custom_script: new.custom_script,
            created_at_ms: now,
            updated_at_ms: now,
        };
        envs.insert(record.name.clone(), record.clone());
        Ok(record)
    }

    async fn get_env(&self, name: &str) -> Result<Option<CondaEnvRecord>, StoreError> {
        let envs = self.envs.lock().expect("store lock poisoned");
        Ok(envs.get(name).cloned())
    }

    async fn list_envs(&self) -> Result<Vec<CondaEnvRecord>, StoreError> {
        let envs = self.envs.lock().expect("store lock poisoned");
        let mut records: Vec<_> = envs.values().cloned().collect();
        records.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(records)
    }

    async fn update_env(
        &self,
        name: &str,
        patch: CondaEnvPatch,
    ) -> Result<CondaEnvRecord, StoreError> {
        let mut envs = self.envs.lock().expect("store lock poisoned");
        let record = envs
            .get_mut(name)
            .ok_or_else(|| StoreError::EnvNotFound(name.to_string()))?;
        if let Some(packages) = patch.packages {
            record.packages = packages;
        }
        if let Some(custom_script) = patch.custom_script {
            record.custom_script = custom_script;
        }
        record.updated_at_ms = now_ms();
        Ok(record.clone())
    }

    async fn delete_env(&self, name: &str) -> Result<(), StoreError> {
        let mut envs = self.envs.lock().expect("store lock poisoned");
        envs.remove(name)
            .ok_or_else(|| StoreError::EnvNotFound(name.to_string()))?;
        Ok(())
    }
}
