//! SQLite-backed repository.
//!
//! Single-writer, crash-consistent (WAL) storage for deployment records
//! and tombstones. Operations are short, synchronous statements behind
//! one connection mutex; the conductor is the only writer.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use symphony_id::DeploymentId;
use symphony_proto::{DeployKind, DesiredState};

use super::{
    apply_patch, now_ms, CondaEnvPatch, CondaEnvRecord, CondaEnvRepository, DeploymentPatch,
    DeploymentRecord, DeploymentRepository, NewCondaEnv, NewDeployment, StoreError,
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS deployments (
    id                TEXT PRIMARY KEY,
    name              TEXT NOT NULL,
    kind              TEXT NOT NULL,
    node_group        TEXT NOT NULL,
    capacity_requests TEXT NOT NULL,
    specification     TEXT NOT NULL,
    desired_state     TEXT NOT NULL,
    created_at_ms     INTEGER NOT NULL,
    updated_at_ms     INTEGER NOT NULL,
    spec_revision     INTEGER NOT NULL,
    deleted           INTEGER NOT NULL DEFAULT 0
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_deployments_name ON deployments (name);
CREATE INDEX IF NOT EXISTS idx_deployments_order ON deployments (created_at_ms, id);
CREATE TABLE IF NOT EXISTS conda_envs (
    name           TEXT PRIMARY KEY,
    python_version TEXT NOT NULL,
    packages       TEXT NOT NULL,
    custom_script  TEXT NOT NULL DEFAULT '',
    created_at_ms  INTEGER NOT NULL,
    updated_at_ms  INTEGER NOT NULL
);
";

pub struct SqliteRepository {
    conn: Mutex<Connection>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(backend)?;
        // journal_mode returns a result row, so it goes through query_row.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(backend)?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")
            .map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn is_name_conflict(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn kind_to_str(kind: DeployKind) -> &'static str {
    match kind {
        DeployKind::Exec => "EXEC",
        DeployKind::Docker => "DOCKER",
    }
}

fn desired_to_str(state: DesiredState) -> &'static str {
    match state {
        DesiredState::Running => "RUNNING",
        DesiredState::Stopped => "STOPPED",
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<DeploymentRecord> {
    let id: String = row.get("id")?;
    let kind: String = row.get("kind")?;
    let desired: String = row.get("desired_state")?;
    let requests: String = row.get("capacity_requests")?;
    let spec: String = row.get("specification")?;

    let invalid = |what: &str| {
        rusqlite::Error::InvalidColumnType(0, what.to_string(), rusqlite::types::Type::Text)
    };

    Ok(DeploymentRecord {
        id: DeploymentId::parse(&id).map_err(|_| invalid("id"))?,
        name: row.get("name")?,
        kind: match kind.as_str() {
            "EXEC" => DeployKind::Exec,
            "DOCKER" => DeployKind::Docker,
            _ => return Err(invalid("kind")),
        },
        node_group: row.get("node_group")?,
        capacity_requests: serde_json::from_str::<BTreeMap<String, u64>>(&requests)
            .map_err(|_| invalid("capacity_requests"))?,
        specification: serde_json::from_str(&spec).map_err(|_| invalid("specification"))?,
        desired_state: match desired.as_str() {
            "RUNNING" => DesiredState::Running,
            "STOPPED" => DesiredState::Stopped,
            _ => return Err(invalid("desired_state")),
        },
        created_at_ms: row.get("created_at_ms")?,
        updated_at_ms: row.get("updated_at_ms")?,
        spec_revision: row.get::<_, i64>("spec_revision")? as u64,
        deleted: row.get::<_, i64>("deleted")? != 0,
    })
}

fn write_record(conn: &Connection, record: &DeploymentRecord) -> Result<(), StoreError> {
    let requests = serde_json::to_string(&record.capacity_requests)
        .map_err(|e| StoreError::Backend(e.to_string()))?;
    let spec = serde_json::to_string(&record.specification)
        .map_err(|e| StoreError::Backend(e.to_string()))?;

    conn.execute(
        "INSERT INTO deployments (
            id, name, kind, node_group, capacity_requests, specification,
            desired_state, created_at_ms, updated_at_ms, spec_revision, deleted
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        ON CONFLICT (id) DO UPDATE SET
            name = excluded.name,
            kind = excluded.kind,
            node_group = excluded.node_group,
            capacity_requests = excluded.capacity_requests,
            specification = excluded.specification,
            desired_state = excluded.desired_state,
            updated_at_ms = excluded.updated_at_ms,
            spec_revision = excluded.spec_revision,
            deleted = excluded.deleted",
        params![
            record.id.to_string(),
            record.name,
            kind_to_str(record.kind),
            record.node_group,
            requests,
            spec,
            desired_to_str(record.desired_state),
            record.created_at_ms,
            record.updated_at_ms,
            record.spec_revision as i64,
            record.deleted as i64,
        ],
    )
    .map_err(|e| {
        if is_name_conflict(&e) {
            StoreError::NameConflict(record.name.clone())
        } else {
            backend(e)
        }
    })?;
    Ok(())
}

fn get_by_id(conn: &Connection, id: DeploymentId) -> Result<Option<DeploymentRecord>, StoreError> {
    conn.query_row(
        "SELECT * FROM deployments WHERE id = ?1",
        params![id.to_string()],
        row_to_record,
    )
    .optional()
    .map_err(backend)
}

#[async_trait]
impl DeploymentRepository for SqliteRepository {
    async fn create(&self, new: NewDeployment) -> Result<DeploymentRecord, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
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
        write_record(&conn, &record)?;
        Ok(record)
    }

    async fn get(&self, id: DeploymentId) -> Result<Option<DeploymentRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        get_by_id(&conn, id)
    }

    async fn list(&self, limit: usize, offset: usize) -> Result<Vec<DeploymentRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT * FROM deployments WHERE deleted = 0
                 ORDER BY created_at_ms, id LIMIT ?1 OFFSET ?2",
            )
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![limit as i64, offset as i64], row_to_record)
            .map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }

    async fn list_all(&self) -> Result<Vec<DeploymentRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM deployments ORDER BY created_at_ms, id")
            .map_err(backend)?;
        let rows = stmt.query_map([], row_to_record).map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }

    async fn update(
        &self,
        id: DeploymentId,
        patch: DeploymentPatch,
    ) -> Result<DeploymentRecord, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut record = get_by_id(&conn, id)?.ok_or(StoreError::NotFound(id))?;
        if apply_patch(&mut record, &patch) {
            write_record(&conn, &record)?;
        }
        Ok(record)
    }

    async fn delete(&self, id: DeploymentId) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let changed = conn
            .execute(
                "UPDATE deployments SET deleted = 1, updated_at_ms = ?2 WHERE id = ?1",
                params![id.to_string(), now_ms()],
            )
            .map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn purge(&self, id: DeploymentId) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let changed = conn
            .execute(
                "DELETE FROM deployments WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

fn row_to_env(row: &Row<'_>) -> rusqlite::Result<CondaEnvRecord> {
    let packages: String = row.get("packages")?;
    Ok(CondaEnvRecord {
        name: row.get("name")?,
        python_version: row.get("python_version")?,
        packages: serde_json::from_str(&packages).map_err(|_| {
            rusqlite::Error::InvalidColumnType(
                0,
                "packages".to_string(),
                rusqlite::types::Type::Text,
            )
        })?,
        custom_script: row.get("custom_script")?,
        created_at_ms: row.get("created_at_ms")?,
        updated_at_ms: row.get("updated_at_ms")?,
    })
}

fn get_env_by_name(conn: &Connection, name: &str) -> Result<Option<CondaEnvRecord>, StoreError> {
    conn.query_row(
        "SELECT * FROM conda_envs WHERE name = ?1",
        params![name],
        row_to_env,
    )
    .optional()
    .map_err(backend)
}

#[async_trait]
impl CondaEnvRepository for SqliteRepository {
    async fn create_env(&self, new: NewCondaEnv) -> Result<CondaEnvRecord, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let now = now_ms();
        let packages = serde_json::to_string(&new.packages)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        conn.execute(
            "INSERT INTO conda_envs (
                name, python_version, packages, custom_script,
                created_at_ms, updated_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![new.name, new.python_version, packages, new.custom_script, now, now],
        )
        .map_err(|e| {
            if is_name_conflict(&e) {
                StoreError::NameConflict(new.name.clone())
            } else {
                backend(e)
            }
        })?;

        get_env_by_name(&conn, &new.name)?
            .ok_or_else(|| StoreError::Backend("conda env insert not visible".to_string()))
    }

    async fn get_env(&self, name: &str) -> Result<Option<CondaEnvRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        get_env_by_name(&conn, name)
    }

    async fn list_envs(&self) -> Result<Vec<CondaEnvRecord>, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare("SELECT * FROM conda_envs ORDER BY created_at_ms, name")
            .map_err(backend)?;
        let rows = stmt.query_map([], row_to_env).map_err(backend)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(backend)
    }

    async fn update_env(
        &self,
        name: &str,
        patch: CondaEnvPatch,
    ) -> Result<CondaEnvRecord, StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut record =
            get_env_by_name(&conn, name)?.ok_or_else(|| StoreError::EnvNotFound(name.to_string()))?;

        if let Some(packages) = patch.packages {
            record.packages = packages;
        }
        if let Some(custom_script) = patch.custom_script {
            record.custom_script = custom_script;
        }
        record.updated_at_ms = now_ms();

        let packages = serde_json::to_string(&record.packages)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute(
            "UPDATE conda_envs SET packages = ?2, custom_script = ?3, updated_at_ms = ?4
             WHERE name = ?1",
            params![record.name, packages, record.custom_script, record.updated_at_ms],
        )
        .map_err(backend)?;
        Ok(record)
    }

    async fn delete_env(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let changed = conn
            .execute("DELETE FROM conda_envs WHERE name = ?1", params![name])
            .map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::EnvNotFound(name.to_string()));
        }
        Ok(())
    }
}
