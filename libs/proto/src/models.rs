//! Shared state enums and resource snapshot models.

use serde::{Deserialize, Serialize};

/// User-requested lifecycle target for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DesiredState {
    Running,
    Stopped,
}

/// Last-reported lifecycle state of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CurrentState {
    /// Not yet placed or not yet reported by a node.
    Pending,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    /// The owning node is unreachable; the last report is stale.
    Unknown,
}

impl CurrentState {
    /// Whether the deployment no longer occupies its node.
    pub fn is_terminal(self) -> bool {
        matches!(self, CurrentState::Stopped | CurrentState::Failed)
    }
}

/// Workload backend selector. The conductor treats the specification as
/// opaque; node supervisors decode it per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeployKind {
    Exec,
    Docker,
}

/// Origin stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Supervisor lifecycle messages (spawn, stop, restart).
    System,
    /// Health-check messages.
    SystemHc,
}

// =============================================================================
// Resource snapshots
// =============================================================================

/// CPU inventory reported once at hello.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuStatic {
    pub logical_cores: u32,
    pub max_millicores_total: u64,
}

/// Per-core utilization sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpuCoreUsage {
    pub core_id: u32,
    pub used_percent: f64,
}

/// CPU utilization carried on every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuDynamic {
    pub total_percent: f64,
    pub per_core: Vec<CpuCoreUsage>,
}

/// Memory inventory reported once at hello.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStatic {
    pub total_bytes: u64,
}

/// Memory utilization carried on every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryDynamic {
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,
    pub free_bytes: u64,
    pub buffers_bytes: u64,
    pub cached_bytes: u64,
}

/// Filesystem mount inventory reported once at hello.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageMountStatic {
    pub mount_point: String,
    pub fs_type: String,
    pub total_bytes: u64,
}

/// Filesystem usage carried on every heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageMountDynamic {
    pub mount_point: String,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,
}

/// GPU inventory reported once at hello.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuStatic {
    pub index: u32,
    pub name: String,
    pub mem_total_bytes: u64,
}

/// GPU utilization carried on every heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDynamic {
    pub index: u32,
    pub util_percent: f64,
    pub mem_util_percent: f64,
    pub mem_used_bytes: u64,
    pub mem_free_bytes: u64,
    pub temperature_c: i64,
    pub power_w: f64,
}

/// Static resource inventory sent once in the hello frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticResources {
    pub cpu: CpuStatic,
    pub memory: MemoryStatic,
    #[serde(default)]
    pub storage_mounts: Vec<StorageMountStatic>,
    #[serde(default)]
    pub gpus: Vec<GpuStatic>,
}

/// Live resource snapshot carried on every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicResources {
    pub cpu: CpuDynamic,
    pub memory: MemoryDynamic,
    #[serde(default)]
    pub storage_mounts: Vec<StorageMountDynamic>,
    #[serde(default)]
    pub gpus: Vec<GpuDynamic>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desired_state_uses_screaming_case() {
        assert_eq!(
            serde_json::to_string(&DesiredState::Running).unwrap(),
            "\"RUNNING\""
        );
        let parsed: DesiredState = serde_json::from_str("\"STOPPED\"").unwrap();
        assert_eq!(parsed, DesiredState::Stopped);
    }

    #[test]
    fn log_stream_uses_kebab_case() {
        assert_eq!(
            serde_json::to_string(&LogStream::SystemHc).unwrap(),
            "\"system-hc\""
        );
        assert_eq!(
            serde_json::to_string(&LogStream::Stdout).unwrap(),
            "\"stdout\""
        );
    }

    #[test]
    fn terminal_states() {
        assert!(CurrentState::Stopped.is_terminal());
        assert!(CurrentState::Failed.is_terminal());
        assert!(!CurrentState::Running.is_terminal());
        assert!(!CurrentState::Unknown.is_terminal());
    }
}
