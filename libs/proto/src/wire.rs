//! Message types for the bidirectional node ⇄ conductor stream.
//!
//! Frames are JSON-encoded, internally tagged on `type`. All messages on
//! one session are processed in arrival order; the `spec_revision`
//! carried by deployment commands is the node's final guard against
//! out-of-order application.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use symphony_id::DeploymentId;
use thiserror::Error;

use crate::models::{CurrentState, DeployKind, DynamicResources, LogStream, StaticResources};

/// Errors produced while encoding or decoding wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

// =============================================================================
// Node → conductor
// =============================================================================

/// First frame of every session. Declares the node's identity, placement
/// groups, virtual capacity totals and static resource inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHello {
    pub node_id: String,
    pub groups: Vec<String>,
    pub capacities_total: BTreeMap<String, u64>,
    /// Declared heartbeat cadence; the conductor clamps it to 1–30 s.
    pub heartbeat_interval_ms: u64,
    pub static_resources: StaticResources,
}

/// Periodic liveness + live resource report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: String,
    pub timestamp_unix_ms: i64,
    /// Sum of capacity requests over deployments live on this node.
    #[serde(default)]
    pub total_capacities_used: BTreeMap<String, u64>,
    pub resources: DynamicResources,
}

/// Per-deployment state as observed by the node supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub deployment_id: DeploymentId,
    pub current_state: CurrentState,
    /// Highest spec revision the supervisor has applied.
    pub revision_acked: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    #[serde(default)]
    pub restart_count: u32,
}

/// Full status list, carried on every heartbeat and pushed immediately on
/// state changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatusList {
    pub deployments: Vec<DeploymentStatus>,
}

/// One captured log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp_unix_ms: i64,
    pub stream: LogStream,
    pub line: String,
}

/// A batch of log lines for one subscribed deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogBatch {
    pub deployment_id: DeploymentId,
    pub entries: Vec<LogEntry>,
    /// Lines lost to ring-buffer overflow since the last batch.
    #[serde(default)]
    pub dropped: u64,
}

/// Names of the conda environments present on a node. Sent after hello
/// and again after every ensure pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CondaEnvReport {
    pub env_names: Vec<String>,
}

/// Messages flowing from a node to the conductor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeToConductor {
    Hello(NodeHello),
    Heartbeat(Heartbeat),
    DeploymentStatusList(DeploymentStatusList),
    LogBatch(LogBatch),
    CondaEnvReport(CondaEnvReport),
}

// =============================================================================
// Conductor → node
// =============================================================================

/// Handshake acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub message: String,
}

/// What a [`DeploymentReq`] asks the supervisor to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentAction {
    Start,
    Update,
    Stop,
}

/// Create/update/stop command for one deployment.
///
/// Supervisors ignore commands whose `spec_revision` is not newer than
/// the locally acked revision, except STOP which always applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentReq {
    pub action: DeploymentAction,
    pub deployment_id: DeploymentId,
    pub spec_revision: u64,
    pub kind: DeployKind,
    /// Echoed back in heartbeat capacity usage accounting.
    #[serde(default)]
    pub capacity_requests: BTreeMap<String, u64>,
    /// Opaque to the conductor; decoded per `kind` at the node boundary.
    pub specification: serde_json::Value,
}

/// Tear down a deployment entirely (deletion). Always applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentCancel {
    pub deployment_id: DeploymentId,
}

/// Open a log stream for one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSubscribe {
    pub deployment_id: DeploymentId,
    /// Backfill the most recent N ring entries before going live.
    pub tail: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streams: Option<Vec<LogStream>>,
}

/// Close the log stream for one deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogUnsubscribe {
    pub deployment_id: DeploymentId,
}

/// One conda environment a node is expected to provide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CondaEnvSpec {
    pub name: String,
    pub python_version: String,
    #[serde(default)]
    pub packages: Vec<String>,
    /// Extra shell script run after `conda create`. A first line of
    /// `__SYMPHONY_FORCE_RECREATE__` forces recreation of an existing
    /// environment.
    #[serde(default)]
    pub custom_script: String,
}

/// Ask a node to materialize the listed conda environments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CondaEnvEnsure {
    pub envs: Vec<CondaEnvSpec>,
}

/// Messages flowing from the conductor to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConductorToNode {
    Ack(Ack),
    Pong,
    DeploymentReq(DeploymentReq),
    DeploymentCancel(DeploymentCancel),
    LogSubscribe(LogSubscribe),
    LogUnsubscribe(LogUnsubscribe),
    CondaEnvEnsure(CondaEnvEnsure),
}

// =============================================================================
// Encoding
// =============================================================================

impl NodeToConductor {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

impl ConductorToNode {
    pub fn encode(&self) -> Result<Bytes, WireError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DesiredState;

    fn sample_hello() -> NodeHello {
        NodeHello {
            node_id: "n1".to_string(),
            groups: vec!["gpu".to_string()],
            capacities_total: BTreeMap::from([("A".to_string(), 10)]),
            heartbeat_interval_ms: 3000,
            static_resources: StaticResources::default(),
        }
    }

    #[test]
    fn hello_roundtrip() {
        let msg = NodeToConductor::Hello(sample_hello());
        let bytes = msg.encode().unwrap();
        let back = NodeToConductor::decode(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn hello_is_tagged() {
        let msg = NodeToConductor::Hello(sample_hello());
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "hello");
        assert_eq!(json["node_id"], "n1");
    }

    #[test]
    fn pong_is_a_bare_tag() {
        let bytes = ConductorToNode::Pong.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json, serde_json::json!({"type": "pong"}));
    }

    #[test]
    fn deployment_req_roundtrip() {
        let msg = ConductorToNode::DeploymentReq(DeploymentReq {
            action: DeploymentAction::Start,
            deployment_id: DeploymentId::new(),
            spec_revision: 4,
            kind: DeployKind::Exec,
            capacity_requests: BTreeMap::from([("A".to_string(), 3)]),
            specification: serde_json::json!({
                "version": 1,
                "command": ["/bin/true"],
                "desired_state": DesiredState::Running,
            }),
        });
        let back = ConductorToNode::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn conda_ensure_roundtrip() {
        let msg = ConductorToNode::CondaEnvEnsure(CondaEnvEnsure {
            envs: vec![CondaEnvSpec {
                name: "ml".to_string(),
                python_version: "3.11".to_string(),
                packages: vec!["numpy".to_string()],
                custom_script: String::new(),
            }],
        });
        let back = ConductorToNode::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(msg, back);

        let report = NodeToConductor::CondaEnvReport(CondaEnvReport {
            env_names: vec!["base".to_string(), "ml".to_string()],
        });
        let json: serde_json::Value =
            serde_json::from_slice(&report.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "conda_env_report");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(NodeToConductor::decode(b"{not json").is_err());
        assert!(NodeToConductor::decode(b"{\"type\":\"nope\"}").is_err());
    }

    #[test]
    fn status_omits_empty_optionals() {
        let status = DeploymentStatus {
            deployment_id: DeploymentId::new(),
            current_state: CurrentState::Pending,
            revision_acked: 0,
            exit_code: None,
            pid: None,
            started_at_ms: None,
            restart_count: 0,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(!json.contains("exit_code"));
        assert!(!json.contains("pid"));
    }
}
