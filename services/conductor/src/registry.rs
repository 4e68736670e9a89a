//! In-memory registry of connected nodes.
//!
//! One record per node, created when a `NodeHello` is accepted and
//! destroyed once the session has terminated and the disconnect grace
//! window elapsed. Readers take point-in-time copies; writers hold the
//! lock only long enough to copy references and numeric fields.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use symphony_proto::{ConductorToNode, DynamicResources, Heartbeat, NodeHello, StaticResources};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

/// Declared heartbeat cadence is clamped into this range.
pub const MIN_HEARTBEAT: Duration = Duration::from_secs(1);
pub const MAX_HEARTBEAT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(3);

/// No frame for 3 intervals marks the session stale.
const STALE_INTERVALS: u32 = 3;
/// No frame for 10 intervals forces a disconnect.
const DEAD_INTERVALS: u32 = 10;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A live session already holds this node id.
    #[error("node '{0}' is already registered")]
    Conflict(String),

    /// The node has no live session to send to.
    #[error("node '{0}' is not connected")]
    NotConnected(String),

    /// The session's outbound queue is full.
    #[error("outbound queue full for node '{0}'")]
    QueueFull(String),
}

/// Session liveness derived from heartbeat age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Connected,
    /// Heartbeats overdue; still an assignment target but skipped for
    /// new placements.
    Stale,
    /// Session gone; record kept through the grace window.
    Disconnected,
}

/// Handle a session registers so the conductor can reach its writer.
#[derive(Clone)]
pub struct SessionHandle {
    pub outbound: mpsc::Sender<ConductorToNode>,
    pub shutdown: watch::Sender<bool>,
}

/// One registered node.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub node_id: String,
    pub groups: Vec<String>,
    pub capacities_total: BTreeMap<String, u64>,
    pub heartbeat_interval: Duration,
    /// Wall-clock time of the last frame, for API reporting.
    pub last_heartbeat_ms: i64,
    /// Monotonic time of the last frame, for health derivation.
    pub last_seen: Instant,
    pub connected: bool,
    pub disconnected_at: Option<Instant>,
    pub static_resources: StaticResources,
    pub dynamic: DynamicResources,
    pub dynamic_timestamp_unix_ms: i64,
    /// Capacity usage as reported by the node itself.
    pub reported_capacities_used: BTreeMap<String, u64>,
    /// Conda environments the node last reported holding.
    pub conda_envs: Vec<String>,
}

impl NodeEntry {
    pub fn health(&self, now: Instant) -> NodeHealth {
        if !self.connected {
            return NodeHealth::Disconnected;
        }
        let age = now.saturating_duration_since(self.last_seen);
        if age > self.heartbeat_interval * DEAD_INTERVALS {
            NodeHealth::Disconnected
        } else if age > self.heartbeat_interval * STALE_INTERVALS {
            NodeHealth::Stale
        } else {
            NodeHealth::Connected
        }
    }

    /// Whether the node is a valid target for new placements.
    pub fn placeable(&self, now: Instant) -> bool {
        self.health(now) == NodeHealth::Connected
    }
}

struct NodeSlot {
    entry: NodeEntry,
    handle: Option<SessionHandle>,
}

/// Process-wide map from node id to session state.
pub struct NodeRegistry {
    inner: RwLock<HashMap<String, NodeSlot>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Register a freshly-handshaken session.
    ///
    /// A record whose previous session is gone (disconnect grace window)
    /// may be replaced by a new hello with the same id; a live session
    /// with the same id is a conflict and the new stream is rejected.
    pub fn register(&self, hello: &NodeHello, handle: SessionHandle) -> Result<(), RegistryError> {
        let interval = Duration::from_millis(hello.heartbeat_interval_ms).clamp(
            MIN_HEARTBEAT,
            MAX_HEARTBEAT,
        );
        let now = Instant::now();

        let mut inner = self.inner.write().expect("node registry lock poisoned");
        if let Some(slot) = inner.get(&hello.node_id) {
            if slot.entry.connected {
                return Err(RegistryError::Conflict(hello.node_id.clone()));
            }
        }

        let entry = NodeEntry {
            node_id: hello.node_id.clone(),
            groups: hello.groups.clone(),
            capacities_total: hello.capacities_total.clone(),
            heartbeat_interval: interval,
            last_heartbeat_ms: chrono::Utc::now().timestamp_millis(),
            last_seen: now,
            connected: true,
            disconnected_at: None,
            static_resources: hello.static_resources.clone(),
            dynamic: DynamicResources::default(),
            dynamic_timestamp_unix_ms: 0,
            reported_capacities_used: BTreeMap::new(),
            conda_envs: Vec::new(),
        };

        inner.insert(
            hello.node_id.clone(),
            NodeSlot {
                entry,
                handle: Some(handle),
            },
        );

        info!(
            node_id = %hello.node_id,
            groups = ?hello.groups,
            capacities = ?hello.capacities_total,
            "node registered"
        );
        Ok(())
    }

    /// Mark a session as gone. Idempotent; the record survives until the
    /// grace window elapses so a quick reconnect keeps its assignments.
    pub fn deregister(&self, node_id: &str, reason: &str) -> bool {
        let mut inner = self.inner.write().expect("node registry lock poisoned");
        let Some(slot) = inner.get_mut(node_id) else {
            return false;
        };
        if !slot.entry.connected {
            return false;
        }
        slot.entry.connected = false;
        slot.entry.disconnected_at = Some(Instant::now());
        slot.handle = None;
        info!(node_id, reason, "node session closed");
        true
    }

    /// Record a heartbeat frame.
    pub fn heartbeat(&self, hb: &Heartbeat) {
        let mut inner = self.inner.write().expect("node registry lock poisoned");
        if let Some(slot) = inner.get_mut(&hb.node_id) {
            slot.entry.last_seen = Instant::now();
            slot.entry.last_heartbeat_ms = chrono::Utc::now().timestamp_millis();
            slot.entry.dynamic = hb.resources.clone();
            slot.entry.dynamic_timestamp_unix_ms = hb.timestamp_unix_ms;
            slot.entry.reported_capacities_used = hb.total_capacities_used.clone();
        }
    }

    /// Record that any frame arrived on the node's session.
    pub fn touch(&self, node_id: &str) {
        let mut inner = self.inner.write().expect("node registry lock poisoned");
        if let Some(slot) = inner.get_mut(node_id) {
            slot.entry.last_seen = Instant::now();
        }
    }

    /// Record the node's reported conda environment names.
    pub fn update_conda_envs(&self, node_id: &str, env_names: Vec<String>) {
        let mut inner = self.inner.write().expect("node registry lock poisoned");
        if let Some(slot) = inner.get_mut(node_id) {
            slot.entry.last_seen = Instant::now();
            slot.entry.conda_envs = env_names;
        }
    }

    pub fn get(&self, node_id: &str) -> Option<NodeEntry> {
        let inner = self.inner.read().expect("node registry lock poisoned");
        inner.get(node_id).map(|s| s.entry.clone())
    }

    /// Point-in-time copy of every record.
    pub fn snapshot(&self) -> Vec<NodeEntry> {
        let inner = self.inner.read().expect("node registry lock poisoned");
        inner.values().map(|s| s.entry.clone()).collect()
    }

    /// Candidates for new placements: connected nodes in the group with
    /// fresh heartbeats. Stale nodes are excluded.
    pub fn nodes_in_group(&self, group: &str) -> Vec<NodeEntry> {
        let now = Instant::now();
        let inner = self.inner.read().expect("node registry lock poisoned");
        inner
            .values()
            .filter(|s| s.entry.groups.iter().any(|g| g == group) && s.entry.placeable(now))
            .map(|s| s.entry.clone())
            .collect()
    }

    /// Queue a message onto the node's session writer without blocking.
    pub fn send(&self, node_id: &str, msg: ConductorToNode) -> Result<(), RegistryError> {
        let inner = self.inner.read().expect("node registry lock poisoned");
        let slot = inner
            .get(node_id)
            .filter(|s| s.entry.connected)
            .ok_or_else(|| RegistryError::NotConnected(node_id.to_string()))?;
        let handle = slot
            .handle
            .as_ref()
            .ok_or_else(|| RegistryError::NotConnected(node_id.to_string()))?;
        handle.outbound.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RegistryError::QueueFull(node_id.to_string()),
            mpsc::error::TrySendError::Closed(_) => {
                RegistryError::NotConnected(node_id.to_string())
            }
        })
    }

    /// Signal a session to shut down (e.g. heartbeat timeout).
    pub fn close_session(&self, node_id: &str) {
        let inner = self.inner.read().expect("node registry lock poisoned");
        if let Some(handle) = inner.get(node_id).and_then(|s| s.handle.as_ref()) {
            let _ = handle.shutdown.send(true);
        }
    }

    /// Force-disconnect sessions whose heartbeats are 10 intervals
    /// overdue. Returns the affected node ids.
    pub fn enforce_heartbeat_timeouts(&self) -> Vec<String> {
        let now = Instant::now();
        let mut timed_out = Vec::new();
        {
            let inner = self.inner.read().expect("node registry lock poisoned");
            for slot in inner.values() {
                if slot.entry.connected && slot.entry.health(now) == NodeHealth::Disconnected {
                    timed_out.push(slot.entry.node_id.clone());
                }
            }
        }
        for node_id in &timed_out {
            warn!(node_id = %node_id, "heartbeat timeout, closing session");
            self.close_session(node_id);
            self.deregister(node_id, "heartbeat-timeout");
        }
        timed_out
    }

    /// Remove disconnected records whose grace window (one heartbeat
    /// interval) has elapsed. Returns the reaped node ids; their
    /// assignments must be released by the caller.
    pub fn reap_disconnected(&self) -> Vec<String> {
        let now = Instant::now();
        let mut inner = self.inner.write().expect("node registry lock poisoned");
        let expired: Vec<String> = inner
            .values()
            .filter(|s| {
                !s.entry.connected
                    && s.entry
                        .disconnected_at
                        .is_some_and(|t| now.saturating_duration_since(t) > s.entry.heartbeat_interval)
            })
            .map(|s| s.entry.node_id.clone())
            .collect();
        for node_id in &expired {
            inner.remove(node_id);
            info!(node_id = %node_id, "node record reaped after grace window");
        }
        expired
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello(node_id: &str, groups: &[&str]) -> NodeHello {
        NodeHello {
            node_id: node_id.to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
            capacities_total: BTreeMap::from([("A".to_string(), 10)]),
            heartbeat_interval_ms: 3000,
            static_resources: StaticResources::default(),
        }
    }

    fn handle() -> (SessionHandle, mpsc::Receiver<ConductorToNode>) {
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        (
            SessionHandle {
                outbound: tx,
                shutdown: shutdown_tx,
            },
            rx,
        )
    }

    #[test]
    fn register_then_conflict() {
        let registry = NodeRegistry::new();
        let (h1, _rx1) = handle();
        registry.register(&hello("n1", &["gpu"]), h1).unwrap();

        let (h2, _rx2) = handle();
        let err = registry.register(&hello("n1", &["gpu"]), h2).unwrap_err();
        assert!(matches!(err, RegistryError::Conflict(_)));
    }

    #[test]
    fn reconnect_after_deregister_is_allowed() {
        let registry = NodeRegistry::new();
        let (h1, _rx1) = handle();
        registry.register(&hello("n1", &["gpu"]), h1).unwrap();
        assert!(registry.deregister("n1", "transport-error"));
        // Second deregister is a no-op.
        assert!(!registry.deregister("n1", "transport-error"));

        let (h2, _rx2) = handle();
        registry.register(&hello("n1", &["gpu"]), h2).unwrap();
        assert!(registry.get("n1").unwrap().connected);
    }

    #[test]
    fn heartbeat_interval_is_clamped() {
        let registry = NodeRegistry::new();
        let (h, _rx) = handle();
        let mut msg = hello("n1", &["gpu"]);
        msg.heartbeat_interval_ms = 120_000;
        registry.register(&msg, h).unwrap();
        assert_eq!(
            registry.get("n1").unwrap().heartbeat_interval,
            MAX_HEARTBEAT
        );
    }

    #[test]
    fn group_index_filters_membership() {
        let registry = NodeRegistry::new();
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();
        registry.register(&hello("n1", &["gpu"]), h1).unwrap();
        registry.register(&hello("n2", &["cpu"]), h2).unwrap();

        let gpu = registry.nodes_in_group("gpu");
        assert_eq!(gpu.len(), 1);
        assert_eq!(gpu[0].node_id, "n1");
        assert!(registry.nodes_in_group("tpu").is_empty());
    }

    #[test]
    fn disconnected_node_is_not_placeable() {
        let registry = NodeRegistry::new();
        let (h, _rx) = handle();
        registry.register(&hello("n1", &["gpu"]), h).unwrap();
        registry.deregister("n1", "test");
        assert!(registry.nodes_in_group("gpu").is_empty());
        // Record survives until the grace window elapses.
        assert!(registry.get("n1").is_some());
    }

    #[test]
    fn send_reaches_the_session_queue() {
        let registry = NodeRegistry::new();
        let (h, mut rx) = handle();
        registry.register(&hello("n1", &["gpu"]), h).unwrap();

        registry.send("n1", ConductorToNode::Pong).unwrap();
        assert_eq!(rx.try_recv().unwrap(), ConductorToNode::Pong);

        let err = registry.send("nope", ConductorToNode::Pong).unwrap_err();
        assert!(matches!(err, RegistryError::NotConnected(_)));
    }

    #[test]
    fn health_derivation_from_heartbeat_age() {
        let now = Instant::now();
        let entry = NodeEntry {
            node_id: "n1".to_string(),
            groups: vec!["gpu".to_string()],
            capacities_total: BTreeMap::new(),
            heartbeat_interval: Duration::from_secs(1),
            last_heartbeat_ms: 0,
            last_seen: now - Duration::from_secs(5),
            connected: true,
            disconnected_at: None,
            static_resources: StaticResources::default(),
            dynamic: DynamicResources::default(),
            dynamic_timestamp_unix_ms: 0,
            reported_capacities_used: BTreeMap::new(),
            conda_envs: Vec::new(),
        };
        assert_eq!(entry.health(now), NodeHealth::Stale);

        let dead = NodeEntry {
            last_seen: now - Duration::from_secs(11),
            ..entry.clone()
        };
        assert_eq!(dead.health(now), NodeHealth::Disconnected);

        let fresh = NodeEntry {
            last_seen: now,
            ..entry
        };
        assert_eq!(fresh.health(now), NodeHealth::Connected);
    }
}
