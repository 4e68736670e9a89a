//! Fan-out of snapshots and log lines to stream subscribers.
//!
//! Two channels: a conductor-wide change notifier driving the snapshot
//! stream (subscribers re-render the full view per tick), and
//! per-deployment log subscriber sets with bounded queues. Slow log
//! subscribers are evicted rather than allowed to buffer without bound.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use symphony_id::DeploymentId;
use symphony_proto::{LogBatch, LogEntry};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Queue depth for one log subscriber.
const LOG_SUBSCRIBER_QUEUE: usize = 128;
/// Buffered change ticks; laggards just re-render once more.
const CHANGE_QUEUE: usize = 64;

/// What changed, for snapshot-stream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    Deployments,
    Nodes,
}

/// One frame of a deployment log stream, as delivered over HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct LogFrame {
    pub entries: Vec<LogEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct LogSubscriber {
    id: u64,
    tx: mpsc::Sender<LogFrame>,
}

/// Conductor-wide event and log fan-out.
pub struct EventBus {
    changes: broadcast::Sender<ChangeEvent>,
    logs: Mutex<HashMap<DeploymentId, Vec<LogSubscriber>>>,
    next_subscriber_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_QUEUE);
        Self {
            changes,
            logs: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Announce a state change. Nobody listening is fine.
    pub fn notify(&self, event: ChangeEvent) {
        let _ = self.changes.send(event);
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    /// Add a log subscriber for a deployment. Returns the subscriber id,
    /// the frame receiver, and whether this is the first subscriber (the
    /// caller then opens the node-side stream).
    pub fn subscribe_logs(
        &self,
        deployment_id: DeploymentId,
    ) -> (u64, mpsc::Receiver<LogFrame>, bool) {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(LOG_SUBSCRIBER_QUEUE);

        let mut logs = self.logs.lock().expect("log fanout lock poisoned");
        let subscribers = logs.entry(deployment_id).or_default();
        let first = subscribers.is_empty();
        subscribers.push(LogSubscriber { id, tx });
        debug!(
            deployment_id = %deployment_id,
            subscriber_id = id,
            subscribers = subscribers.len(),
            "log subscriber added"
        );
        (id, rx, first)
    }

    /// Remove a log subscriber. Returns true when it was the last one
    /// (the caller then closes the node-side stream).
    pub fn unsubscribe_logs(&self, deployment_id: DeploymentId, subscriber_id: u64) -> bool {
        let mut logs = self.logs.lock().expect("log fanout lock poisoned");
        let Some(subscribers) = logs.get_mut(&deployment_id) else {
            return false;
        };
        subscribers.retain(|s| s.id != subscriber_id);
        if subscribers.is_empty() {
            logs.remove(&deployment_id);
            return true;
        }
        false
    }

    pub fn has_log_subscribers(&self, deployment_id: DeploymentId) -> bool {
        let logs = self.logs.lock().expect("log fanout lock poisoned");
        logs.contains_key(&deployment_id)
    }

    /// Deliver a node log batch to every subscriber. A subscriber whose
    /// queue is full is evicted; its stream simply ends.
    pub fn publish_logs(&self, batch: &LogBatch) {
        let frame = LogFrame {
            entries: batch.entries.clone(),
            error: None,
        };

        let mut logs = self.logs.lock().expect("log fanout lock poisoned");
        let Some(subscribers) = logs.get_mut(&batch.deployment_id) else {
            return;
        };

        subscribers.retain(|subscriber| match subscriber.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    deployment_id = %batch.deployment_id,
                    subscriber_id = subscriber.id,
                    "evicting slow log subscriber"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if subscribers.is_empty() {
            logs.remove(&batch.deployment_id);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
