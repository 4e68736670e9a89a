//! Per-node virtual-capacity accounting.
//!
//! The ledger is the only authority that mutates reservations: the
//! scheduler proposes, the ledger decides. `try_reserve` checks every
//! requested label against `available = total − reserved` and either
//! increments them all or none. Operations are linearized by a single
//! short mutex.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use thiserror::Error;

/// Errors from ledger operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("node '{0}' has no capacity row")]
    UnknownNode(String),

    /// At least one requested label exceeds the available amount.
    #[error("insufficient capacity on '{node_id}' for label '{label}'")]
    Insufficient { node_id: String, label: String },

    /// A release would drive a reservation negative. The caller must
    /// treat this as an accounting invariant breach.
    #[error("capacity underflow on '{node_id}' for label '{label}'")]
    Underflow { node_id: String, label: String },
}

#[derive(Debug, Clone)]
struct NodeCapacity {
    total: BTreeMap<String, u64>,
    reserved: BTreeMap<String, u64>,
}

/// Reservation ledger keyed by node id.
pub struct CapacityLedger {
    inner: Mutex<HashMap<String, NodeCapacity>>,
}

impl CapacityLedger {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Install a node's total capacity vector. Totals are immutable for
    /// the lifetime of a session; an existing reservation vector (from a
    /// reconnect inside the grace window) is preserved.
    pub fn register_node(&self, node_id: &str, total: &BTreeMap<String, u64>) {
        let mut inner = self.inner.lock().expect("capacity ledger lock poisoned");
        match inner.get_mut(node_id) {
            Some(row) => row.total = total.clone(),
            None => {
                inner.insert(
                    node_id.to_string(),
                    NodeCapacity {
                        total: total.clone(),
                        reserved: BTreeMap::new(),
                    },
                );
            }
        }
    }

    /// Drop a node's capacity row entirely.
    pub fn remove_node(&self, node_id: &str) {
        let mut inner = self.inner.lock().expect("capacity ledger lock poisoned");
        inner.remove(node_id);
    }

    /// Atomically reserve `requests` against the node's available
    /// vector: either every label is incremented or none are.
    pub fn try_reserve(
        &self,
        node_id: &str,
        requests: &BTreeMap<String, u64>,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().expect("capacity ledger lock poisoned");
        let row = inner
            .get_mut(node_id)
            .ok_or_else(|| LedgerError::UnknownNode(node_id.to_string()))?;

        for (label, amount) in requests {
            let total = row.total.get(label).copied().unwrap_or(0);
            let reserved = row.reserved.get(label).copied().unwrap_or(0);
            if reserved + amount > total {
                return Err(LedgerError::Insufficient {
                    node_id: node_id.to_string(),
                    label: label.clone(),
                });
            }
        }

        for (label, amount) in requests {
            *row.reserved.entry(label.clone()).or_insert(0) += amount;
        }
        Ok(())
    }

    /// Return a previous reservation. Errors instead of saturating so a
    /// double release surfaces as the invariant breach it is.
    pub fn release(
        &self,
        node_id: &str,
        requests: &BTreeMap<String, u64>,
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().expect("capacity ledger lock poisoned");
        let row = inner
            .get_mut(node_id)
            .ok_or_else(|| LedgerError::UnknownNode(node_id.to_string()))?;

        for (label, amount) in requests {
            let reserved = row.reserved.get(label).copied().unwrap_or(0);
            if *amount > reserved {
                return Err(LedgerError::Underflow {
                    node_id: node_id.to_string(),
                    label: label.clone(),
                });
            }
        }

        for (label, amount) in requests {
            if let Some(reserved) = row.reserved.get_mut(label) {
                *reserved -= amount;
            }
        }
        Ok(())
    }

    /// Copy of the node's available vector (`total − reserved`).
    pub fn available(&self, node_id: &str) -> Option<BTreeMap<String, u64>> {
        let inner = self.inner.lock().expect("capacity ledger lock poisoned");
        inner.get(node_id).map(|row| {
            row.total
                .iter()
                .map(|(label, total)| {
                    let reserved = row.reserved.get(label).copied().unwrap_or(0);
                    (label.clone(), total.saturating_sub(reserved))
                })
                .collect()
        })
    }

    /// Copy of the node's reserved vector.
    pub fn reserved(&self, node_id: &str) -> Option<BTreeMap<String, u64>> {
        let inner = self.inner.lock().expect("capacity ledger lock poisoned");
        inner.get(node_id).map(|row| row.reserved.clone())
    }
}

impl Default for CapacityLedger {
    fn default() -> Self {
        Self::new()
    }
}
