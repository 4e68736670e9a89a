//! Configuration for the node agent.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Node configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Opaque node identity asserted in the hello frame.
    pub node_id: String,

    /// Conductor wire address, `host:port`.
    pub conductor_addr: String,

    /// Placement groups this node advertises.
    pub groups: Vec<String>,

    /// Declared virtual capacity totals, label → amount.
    pub capacities_total: BTreeMap<String, u64>,

    /// Heartbeat cadence (the conductor clamps to 1–30 s).
    pub heartbeat_interval: Duration,

    /// Directory holding `ca.pem`, `node-client.pem` and
    /// `node-client.key` from the conductor's bundle.
    pub cert_dir: PathBuf,

    /// Base directory for git-repo workdirs of exec deployments.
    pub repo_dir: PathBuf,

    /// Mount points sampled for storage usage.
    pub mount_points: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let node_id = std::env::var("SYMPHONY_NODE_ID").context("SYMPHONY_NODE_ID is required")?;
        if node_id.trim().is_empty() {
            bail!("SYMPHONY_NODE_ID must not be empty");
        }

        let conductor_addr = std::env::var("SYMPHONY_CONDUCTOR_ADDR")
            .unwrap_or_else(|_| "localhost:50051".to_string());

        let groups: Vec<String> = std::env::var("SYMPHONY_NODE_GROUPS")
            .unwrap_or_else(|_| "default".to_string())
            .split(',')
            .map(|g| g.trim().to_string())
            .filter(|g| !g.is_empty())
            .collect();
        if groups.is_empty() {
            bail!("SYMPHONY_NODE_GROUPS must name at least one group");
        }

        let capacities_total = parse_capacities(
            &std::env::var("SYMPHONY_NODE_CAPACITIES").unwrap_or_default(),
        )?;

        let heartbeat_interval = std::env::var("SYMPHONY_HEARTBEAT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|s| s.clamp(1, 30))
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(3));

        let cert_dir = std::env::var("SYMPHONY_CERT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("certs"));

        let repo_dir = std::env::var("SYMPHONY_REPO_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("symphony").join("repos"));

        let mount_points: Vec<String> = std::env::var("SYMPHONY_MOUNT_POINTS")
            .unwrap_or_else(|_| "/".to_string())
            .split(',')
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .collect();

        Ok(Self {
            node_id,
            conductor_addr,
            groups,
            capacities_total,
            heartbeat_interval,
            cert_dir,
            repo_dir,
            mount_points,
        })
    }

    /// Host part of the conductor address, for TLS server-name checks.
    pub fn conductor_host(&self) -> &str {
        self.conductor_addr
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.conductor_addr)
    }
}

/// Parse `label=amount` pairs separated by commas, e.g. `A=10,gpu=2`.
fn parse_capacities(raw: &str) -> Result<BTreeMap<String, u64>> {
    let mut capacities = BTreeMap::new();
    for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let Some((label, amount)) = pair.split_once('=') else {
            bail!("invalid capacity '{pair}', expected label=amount");
        };
        let amount: u64 = amount
            .trim()
            .parse()
            .with_context(|| format!("invalid capacity amount in '{pair}'"))?;
        if amount == 0 {
            bail!("capacity '{pair}' must be positive");
        }
        capacities.insert(label.trim().to_string(), amount);
    }
    Ok(capacities)
}
