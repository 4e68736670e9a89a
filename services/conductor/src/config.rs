//! Configuration for the conductor.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

/// Conductor configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the node wire listener binds to.
    pub wire_addr: SocketAddr,

    /// Address the control HTTP server binds to.
    pub http_addr: SocketAddr,

    /// Directory holding the mTLS bundle; missing files are generated
    /// at first boot.
    pub cert_dir: PathBuf,

    /// Extra SAN for the server certificate (hostname or IP nodes dial).
    pub server_name: Option<String>,

    /// SQLite database path for deployment records. Empty means the
    /// in-memory repository.
    pub db_path: Option<PathBuf>,

    /// Periodic reconciler sweep interval.
    pub sweep_interval: Duration,

    /// Re-issue window for unacknowledged deployment commands.
    pub command_ack_timeout: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let wire_addr = std::env::var("SYMPHONY_WIRE_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:50051".to_string())
            .parse()?;

        let http_addr = std::env::var("SYMPHONY_HTTP_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()?;

        let cert_dir = std::env::var("SYMPHONY_CERT_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("certs"));

        let server_name = std::env::var("SYMPHONY_SERVER_NAME")
            .ok()
            .filter(|s| !s.is_empty());

        let db_path = std::env::var("SYMPHONY_DB_PATH")
            .ok()
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        let sweep_interval = std::env::var("SYMPHONY_SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(|s| s.clamp(1, 5))
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(2));

        let command_ack_timeout = std::env::var("SYMPHONY_COMMAND_ACK_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(30));

        Ok(Self {
            wire_addr,
            http_addr,
            cert_dir,
            server_name,
            db_path,
            sweep_interval,
            command_ack_timeout,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wire_addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            http_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            cert_dir: PathBuf::from("certs"),
            server_name: None,
            db_path: None,
            sweep_interval: Duration::from_secs(2),
            command_ack_timeout: Duration::from_secs(30),
        }
    }
}
