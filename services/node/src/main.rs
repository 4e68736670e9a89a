//! Symphony node.
//!
//! Connects to the conductor over mTLS, advertises groups and virtual
//! capacities, and supervises assigned workloads until stopped.

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use symphony_node::agent::Agent;
use symphony_node::config::Config;
use symphony_node::tls;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "fatal startup error");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    info!("starting symphony node");
    tls::init_crypto_provider();

    let config = Config::from_env()?;
    info!(
        node_id = %config.node_id,
        conductor = %config.conductor_addr,
        groups = ?config.groups,
        capacities = ?config.capacities_total,
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        "configuration loaded"
    );

    let agent = Agent::new(config)?;

    tokio::select! {
        _ = agent.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    info!("node stopped");
    Ok(())
}
