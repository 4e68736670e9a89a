//! Symphony conductor.
//!
//! Binds the node wire listener (mTLS) and the control HTTP server,
//! then drives the reconciliation loop until shutdown. Exit codes:
//! 0 clean shutdown, 1 fatal startup error, 2 invariant violation.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use symphony_conductor::assignments::AssignmentTable;
use symphony_conductor::config::Config;
use symphony_conductor::ledger::CapacityLedger;
use symphony_conductor::reconciler::{Reconciler, ReconcilerConfig};
use symphony_conductor::registry::NodeRegistry;
use symphony_conductor::session::{self, SessionContext};
use symphony_conductor::state::AppState;
use symphony_conductor::store::{
    CondaEnvRepository, DeploymentRepository, MemoryRepository, SqliteRepository,
};
use symphony_conductor::stream::EventBus;
use symphony_conductor::{api, tls};

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
    info!("starting symphony conductor");
    tls::init_crypto_provider();

    let config = Config::from_env().context("loading configuration")?;
    info!(
        wire_addr = %config.wire_addr,
        http_addr = %config.http_addr,
        cert_dir = %config.cert_dir.display(),
        "configuration loaded"
    );

    let tls_paths = tls::ensure_mtls_bundle(&config.cert_dir, config.server_name.as_deref())
        .context("preparing mTLS bundle")?;
    let server_config = tls::server_config(&tls_paths).context("building TLS server config")?;
    let acceptor = TlsAcceptor::from(server_config);

    // Both stores (deployments and conda envs) share one backend.
    let repo: Arc<dyn DeploymentRepository>;
    let envs: Arc<dyn CondaEnvRepository>;
    match &config.db_path {
        Some(path) => {
            info!(path = %path.display(), "opening deployment store");
            let backend =
                Arc::new(SqliteRepository::open(path).context("opening deployment store")?);
            repo = Arc::clone(&backend) as Arc<dyn DeploymentRepository>;
            envs = backend;
        }
        None => {
            info!("using in-memory deployment store");
            let backend = Arc::new(MemoryRepository::new());
            repo = Arc::clone(&backend) as Arc<dyn DeploymentRepository>;
            envs = backend;
        }
    }

    let registry = Arc::new(NodeRegistry::new());
    let ledger = Arc::new(CapacityLedger::new());
    let assignments = Arc::new(AssignmentTable::new());
    let bus = Arc::new(EventBus::new());

    let (reconciler, reconciler_handle) = Reconciler::new(
        Arc::clone(&registry),
        Arc::clone(&ledger),
        Arc::clone(&repo),
        Arc::clone(&assignments),
        Arc::clone(&bus),
        ReconcilerConfig {
            sweep_interval: config.sweep_interval,
            command_ack_timeout: config.command_ack_timeout,
            ..Default::default()
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let wire_listener = tokio::net::TcpListener::bind(config.wire_addr)
        .await
        .with_context(|| format!("binding wire listener on {}", config.wire_addr))?;
    info!(addr = %config.wire_addr, "node wire listener bound");

    let session_ctx = SessionContext {
        registry: Arc::clone(&registry),
        ledger: Arc::clone(&ledger),
        envs: Arc::clone(&envs),
        bus: Arc::clone(&bus),
        reconciler: reconciler_handle.clone(),
    };
    let session_task = tokio::spawn(session::serve(
        wire_listener,
        acceptor,
        session_ctx,
        shutdown_rx.clone(),
    ));

    let reconciler_task = tokio::spawn(reconciler.run(shutdown_rx.clone()));

    let state = AppState::new(
        registry,
        ledger,
        repo,
        envs,
        assignments,
        bus,
        reconciler_handle,
    );
    let app = api::create_router(state);

    let http_listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("binding HTTP listener on {}", config.http_addr))?;
    info!(addr = %config.http_addr, "control HTTP listener bound");

    let http = axum::serve(http_listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    });

    http.await.context("HTTP server failed")?;

    // Close sessions, stop the reconciler, let in-flight work settle.
    let _ = shutdown_tx.send(true);
    let _ = session_task.await;
    let _ = reconciler_task.await;
    info!("conductor stopped");
    Ok(())
}
