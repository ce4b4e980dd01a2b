//! Coordinator binary entry point
//!
//! Runs a single node cluster over in-memory directory and backends.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};

use coordinator::seed::{apply_seed, load_seed};
use coordinator::{Cluster, InMemoryDirectory, ProjectSupervisor};
use lifecycle::WorkerLifecycle;
use view_core::logging::{init_tracing, DEFAULT_FILTER};
use view_core::RuntimeConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing(DEFAULT_FILTER);

    let config = match std::env::args().nth(1) {
        Some(path) => RuntimeConfig::load(&path)?,
        None => RuntimeConfig::default(),
    };
    config.validate()?;

    info!(
        node = %config.node.node_id,
        shards = config.sharding.shard_count,
        "Starting view coordinator"
    );

    let directory = Arc::new(InMemoryDirectory::new(config.directory.notification_buffer));
    let (lifecycle, _index, _graph) =
        WorkerLifecycle::in_memory(&config.cleanup, config.coordinator.stop_timeout);

    let cluster = Cluster::new(&config.sharding)?;
    let router = cluster
        .join(
            &config.node.node_id,
            lifecycle,
            directory.clone(),
            &config.coordinator,
        )
        .await;

    if let Some(path) = &config.directory.seed_path {
        let supervisor = ProjectSupervisor::new(router.clone(), directory.clone());
        let seeded = apply_seed(load_seed(path)?, &directory, &supervisor).await?;
        info!(projects = seeded, path = %path.display(), "Loaded seed");
    }

    shutdown_signal().await;

    cluster.shutdown().await;
    info!("View coordinator shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
