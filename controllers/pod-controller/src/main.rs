//! Pod Controller
//!
//! Mirrors Pods into an indexed store (by namespace and by node name) and
//! reconciles every change through the controller core's work queue.
//!
//! Exposes `/healthz`, `/readyz` and `/metrics` on `PROBE_ADDR`.

mod config;
mod error;
mod probes;
mod reconciler;

use std::sync::Arc;

use anyhow::{Context, Result};
use controller_core::{
    Controller, Indexers, KubeSource, NAMESPACE_INDEX, QueueMetrics, Store, WorkQueue,
    namespace_index,
};
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::error::PodControllerError;
use crate::probes::ProbeState;
use crate::reconciler::{NODE_NAME_INDEX, PodReconciler, node_name_index};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // kube's rustls-tls needs a process-wide crypto provider
    let provider = rustls::crypto::ring::default_provider();
    if provider.install_default().is_err() {
        warn!("rustls crypto provider already installed");
    }

    info!("Starting Pod Controller");

    let config = Config::from_env().context("Failed to load configuration")?;
    info!("Configuration:");
    let namespace = config.namespace.as_deref().unwrap_or("all namespaces");
    info!("  Namespace: {}", namespace);
    info!("  Workers: {}", config.controller.workers);
    info!("  Max retries: {}", config.controller.max_retries);
    info!("  Resync period: {:?}", config.controller.resync_period);
    info!("  Probe address: {}", config.probe_addr);

    run(config).await.context("Pod Controller failed")?;
    info!("Pod Controller stopped");
    Ok(())
}

/// Builds the controller and probe server and runs both until shutdown.
async fn run(config: Config) -> Result<(), PodControllerError> {
    let client = Client::try_default().await?;
    let mut source = match config.namespace.as_deref() {
        Some(namespace) => KubeSource::<Pod>::namespaced(client, namespace),
        None => KubeSource::<Pod>::all(client),
    };
    if let Some(selector) = config.label_selector.as_deref() {
        source = source.labels(selector);
    }
    if let Some(selector) = config.field_selector.as_deref() {
        source = source.fields(selector);
    }

    let registry = Registry::new();
    let metrics = QueueMetrics::new(&config.controller.name)?;
    metrics.register(&registry)?;

    let store = Arc::new(Store::with_indexers(
        Indexers::new()
            .with_index(NAMESPACE_INDEX, namespace_index::<Pod>)
            .with_index(NODE_NAME_INDEX, node_name_index),
    ));
    let queue = WorkQueue::new(&config.controller.name, config.controller.backoff());
    let queue = Arc::new(queue.with_metrics(metrics));
    let reconciler = PodReconciler::new(Arc::clone(&store));
    let controller = Controller::new(source, store, queue, reconciler, config.controller)?;

    let shutdown = CancellationToken::new();
    let sync = controller.sync_handle();
    let probe_state = ProbeState::new(move || sync.has_synced(), registry);
    let serving = probes::serve(config.probe_addr, probe_state, shutdown.clone());
    let probe_server = tokio::spawn(serving);
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let result = controller.run(shutdown.clone()).await;
    shutdown.cancel();
    let probes = match probe_server.await {
        Ok(probes) => probes,
        Err(e) => {
            error!("Probe server task failed: {}", e);
            Ok(())
        }
    };

    result?;
    probes?;
    Ok(())
}

/// Cancels `shutdown` on Ctrl+C or SIGTERM.
async fn shutdown_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        }
        () = terminate => {}
    }
    info!("Shutdown signal received");
    shutdown.cancel();
}
