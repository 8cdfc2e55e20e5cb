//! VPA updater - applies resource recommendations to running pods
//!
//! Runs as a single Deployment per cluster. Every interval it evicts or
//! resizes pods whose requests drifted from their VPA recommendation.

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use updater_lib::{
    cluster::{
        KubeControllerFetcher, KubeEventSink, KubePodDisruptor, KubePodLister,
        KubeSelectorFetcher, KubeVpaLister, LeaseStatusValidator,
    },
    health::{components, HealthRegistry},
    observability::StructuredLogger,
    restriction::ReplicaGroupRestrictionFactory,
    target::CachedControllerFetcher,
    Updater, UpdaterLoop,
};

mod api;
mod config;

const UPDATER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting vpa-updater");

    let config = config::AppConfig::load()?;
    info!(
        interval_secs = config.updater_interval_secs,
        in_place_or_recreate = config.updater.in_place_or_recreate_enabled,
        "Updater configured"
    );

    let client = kube::Client::try_default().await?;

    let health_registry = HealthRegistry::new();
    health_registry.register(components::UPDATER_LOOP).await;
    health_registry.register(components::STATUS_GATE).await;

    let logger = StructuredLogger::new("vpa-updater");
    logger.log_startup(UPDATER_VERSION, config.updater_interval());

    let restrictions = ReplicaGroupRestrictionFactory::new(
        config.replica_group(),
        Arc::new(KubePodDisruptor::new(client.clone())),
    );

    let controller_fetcher = CachedControllerFetcher::new(
        Arc::new(KubeControllerFetcher::new(client.clone())),
        config.controller_cache_ttl(),
    );
    let (event_sink, events_handle) = KubeEventSink::spawn(client.clone(), "vpa-updater");

    let updater = Updater::builder()
        .config(config.updater.clone())
        .vpa_lister(Arc::new(KubeVpaLister::new(client.clone())))
        .pod_lister(Arc::new(KubePodLister::new(client.clone())))
        .selector_fetcher(Arc::new(KubeSelectorFetcher::new(client.clone())))
        .controller_fetcher(Arc::new(controller_fetcher))
        .status_validator(Arc::new(LeaseStatusValidator::new(
            client.clone(),
            config.admission_controller_namespace.clone(),
            config.admission_controller_lease.clone(),
        )))
        .restriction_factory(Arc::new(restrictions))
        .event_sink(Arc::new(event_sink))
        .build()?;

    let app_state = Arc::new(api::AppState::new(health_registry.clone()));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let shutdown = CancellationToken::new();
    let updater_loop = UpdaterLoop::new(
        Arc::new(updater),
        config.updater_interval(),
        health_registry,
    );
    let loop_handle = tokio::spawn(updater_loop.run(shutdown.clone()));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    shutdown.cancel();

    loop_handle.await?;
    api_handle.abort();
    events_handle.abort();
    info!("Shutting down");

    Ok(())
}
