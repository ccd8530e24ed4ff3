use anyhow::{Context, Result};
use roadscan_pipeline::ConsumerGroup;
use roadscan_storage::config::{Config, ServiceConfig};
use roadscan_storage::{CaptureWriter, PgCaptureStore, RegionResolver, VworldGeocoder};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service);

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting storage service"
    );

    config.validate().context("Invalid configuration")?;

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let store = Arc::new(
        PgCaptureStore::connect(&config.database)
            .await
            .context("Failed to initialize capture store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let regions = Arc::new(
        RegionResolver::from_records(
            store
                .load_regions()
                .await
                .context("Failed to load regions")?,
        )
        .context("Invalid region hierarchy")?,
    );
    info!(regions = regions.snapshot().len(), "Region tree loaded");

    let geocoder =
        VworldGeocoder::new(&config.geocoder).context("Failed to initialize geocoder")?;

    let writer = Arc::new(CaptureWriter::new(
        Arc::new(geocoder),
        regions.clone(),
        store.clone(),
        config.writer.image_base_url.clone(),
    ));

    let kafka = config.kafka.with_group_id(&config.writer.group_id);
    let group = ConsumerGroup::new(&kafka, &[config.kafka.topics.processed.as_str()])
        .context("Failed to start processed-event consumers")?;
    let handles = group.spawn(writer, &Handle::current());

    info!(members = group.len(), "Storage service started successfully");

    // Reload regions on SIGHUP until shutdown
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = reload_regions_on_hangup(store.clone(), regions.clone()) => {}
    }

    info!("Shutting down storage service");

    group.shutdown();
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            warn!(error = %e, "Consumer task ended abnormally");
        }
    }

    store.close().await;
    info!("Storage service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(config: &ServiceConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().pretty()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

#[cfg(unix)]
async fn reload_regions_on_hangup(store: Arc<PgCaptureStore>, regions: Arc<RegionResolver>) {
    let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGHUP handler, region reload disabled");
            return std::future::pending().await;
        }
    };

    while hangup.recv().await.is_some() {
        info!("Received SIGHUP, reloading regions");
        match store.load_regions().await {
            Ok(records) => {
                if let Err(e) = regions.reload(records) {
                    error!(error = %e, "Region reload rejected, keeping current tree");
                }
            }
            Err(e) => error!(error = %e, "Failed to read regions"),
        }
    }

    std::future::pending().await
}

#[cfg(not(unix))]
async fn reload_regions_on_hangup(_store: Arc<PgCaptureStore>, _regions: Arc<RegionResolver>) {
    std::future::pending().await
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
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
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
