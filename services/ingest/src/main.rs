//! Roadscan ingest service
//!
//! Runs the upload intake HTTP server on a current-thread runtime and the
//! presign stage consumers on a separate multi-thread runtime.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/ingest, config/ingest.{env}, /etc/roadscan/ingest)
//! 2. Environment variables (prefixed with INGEST__)

use anyhow::{Context, Result};
use roadscan_ingest::api::{create_router, serve};
use roadscan_ingest::config::{IngestConfig, ServiceConfig};
use roadscan_ingest::{ImageBuffer, PresignHandler, S3Gateway, UploadIntake};
use roadscan_pipeline::{CaptureProducer, ConsumerGroup};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle};
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    let config = IngestConfig::load().context("Failed to load configuration")?;

    init_logging(&config.service)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting ingest service"
    );

    config.validate()?;

    let presign_runtime = Builder::new_multi_thread()
        .worker_threads(config.presign.worker_threads)
        .thread_name("presign-worker")
        .enable_all()
        .build()
        .context("Failed to build presign runtime")?;

    {
        let _guard = presign_runtime.enter();
        init_metrics(config.service.metrics_port)?;
    }

    let intake_runtime = Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build intake runtime")?;

    let result = intake_runtime.block_on(run(config, presign_runtime.handle().clone()));

    presign_runtime.shutdown_timeout(Duration::from_secs(10));

    match result {
        Ok(()) => info!("Ingest service stopped"),
        Err(ref e) => error!(error = %e, "Ingest service failed"),
    }
    result
}

/// Wire up intake and the presign stage, then serve until shutdown.
async fn run(config: IngestConfig, presign_runtime: Handle) -> Result<()> {
    let producer = Arc::new(
        CaptureProducer::new(config.kafka.clone()).context("Failed to create Kafka producer")?,
    );

    let buffer = ImageBuffer::new(&config.buffer.dir, config.http.max_upload_bytes);
    buffer
        .ensure_dir()
        .await
        .context("Failed to prepare image buffer directory")?;

    let intake = Arc::new(UploadIntake::new(
        buffer,
        producer.clone(),
        config.kafka.topics.raw.clone(),
    ));

    let presign = if config.presign.enabled {
        let s3 = config.s3.clone();
        let gateway = presign_runtime
            .spawn(async move { S3Gateway::connect(&s3).await })
            .await
            .context("Presign runtime stopped during startup")?
            .context("Failed to initialize S3 gateway")?;

        let handler = Arc::new(PresignHandler::new(
            Arc::new(gateway),
            producer.clone(),
            config.kafka.topics.presigned.clone(),
        ));

        let kafka = config.kafka.with_group_id(&config.presign.group_id);
        let group = ConsumerGroup::new(&kafka, &[config.kafka.topics.raw.as_str()])
            .context("Failed to start presign consumers")?;
        let handles = group.spawn(handler, &presign_runtime);

        info!(members = group.len(), "Presign stage started");
        Some((group, handles))
    } else {
        warn!("Presign stage disabled");
        None
    };

    let router = create_router(intake, config.http.max_upload_bytes);
    let addr = config.listen_addr()?;

    serve(router, addr, shutdown_signal()).await?;

    info!("Shutting down ingest service");

    if let Some((group, handles)) = presign {
        group.shutdown();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Presign consumer task ended abnormally");
            }
        }
    }

    if let Err(e) = producer.flush(Duration::from_secs(5)) {
        warn!(error = %e, "Failed to flush producer");
    }

    Ok(())
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &ServiceConfig) -> Result<()> {
    let level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("roadscan_ingest={}", level).parse()?)
        .add_directive(format!("roadscan_pipeline={}", level).parse()?)
        .add_directive("aws_smithy_runtime=warn".parse()?)
        .add_directive("rdkafka=info".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.log_format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
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
