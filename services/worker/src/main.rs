//! Camfleet worker binary.
//!
//! Runs one analysis request against its cameras and exits when every camera
//! task has finished.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with CAMFLEET__)
//!
//! The request file can also be given as the first command line argument,
//! which takes precedence over `job.request_file`.

use anyhow::{bail, Context};
use camfleet_worker::config::{LoggingConfig, StorageConfig, WorkerConfig};
use camfleet_worker::{
    AnalysisRequest, AnalyzerRegistry, Dispatcher, HttpCameraConnector, LocalResultStore,
    S3ResultStore, SinkProvider,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let mut config = load_config()?;
    if let Some(path) = std::env::args().nth(1) {
        config.job.request_file = path;
    }

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "camfleet-worker",
        version = env!("CARGO_PKG_VERSION"),
        request_file = %config.job.request_file,
        "Starting camera analysis worker"
    );

    config.validate()?;

    if config.metrics.enabled {
        init_metrics(config.metrics.port)?;
    }

    let request = AnalysisRequest::from_file(&config.job.request_file)
        .with_context(|| format!("Failed to load request {}", config.job.request_file))?
        .shard(config.job.shard_index, config.job.shard_count);

    let registry = AnalyzerRegistry::with_builtins();
    if !registry.contains(&request.analysis_class) {
        bail!(
            "Unknown analyzer '{}', available: {}",
            request.analysis_class,
            registry.names().join(", ")
        );
    }

    info!(
        submission_id = %request.submission_id,
        analyzer = %request.analysis_class,
        cameras = request.cameras.len(),
        shard_index = config.job.shard_index,
        shard_count = config.job.shard_count,
        "Request loaded"
    );

    let sinks = open_result_store(&config.storage, &config.job.username, &request.submission_id)
        .await
        .context("Failed to initialize result store")?;

    let dispatcher = Dispatcher::new(
        Arc::new(registry),
        Arc::new(HttpCameraConnector::new(config.camera.clone())),
        sinks,
        &config.dispatcher,
        config.sampling.clone(),
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C, cancelling camera tasks");
                    cancel.cancel();
                }
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
            }
        }
    });

    let summary = dispatcher.run(&request, cancel).await;

    if summary.all_failed() {
        error!(failed = summary.failed, "Every camera task failed");
        bail!("all {} camera tasks failed", summary.failed);
    }

    info!("Worker finished");
    Ok(())
}

/// Load configuration from files, falling back to the environment.
fn load_config() -> anyhow::Result<WorkerConfig> {
    let config = WorkerConfig::load().or_else(|e| {
        eprintln!("Failed to load config from files ({}), trying environment", e);
        WorkerConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("camfleet_worker={}", level).parse()?)
        .add_directive("aws_config=warn".parse()?)
        .add_directive("aws_smithy_runtime=warn".parse()?)
        .add_directive("hyper=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Build the result store selected by `storage.backend`.
async fn open_result_store(
    config: &StorageConfig,
    username: &str,
    submission_id: &str,
) -> anyhow::Result<Arc<dyn SinkProvider>> {
    match config.backend.as_str() {
        "local" => {
            info!(root = %config.local_root.display(), "Writing results to local directory");
            Ok(Arc::new(LocalResultStore::new(
                &config.local_root,
                username,
                submission_id,
            )))
        }
        "s3" => {
            let s3 = config
                .s3
                .as_ref()
                .context("storage.s3 is required for the s3 backend")?;
            Ok(Arc::new(
                S3ResultStore::new(s3, username, submission_id).await,
            ))
        }
        other => bail!("Unknown storage backend '{}'", other),
    }
}
