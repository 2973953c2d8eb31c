use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use flow_common::metrics::{serve, setup_metrics_routes};
use flow_common::sink::CsvSink;
use health::HealthRegistry;
use tokio::signal::unix::SignalKind;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use flow_consumer::config::{Config, LogFormat};
use flow_consumer::coordinator::FanInCoordinator;
use flow_consumer::delivery;
use flow_consumer::driver::PipelineDriver;
use flow_consumer::kafka::KafkaMessageLog;
use flow_consumer::worker::PartitionWorkerConfig;

fn setup_tracing(config: &Config) -> Result<()> {
    let stdout_layer = match config.log_format {
        LogFormat::Text => fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_filter(EnvFilter::from_default_env())
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(false)
            .with_filter(EnvFilter::from_default_env())
            .boxed(),
    };

    // Optional plain text copy of the log, appended across restarts
    let file_layer = match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {path}"))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(EnvFilter::from_default_env()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();
    Ok(())
}

fn start_server(config: &Config, liveness: HealthRegistry) -> Result<JoinHandle<()>> {
    let router = Router::new()
        .route("/", get(|| async { "flow feature consumer" }))
        .route("/_readiness", get(|| async { "ok" }))
        .route(
            "/_liveness",
            get(move || {
                let liveness = liveness.clone();
                async move {
                    let status = liveness.get_status();
                    if !status.healthy {
                        let unhealthy_components: Vec<String> = status
                            .components
                            .iter()
                            .filter(|(_, component_status)| !component_status.is_healthy())
                            .map(|(name, component_status)| format!("{name}: {component_status:?}"))
                            .collect();
                        error!(
                            "Health check FAILED - unhealthy partitions: [{}]",
                            unhealthy_components.join(", ")
                        );
                    }
                    status
                }
            }),
        );

    let router = if config.export_prometheus {
        setup_metrics_routes(router).context("Failed to install metrics recorder")?
    } else {
        router
    };

    let bind = config.bind_address.clone();
    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve health and metrics on {}: {}", bind, e);
        }
    }))
}

/// Close every partition on SIGINT or SIGTERM. The driver then stops on the
/// shutdown sentinel once the last worker is gone.
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<JoinHandle<()>> {
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;

    setup_tracing(&config)?;
    info!("Starting flow feature consumer");
    info!("Configuration loaded: {:?}", config);

    let liveness = HealthRegistry::new_with_strategy("liveness", config.health_strategy);
    let server_handle = start_server(&config, liveness.clone())?;
    info!("Started health and metrics server on {}", config.bind_address);

    let sink = CsvSink::open(&config.output_path)
        .with_context(|| format!("Failed to open output file {}", config.output_path))?;

    let log = KafkaMessageLog::new(&config);
    let (delivery_tx, delivery_rx) = delivery::channel(config.delivery_buffer_size);
    let worker_config = PartitionWorkerConfig::from_deadline(config.worker_liveness_deadline_ms.0);

    let coordinator = FanInCoordinator::start(
        &log,
        &config.kafka_topic,
        delivery_tx,
        &liveness,
        &worker_config,
    )
    .await
    .context("Failed to attach to the input topic")?;
    info!(
        topic = coordinator.topic(),
        partitions = coordinator.partitions().len(),
        "consuming from every partition"
    );

    let signals = spawn_signal_handler(coordinator.shutdown_token())?;

    let mut driver = PipelineDriver::new(delivery_rx, sink, config.decode_failure_policy)
        .with_sentinel(config.sentinel());
    let result = driver.run().await;

    // Workers blocked on a full delivery path are released by dropping the receiver
    drop(driver);
    let reports = coordinator.shutdown().await;
    for report in reports.iter().filter(|r| r.exit.is_failure()) {
        warn!(
            partition = %report.partition,
            exit = ?report.exit,
            "partition worker did not exit cleanly"
        );
    }

    signals.abort();
    server_handle.abort();

    let summary = result.context("Pipeline stopped on a fatal error")?;
    info!(
        records_written = summary.records_written,
        records_skipped = summary.records_skipped,
        stop_reason = ?summary.stop_reason,
        "pipeline stopped"
    );
    Ok(())
}
