use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use veil_pipeline::{
    BusConsumer, BusProducer, ImageClassifierStage, IntakeStage, RecorderStage,
    VideoClassifierStage,
};
use veil_worker::{
    supervise, PgAnalyticsStore, S3BlobStore, Stage, StageHandler, StageName,
    VideoIntelligenceAnnotator, VisionAnnotator, WorkerConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let stage: StageName = std::env::args()
        .nth(1)
        .context("usage: veil-worker <intake|image|video|recorder>")?
        .parse()?;

    // Load configuration
    let config = WorkerConfig::load().context("Failed to load configuration")?;
    config.validate_for(stage)?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        stage = %stage,
        "Starting Veil worker"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let pipeline = Arc::new(config.pipeline.clone());
    let producer = Arc::new(
        BusProducer::new(&config.kafka, pipeline.topics.clone())
            .context("Failed to initialize Kafka producer")?,
    );

    let group_id = format!("{}-{}", config.kafka.consumer.group_id, stage);
    let consumer = BusConsumer::new(&config.kafka, &group_id)
        .context("Failed to initialize Kafka consumer")?
        .with_dlq_producer(producer.clone());
    consumer
        .subscribe(&[stage.input_topic(&pipeline)])
        .context("Failed to subscribe to input topic")?;

    match stage {
        StageName::Intake => {
            let blob_store = Arc::new(blob_store(&config).await?);
            serve(consumer, IntakeStage::new(blob_store, producer, pipeline)).await
        }
        StageName::Image => {
            let annotator = Arc::new(VisionAnnotator::new(&config.annotation)?);
            let blob_store = Arc::new(blob_store(&config).await?);
            serve(
                consumer,
                ImageClassifierStage::new(annotator, blob_store, producer, pipeline),
            )
            .await
        }
        StageName::Video => {
            let annotator = Arc::new(VideoIntelligenceAnnotator::new(&config.annotation)?);
            let blob_store = Arc::new(blob_store(&config).await?);
            serve(
                consumer,
                VideoClassifierStage::new(annotator, blob_store, producer, pipeline),
            )
            .await
        }
        StageName::Recorder => {
            let database = config
                .database
                .as_ref()
                .context("database configuration is required for the recorder stage")?;

            let store = PgAnalyticsStore::new(database)
                .await
                .context("Failed to initialize analytics store")?;

            // Run migrations if enabled
            if database.run_migrations {
                store
                    .run_migrations()
                    .await
                    .context("Failed to run database migrations")?;
            }

            serve(consumer, RecorderStage::new(Arc::new(store))).await
        }
    }
}

async fn blob_store(config: &WorkerConfig) -> Result<S3BlobStore> {
    S3BlobStore::new(&config.storage)
        .await
        .context("Failed to initialize blob store")
}

/// Consume until a shutdown signal arrives or the consumer gives up
async fn serve<S: Stage>(consumer: BusConsumer, stage: S) -> Result<()> {
    let handler = Arc::new(StageHandler::new(stage));
    let stop = consumer.shutdown_handle();

    let consumer_handle = tokio::spawn(async move { consumer.run(handler).await });

    info!("Worker started successfully");

    supervise(consumer_handle, stop, shutdown_signal()).await
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
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
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
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
