use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use common_metrics::{MetricsSink, RecorderMetrics};
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{fmt, EnvFilter};

use consumer_engine::config::Config;
use consumer_engine::kafka::{KafkaConsumerFactory, KafkaGroupFactory, KafkaSettings};
use consumer_engine::{Batch, BatchProcessor, GroupComponent, Message, Processor, Supervisor};

/// Logs what it receives. Stands in for an application callback.
struct LoggingProcessor;

#[async_trait]
impl Processor for LoggingProcessor {
    async fn process(&self, message: &Message) -> anyhow::Result<()> {
        info!(
            correlation_id = message.context().correlation_id(),
            offset = message.context().offset(),
            bytes = message.payload().map_or(0, <[u8]>::len),
            "message received"
        );
        Ok(())
    }
}

#[async_trait]
impl BatchProcessor for LoggingProcessor {
    async fn process_batch(&self, batch: &Batch) -> anyhow::Result<()> {
        info!(
            partition = %batch.partition(),
            size = batch.len(),
            first_offset = batch.first_offset(),
            last_offset = batch.last_offset(),
            "batch received"
        );
        Ok(())
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    if json {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_with_defaults()
        .context("Failed to load configuration from environment variables")?;
    init_tracing(config.log_json);
    info!("Starting consumer engine");

    common_metrics::serve_prometheus(config.metrics_bind)
        .context("Failed to start prometheus exporter")?;
    let metrics: Arc<dyn MetricsSink> = Arc::new(RecorderMetrics);

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        on_signal.cancel();
    });

    let settings = KafkaSettings::from_config(&config.kafka, &config.consumer);
    let brokers = config.kafka.brokers();
    let topics = config.consumer.topics();
    let group = config.consumer.kafka_consumer_group.clone();

    match config.consume_since()? {
        Some(ago) => {
            let factory = KafkaConsumerFactory::new(&brokers, &group, topics, settings)
                .consume_since(ago, config.resolve_timeout()?, config.fetch_timeout()?)
                .with_metrics(metrics.clone());
            let supervisor = Supervisor::new(
                "consumer-engine",
                Arc::new(factory),
                Arc::new(LoggingProcessor),
                config.supervisor_options(metrics)?,
            )?;
            supervisor.run(shutdown).await?;
        }
        None => {
            let factory = KafkaGroupFactory::new(settings).with_metrics(metrics.clone());
            let component = GroupComponent::new(
                "consumer-engine",
                group,
                brokers,
                topics,
                Arc::new(LoggingProcessor),
                config.group_options(metrics, Some(Arc::new(factory)))?,
            )?;
            component.run(shutdown).await?;
        }
    }

    info!("Consumer engine stopped");
    Ok(())
}
