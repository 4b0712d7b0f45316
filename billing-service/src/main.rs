mod handler;
mod records;

use anyhow::{Context, Result};
use db_pool::DbConfig;
use handler::BillingHandler;
use kafka_pipeline::{ConsumerBuilder, KafkaConfig};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE_NAME: &str = "billing-service";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,billing_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting {}", SERVICE_NAME);

    let db_config = DbConfig::from_env(SERVICE_NAME)
        .map_err(anyhow::Error::msg)
        .context("invalid database configuration")?;
    let pool = db_pool::create_pool(&db_config)
        .await
        .context("failed to create database pool")?;

    let kafka_config = KafkaConfig::from_env(SERVICE_NAME);
    tracing::info!(
        brokers = %kafka_config.brokers,
        topic = %kafka_config.topic,
        group_id = %kafka_config.group_id,
        "Kafka configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let handler = Arc::new(BillingHandler::new(pool));
    let mut consumer = ConsumerBuilder::new(kafka_config, handler)
        .shutdown(shutdown_rx)
        .build()
        .context("failed to build kafka consumer")?;

    consumer
        .run()
        .await
        .context("consumer terminated with error")?;

    tracing::info!("{} stopped", SERVICE_NAME);
    Ok(())
}
