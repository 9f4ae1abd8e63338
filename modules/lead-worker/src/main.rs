use anyhow::Context;
use event_bus::{
    ensure_streams, DeadLetterRouter, InMemoryBroker, JetStreamQueue, Queue, RedrivePolicy,
    SubscriptionConfig,
};
use event_consumer::{
    ConsumerLoop, ConsumerMetrics, InMemoryProcessedEvents, PgProcessedEvents, ProcessedEvents,
};
use prometheus::{Encoder, Registry, TextEncoder};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lead_worker::audit::{AuditLog, InMemoryAuditLog, PgAuditLog};
use lead_worker::build_registry;
use lead_worker::config::{BusType, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    init_tracing();

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    tracing::info!(
        bus_type = ?config.bus_type,
        consumer = %config.consumer_name,
        max_deliveries = config.max_deliveries,
        "Starting lead worker"
    );

    let (audit, ledger): (Arc<dyn AuditLog>, Arc<dyn ProcessedEvents>) = match &config.database_url {
        Some(database_url) => {
            tracing::info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(database_url)
                .await
                .context("Failed to connect to database")?;

            tracing::info!("Running migrations...");
            sqlx::migrate!("./db/migrations")
                .run(&pool)
                .await
                .context("Failed to run migrations")?;

            (
                Arc::new(PgAuditLog::new(pool.clone())),
                Arc::new(PgProcessedEvents::new(pool)),
            )
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory ledger and audit log");
            (
                Arc::new(InMemoryAuditLog::new()),
                Arc::new(InMemoryProcessedEvents::new()),
            )
        }
    };

    let registry = build_registry(audit, ledger, &config.consumer_name);
    let shutdown = CancellationToken::new();
    let mut router_task = None;

    let queue: Arc<dyn Queue> = match config.bus_type {
        BusType::InMemory => {
            tracing::info!("Using InMemory event bus");
            let broker = InMemoryBroker::new();
            Arc::new(
                broker.subscribe(
                    SubscriptionConfig::new(config.consumer_name.as_str())
                        .with_event_types(registry.event_types())
                        .with_visibility_timeout(config.visibility_timeout)
                        .with_redrive_policy(RedrivePolicy::new(config.max_deliveries)),
                ),
            )
        }
        BusType::Nats => {
            tracing::info!("Connecting to NATS at {}", config.nats_url);
            let client = async_nats::connect(&config.nats_url)
                .await
                .context("Failed to connect to NATS")?;

            let setup = config.stream_setup();
            ensure_streams(client.clone(), &setup).await?;

            let queue = JetStreamQueue::bind(
                client.clone(),
                &setup,
                &config.consumer_setup(registry.event_types()),
            )
            .await?;

            let router = DeadLetterRouter::new(client, setup, config.consumer_name.as_str());
            let token = shutdown.clone();
            router_task = Some(tokio::spawn(async move {
                if let Err(e) = router.run(token).await {
                    tracing::error!(error = %e, "Dead-letter router exited");
                }
            }));

            Arc::new(queue)
        }
    };

    let metrics_registry = Registry::new();
    let metrics = ConsumerMetrics::new(&metrics_registry).context("Failed to register metrics")?;
    let consumer = ConsumerLoop::new(queue, registry, config.consumer_config()).with_metrics(metrics);

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal_token.cancel();
    });

    let stats = consumer.run(shutdown.clone()).await;

    if let Some(task) = router_task {
        task.await.context("Dead-letter router task panicked")?;
    }

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metrics_registry.gather(), &mut buffer)
        .context("Failed to encode metrics")?;

    tracing::info!(
        polls = stats.polls,
        deleted = stats.deleted,
        left_for_redelivery = stats.left_for_redelivery,
        metrics = %String::from_utf8_lossy(&buffer),
        "Lead worker stopped"
    );

    Ok(())
}

/// `LOG_FORMAT=json` switches to JSON lines; `RUST_LOG` overrides the default `info`
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
