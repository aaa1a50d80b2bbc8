//! Courier webhook delivery service.
//!
//! Loads configuration, connects to PostgreSQL, bootstraps the schema and
//! runs the delivery engine until CTRL+C or SIGTERM.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{
    storage::{Storage, MIGRATOR},
    Clock, RealClock,
};
use courier_delivery::{queue::PostgresJobQueue, storage::PostgresDeliveryStorage, DeliveryEngine};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!(
        database_url = %config.database_url_masked(),
        worker_pool_size = config.worker_pool_size,
        delivery_timeout_seconds = config.delivery_timeout_seconds,
        max_delivery_attempts = config.max_delivery_attempts,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    run_migrations(&db_pool).await?;
    info!("database schema ready");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let delivery_config = config.to_delivery_config();
    let storage = Arc::new(Storage::new(db_pool.clone(), clock.clone()));
    storage.health_check().await.context("database health check failed")?;

    let mut engine = DeliveryEngine::new(
        Arc::new(PostgresDeliveryStorage::new(storage.clone())),
        Arc::new(PostgresJobQueue::new(storage, delivery_config.lease_duration)),
        delivery_config,
        clock,
    )
    .context("failed to create delivery engine")?;

    engine.start().await.context("failed to start delivery engine")?;
    info!("courier is delivering webhooks");

    shutdown_signal().await;
    info!("shutdown signal received, waiting for in-flight deliveries");

    let stats = engine.stats().await;
    info!(
        processed = stats.processed,
        succeeded = stats.succeeded,
        retried = stats.retried,
        exhausted = stats.exhausted,
        stopped = stats.stopped,
        leases_lost = stats.leases_lost,
        in_flight = stats.in_flight,
        "delivery totals at shutdown"
    );

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "delivery engine did not shut down cleanly");
    }

    db_pool.close().await;
    info!("courier shutdown complete");
    Ok(())
}

/// Installs the fmt subscriber. `RUST_LOG` wins over the configured filter.
fn init_tracing(fallback_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback_filter))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to install tracing subscriber")
}

/// Connects to PostgreSQL, retrying while the database comes up.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(config.database_idle_timeout))
            .max_lifetime(Duration::from_secs(config.database_max_lifetime))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => return Ok(pool),
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Applies pending schema migrations.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    MIGRATOR.run(pool).await.context("failed to run database migrations")
}

/// Waits for CTRL+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL+C"),
        () = terminate => info!("received SIGTERM"),
    }
}
