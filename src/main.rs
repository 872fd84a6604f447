//! Postback reverse-logistics reconciliation service.
//!
//! Main entry point. Loads configuration, connects to PostgreSQL, starts the
//! scheduled reconciliation jobs, and drains in-flight retries and callbacks
//! on shutdown.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use postback_core::storage::Storage;
use postback_reconcile::{
    client::CallbackClient,
    gateway::GatewayProvider,
    storage::{PostgresRequestStorage, RequestStorage},
    ReconcileEngine, Scheduler,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use crate::config::{Config, DEFAULT_LOG_FILTER};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log);

    info!("Starting postback reconciliation service");
    info!(
        database_url = %config.database_url_masked(),
        max_retries = config.max_retries,
        page_size = config.page_size,
        dispatcher_concurrency = config.dispatcher_concurrency,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    run_migrations(&db_pool).await?;
    info!("Database schema ready");

    let storage = Arc::new(Storage::new(db_pool.clone()));
    storage.health_check().await.context("Database health check failed")?;

    let request_storage: Arc<dyn RequestStorage> =
        Arc::new(PostgresRequestStorage::new(storage.clone()));
    let provider = GatewayProvider::new(config.to_gateway_config(), request_storage.clone())
        .context("Failed to build provider gateway client")?;
    let notifier =
        CallbackClient::new(config.to_client_config()).context("Failed to build callback client")?;

    let engine = ReconcileEngine::new(
        config.to_reconcile_config(),
        request_storage,
        Arc::new(provider),
        Arc::new(notifier),
    )
    .context("Failed to build reconciliation engine")?;

    let mut scheduler = Scheduler::new(Arc::new(engine), config.to_schedule_config())
        .context("Failed to build scheduler")?;
    scheduler.start();

    info!(
        poll_interval_seconds = config.poll_interval_seconds,
        reprocess_interval_seconds = config.reprocess_interval_seconds,
        follow_interval_seconds = config.follow_interval_seconds,
        "Postback is reconciling requests"
    );

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    if !scheduler.has_active_jobs() {
        warn!("Scheduled jobs had already stopped before shutdown");
    }

    if let Err(e) = scheduler.shutdown_graceful(config.shutdown_timeout()).await {
        error!(error = %e, "Graceful shutdown incomplete");
    }

    db_pool.close().await;
    info!("Database connections closed");

    info!("Postback shutdown complete");
    Ok(())
}

/// Initializes tracing with `RUST_LOG`-style directives.
fn init_tracing(directives: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter =
        EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Ensures the requests table and its polling indexes exist.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS requests (
            request_id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            postage_code TEXT NOT NULL DEFAULT '',
            tracking_code TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL DEFAULT 'created',
            retries INTEGER NOT NULL DEFAULT 0 CHECK (retries >= 0),
            callback TEXT NOT NULL,
            reason TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create requests table")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_requests_status_created
        ON requests(status, created_at, request_id)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create requests status index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_requests_postage_code
        ON requests(postage_code)
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create requests postage code index")?;

    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for CTRL+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
