// Flowline server
//
// Serves the HTTP API, runs the worker pool that executes steps and the
// sweeper that releases timers and fires schedules. Without DATABASE_URL
// everything runs against the in-memory store (dev mode).

use std::sync::Arc;

use anyhow::{Context, Result};
use flowline_engine::behavior::register_builtins;
use flowline_engine::records::InMemoryRecordStore;
use flowline_engine::{
    BehaviorRegistry, CreditLedger, Engine, InMemoryCreditLedger, InMemoryWorkflowStore,
    PostgresCreditLedger, PostgresWorkflowStore, Sweeper, WorkerPool, WorkflowStore,
};
use flowline_server::telemetry::{init_telemetry, TelemetryConfig};
use flowline_server::{router, AppState, ServerConfig};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    init_telemetry(&TelemetryConfig::from_env()).context("Failed to initialize telemetry")?;

    let config = ServerConfig::from_env();
    tracing::info!(
        worker_id = %config.worker_id,
        max_concurrent_steps = config.max_concurrent_steps,
        "flowline-server starting"
    );

    let (store, ledger) = open_store(&config).await?;

    let mut behaviors = BehaviorRegistry::new();
    register_builtins(&mut behaviors, Arc::new(InMemoryRecordStore::new()));
    tracing::info!(behaviors = ?behaviors.names(), "behaviors registered");

    let engine = Engine::builder(store)
        .behaviors(behaviors)
        .ledger(ledger)
        .executor_config(config.executor_config())
        .build();

    let pool = WorkerPool::new(&engine, config.pool_config());
    pool.start().context("Failed to start worker pool")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = Sweeper::new(engine.clone(), config.sweeper_config()).spawn(shutdown_rx);

    if !config.api_prefix.is_empty() {
        tracing::info!(prefix = %config.api_prefix, "API prefix configured");
    }
    let app = router(AppState::new(engine), &config.api_prefix);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
    tracing::info!("HTTP server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("HTTP server stopped, draining workers");
    let _ = shutdown_tx.send(true);
    pool.shutdown().await.context("Worker pool shutdown failed")?;
    sweeper.await.context("Sweeper task panicked")?;

    tracing::info!("flowline-server stopped");
    Ok(())
}

/// PostgreSQL when DATABASE_URL is set, in-memory otherwise
async fn open_store(
    config: &ServerConfig,
) -> Result<(Arc<dyn WorkflowStore>, Arc<dyn CreditLedger>)> {
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_concurrent_steps as u32 + 5)
                .connect(url)
                .await
                .context("Failed to connect to database")?;
            flowline_engine::persistence::migrate(&pool)
                .await
                .context("Failed to run migrations")?;
            tracing::info!("Connected to database, migrations applied");

            Ok((
                Arc::new(PostgresWorkflowStore::new(pool.clone())),
                Arc::new(PostgresCreditLedger::new(pool)),
            ))
        }
        None => {
            tracing::warn!(
                default_org_credits = config.default_org_credits,
                "DATABASE_URL not set, using in-memory store (state is lost on restart)"
            );
            Ok((
                Arc::new(InMemoryWorkflowStore::new()),
                Arc::new(InMemoryCreditLedger::with_default_balance(
                    config.default_org_credits,
                )),
            ))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
