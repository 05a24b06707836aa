//! Queue worker process: Postgres-backed store, retention job and polling worker.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use jobqueue_infra::jobs::{
    CleanupConfig, CleanupJob, PostgresJobStore, QueueService, QueueWorker, QueueWorkerConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobqueue_observability::init();

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
    let cleanup = CleanupConfig::from_env().context("invalid cleanup configuration")?;
    let worker_config = QueueWorkerConfig::from_env().context("invalid worker configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = PostgresJobStore::new(pool)?;
    store.ensure_schema().await?;

    let service = QueueService::new(Arc::new(store));
    let cleanup_job = CleanupJob::install(&service, cleanup);

    if let Some(seeded) = tokio::task::spawn_blocking(move || cleanup_job.ensure_scheduled())
        .await
        .context("cleanup seeding task failed")??
    {
        tracing::info!(job_id = %seeded.id(), status = %seeded.status(), "cleanup job seeded");
    }

    let handle = QueueWorker::new(service)
        .spawn(worker_config)
        .context("failed to start worker thread")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    let stats = tokio::task::spawn_blocking(move || {
        let stats = handle.stats();
        handle.shutdown();
        stats
    })
    .await
    .context("worker shutdown task failed")?;
    tracing::info!(?stats, "worker stopped");

    Ok(())
}
