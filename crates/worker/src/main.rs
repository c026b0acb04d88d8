//! MuseStudio background worker
//!
//! Runs the one-time legacy profile drain at startup, then an hourly sweep
//! applying overdue monthly token resets.

mod legacy_import;
mod token_reset;

use redis::aio::ConnectionManager;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL is required"))?;
    let redis_url =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

    let pool = muse_shared::create_pool(&database_url).await?;
    let redis = ConnectionManager::new(redis::Client::open(redis_url)?).await?;

    // One-time drain; no-op once the legacy table is fully imported
    match legacy_import::run_legacy_import(&pool).await {
        Ok(0) => tracing::debug!("No legacy profiles pending import"),
        Ok(imported) => tracing::info!(imported = imported, "Legacy profile import complete"),
        Err(e) => tracing::error!(error = %e, "Legacy profile import failed; will retry next start"),
    }

    let scheduler = JobScheduler::new().await?;

    let reset_pool = pool.clone();
    let reset_redis = redis.clone();
    let reset_job = Job::new_async("0 0 * * * *", move |_id, _sched| {
        let pool = reset_pool.clone();
        let redis = reset_redis.clone();
        Box::pin(async move {
            token_reset::process_due_resets(&pool, &redis).await;
        })
    })?;
    scheduler.add(reset_job).await?;
    scheduler.start().await?;

    tracing::info!("Worker started; token reset sweep scheduled hourly");

    // Catch anything already overdue instead of waiting for the first tick
    token_reset::process_due_resets(&pool, &redis).await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Worker shutting down");
    Ok(())
}
