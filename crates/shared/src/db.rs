//! Database utilities and connection management

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::{str::FromStr, time::Duration};

/// Default pool size per instance.
///
/// Reads are absorbed by the resolver's cache and single-flight, and every
/// write path (deduction, plan change, reset batch) is a short transaction,
/// so a handful of connections covers an instance. Sized so one api plus one
/// worker instance fit a 25-connection managed-Postgres default with room for
/// psql sessions.
const DEFAULT_MAX_CONNECTIONS: u32 = 8;

/// Create a database connection pool
/// Note: Disables statement cache for PgBouncer compatibility
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    // PgBouncer in transaction mode doesn't support prepared statements
    let options = PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);

    PgPoolOptions::new()
        .max_connections(pool_size(std::env::var("DATABASE_MAX_CONNECTIONS").ok()))
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .connect_with(options)
        .await
}

/// Pool size from `DATABASE_MAX_CONNECTIONS`; unset or unparseable values
/// fall back to the default rather than failing startup.
fn pool_size(raw: Option<String>) -> u32 {
    raw.and_then(|v| v.parse().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_MAX_CONNECTIONS)
}

/// Run database migrations. Called at startup before the server accepts
/// traffic, so the pool is otherwise idle.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await
}
