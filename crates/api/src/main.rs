//! MuseStudio API server

use muse_api::{routes::create_router, AppState, Config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let config = Config::from_env()?;

    let pool = muse_shared::create_pool(&config.database_url).await?;
    muse_shared::run_migrations(&pool).await?;

    let bind_address = config.bind_address.clone();
    let state = AppState::new(config, pool).await?;
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "API server listening");
    axum::serve(listener, router).await?;

    Ok(())
}
