//! Shared application state

use std::sync::Arc;
use std::time::Duration;

use muse_intent::Classifier;
use muse_tokens::{AccessCache, AccessResolver, PgProfileStore};
use redis::aio::ConnectionManager;
use sqlx::PgPool;

use crate::auth::JwtVerifier;
use crate::config::Config;
use crate::realtime::RedisChangeFeed;

/// Shared state for all handlers. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub jwt: Arc<JwtVerifier>,
    pub store: Arc<PgProfileStore>,
    pub resolver: AccessResolver,
    pub classifier: Arc<Classifier>,
    /// Multiplexed Redis connection for publishing change triggers.
    pub redis: ConnectionManager,
}

impl AppState {
    pub async fn new(config: Config, pool: PgPool) -> anyhow::Result<Self> {
        let redis_client = redis::Client::open(config.redis_url.clone())?;
        let redis = ConnectionManager::new(redis_client.clone()).await?;

        let store = Arc::new(PgProfileStore::new(pool.clone()));
        let feed = Arc::new(RedisChangeFeed::new(redis_client));
        let resolver = AccessResolver::with_cache(
            store.clone(),
            feed,
            AccessCache::with_ttl(Duration::from_millis(config.access_cache_ttl_ms)),
        );

        Ok(Self {
            jwt: Arc::new(JwtVerifier::new(&config.jwt_secret)),
            classifier: Arc::new(Classifier::new()?),
            config: Arc::new(config),
            pool,
            store,
            resolver,
            redis,
        })
    }
}
