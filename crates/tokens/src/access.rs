//! Access Resolver
//!
//! Single source of truth for "is this identity premium and what tokens does
//! it have right now?". Sits on a short-TTL cache so a burst of gating checks
//! from one UI render costs one store read, and listens to a realtime change
//! feed so plan upgrades land within a second.
//!
//! Failure policy is fail-closed: any store error degrades the answer to a
//! free, zero-token status rather than surfacing an error or granting access.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use muse_shared::{AccessSource, AccessStatus, TierFlags};
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc, Mutex as AsyncMutex};
use uuid::Uuid;

use crate::error::TokenResult;
use crate::ledger;
use crate::store::{ensure_profile, ProfileStore};

/// Default TTL for cached access statuses. Deliberately short: the cache only
/// has to absorb same-render bursts, while staleness is bounded to about a
/// second even if the change feed drops an event.
const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(1);

/// Entry cap; overflow triggers an expired-entry sweep.
const CACHE_MAX_ENTRIES: usize = 50_000;

/// Broadcast buffer per watched identity.
const SUBSCRIPTION_BUFFER: usize = 16;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Change feed seam
// =============================================================================

/// Stream of "profile changed" notifications for one identity.
///
/// Events carry no payload. The resolver always re-reads the store on an
/// event, so a notification can never deliver stale field values.
pub struct ProfileWatch {
    pub events: mpsc::Receiver<()>,
}

/// Realtime source of profile-change notifications (Redis pub/sub in
/// production, an in-process channel in tests).
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn watch(&self, user_id: Uuid) -> TokenResult<ProfileWatch>;
}

// =============================================================================
// Cache
// =============================================================================

#[derive(Clone)]
struct CacheEntry {
    status: AccessStatus,
    expires_at: Instant,
}

impl CacheEntry {
    fn new(status: AccessStatus, ttl: Duration) -> Self {
        Self {
            status,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// Thread-safe per-identity access status cache.
pub struct AccessCache {
    cache: RwLock<HashMap<Uuid, CacheEntry>>,
    ttl: Duration,
}

impl Default for AccessCache {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_ACCESS_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Get the cached status for an identity, if present and unexpired.
    pub fn get(&self, user_id: Uuid) -> Option<AccessStatus> {
        let cache = self.cache.read().ok()?;
        let entry = cache.get(&user_id)?;

        if entry.is_expired() {
            None
        } else {
            Some(entry.status.clone())
        }
    }

    pub fn set(&self, user_id: Uuid, status: AccessStatus) {
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(user_id, CacheEntry::new(status, self.ttl));
            if cache.len() > CACHE_MAX_ENTRIES {
                cache.retain(|_, entry| !entry.is_expired());
            }
        }
    }

    pub fn invalidate(&self, user_id: Uuid) {
        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&user_id);
        }
    }

    /// Clear expired entries (call periodically for memory management)
    pub fn cleanup(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|_, entry| !entry.is_expired());
        }
    }

    pub fn stats(&self) -> CacheStats {
        if let Ok(cache) = self.cache.read() {
            let total = cache.len();
            let expired = cache.values().filter(|e| e.is_expired()).count();
            CacheStats {
                total_entries: total,
                expired_entries: expired,
                active_entries: total - expired,
            }
        } else {
            CacheStats::default()
        }
    }
}

#[derive(Default, Debug)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub active_entries: usize,
}

// =============================================================================
// Resolver
// =============================================================================

struct SubEntry {
    tx: broadcast::Sender<AccessStatus>,
    refs: usize,
    pump: tokio::task::JoinHandle<()>,
}

struct ResolverInner {
    store: Arc<dyn ProfileStore>,
    feed: Arc<dyn ChangeFeed>,
    cache: AccessCache,
    /// Per-identity single-flight locks: concurrent resolves for one identity
    /// share a single store read and return the identical snapshot.
    flights: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
    subs: Mutex<HashMap<Uuid, SubEntry>>,
}

/// Resolves, caches, and watches per-identity access status.
///
/// Cheap to clone; all clones share one cache and one subscription table.
#[derive(Clone)]
pub struct AccessResolver {
    inner: Arc<ResolverInner>,
}

impl AccessResolver {
    pub fn new(store: Arc<dyn ProfileStore>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self::with_cache(store, feed, AccessCache::new())
    }

    pub fn with_cache(
        store: Arc<dyn ProfileStore>,
        feed: Arc<dyn ChangeFeed>,
        cache: AccessCache,
    ) -> Self {
        Self {
            inner: Arc::new(ResolverInner {
                store,
                feed,
                cache,
                flights: Mutex::new(HashMap::new()),
                subs: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Resolve the current access status for an identity. Never fails; store
    /// errors degrade to the free fallback.
    pub async fn resolve(&self, user_id: Uuid) -> AccessStatus {
        self.inner.resolve(user_id).await
    }

    /// Drop any cached status so the next resolve re-reads the store.
    ///
    /// Called unconditionally after every deduction and on every change-feed
    /// event; invalidating an absent entry is a no-op.
    pub fn invalidate(&self, user_id: Uuid) {
        self.inner.cache.invalidate(user_id);
        tracing::debug!(user_id = %user_id, "Access cache invalidated");
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Number of identities with a live change-feed subscription.
    pub fn active_subscriptions(&self) -> usize {
        lock(&self.inner.subs).len()
    }

    /// Subscribe to access status updates for an identity.
    ///
    /// Subscribers for the same identity share one change-feed watch and one
    /// pump task; the watch is torn down when the last subscription drops.
    pub async fn subscribe(&self, user_id: Uuid) -> TokenResult<AccessSubscription> {
        {
            let mut subs = lock(&self.inner.subs);
            if let Some(entry) = subs.get_mut(&user_id) {
                entry.refs += 1;
                return Ok(AccessSubscription {
                    receiver: entry.tx.subscribe(),
                    _guard: SubGuard {
                        inner: Arc::downgrade(&self.inner),
                        user_id,
                    },
                });
            }
        }

        // First subscriber: open the watch outside the lock
        let watch = self.inner.feed.watch(user_id).await?;
        let (tx, rx) = broadcast::channel(SUBSCRIPTION_BUFFER);
        let pump = tokio::spawn(pump_events(
            Arc::downgrade(&self.inner),
            user_id,
            watch,
            tx.clone(),
        ));

        let mut subs = lock(&self.inner.subs);
        match subs.entry(user_id) {
            Entry::Occupied(mut occupied) => {
                // Lost the setup race; keep the winner's watch
                pump.abort();
                let entry = occupied.get_mut();
                entry.refs += 1;
                Ok(AccessSubscription {
                    receiver: entry.tx.subscribe(),
                    _guard: SubGuard {
                        inner: Arc::downgrade(&self.inner),
                        user_id,
                    },
                })
            }
            Entry::Vacant(vacant) => {
                vacant.insert(SubEntry { tx, refs: 1, pump });
                tracing::debug!(user_id = %user_id, "Opened profile change watch");
                Ok(AccessSubscription {
                    receiver: rx,
                    _guard: SubGuard {
                        inner: Arc::downgrade(&self.inner),
                        user_id,
                    },
                })
            }
        }
    }
}

impl ResolverInner {
    async fn resolve(self: &Arc<Self>, user_id: Uuid) -> AccessStatus {
        if let Some(status) = self.cache.get(user_id) {
            tracing::debug!(user_id = %user_id, "Access cache hit");
            return status;
        }

        let flight = self.flight(user_id);
        let status = {
            let _guard = flight.lock().await;

            // A concurrent resolve may have landed while we waited
            if let Some(status) = self.cache.get(user_id) {
                status
            } else {
                let status = self.compute(user_id).await;
                self.cache.set(user_id, status.clone());
                status
            }
        };
        self.release_flight(user_id, &flight);
        status
    }

    /// One uncached resolution: read (creating the profile if absent), apply
    /// an overdue monthly reset, derive premium from the plan, and silently
    /// repair disagreeing tier flags.
    async fn compute(&self, user_id: Uuid) -> AccessStatus {
        let now = OffsetDateTime::now_utc();

        let mut profile = match ensure_profile(self.store.as_ref(), user_id).await {
            Ok(profile) => profile,
            Err(err) => {
                tracing::error!(
                    user_id = %user_id,
                    error = %err,
                    "Profile read failed; serving free fallback"
                );
                return AccessStatus::free_fallback(user_id, now);
            }
        };

        // Lazy reset on the read path, fail-open: a reset failure serves the
        // stale balance rather than blocking the resolve
        if ledger::due_for_reset(&profile, now) {
            match self.store.apply_reset(&profile, now).await {
                Ok(updated) => profile = updated,
                Err(err) => {
                    tracing::warn!(
                        user_id = %user_id,
                        error = %err,
                        "Monthly reset failed during resolve; serving unreset balance"
                    );
                }
            }
        }

        let mut source = AccessSource::Fresh;
        if !profile.tier_flags().matches_plan(profile.plan) {
            // The plan column wins; the flags are rewritten in place. The
            // caller still gets the correct answer even if the write fails.
            tracing::warn!(
                user_id = %user_id,
                plan = %profile.plan,
                stored_tier = %profile.current_tier_flag,
                "Tier flags disagree with plan; repairing"
            );
            if let Err(err) = self
                .store
                .write_tier_flags(user_id, &TierFlags::for_plan(profile.plan))
                .await
            {
                tracing::warn!(user_id = %user_id, error = %err, "Tier flag repair write failed");
            }
            source = AccessSource::Repaired;
        }

        let balance = profile.balance();
        AccessStatus {
            user_id,
            is_premium: profile.is_premium(),
            paid_tokens: if profile.is_premium() { balance } else { 0 },
            total_tokens: balance,
            tier: profile.plan,
            source,
            computed_at: now,
        }
    }

    fn flight(&self, user_id: Uuid) -> Arc<AsyncMutex<()>> {
        let mut flights = lock(&self.flights);
        flights.entry(user_id).or_default().clone()
    }

    fn release_flight(&self, user_id: Uuid, flight: &Arc<AsyncMutex<()>>) {
        let mut flights = lock(&self.flights);
        // 2 = the map's copy plus ours; anything higher means a waiter exists
        if Arc::strong_count(flight) <= 2 {
            flights.remove(&user_id);
        }
    }
}

/// Forwards change-feed events into re-resolves and broadcasts the result.
/// Holds only a weak handle so a forgotten subscription cannot keep the
/// resolver alive.
async fn pump_events(
    inner: Weak<ResolverInner>,
    user_id: Uuid,
    mut watch: ProfileWatch,
    tx: broadcast::Sender<AccessStatus>,
) {
    while watch.events.recv().await.is_some() {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.cache.invalidate(user_id);
        let status = inner.resolve(user_id).await;
        // No receivers is fine; the next subscriber resolves fresh anyway
        let _ = tx.send(status);
    }
    tracing::debug!(user_id = %user_id, "Profile change watch closed");
}

/// Live stream of access status updates for one identity. Dropping it
/// releases the underlying watch once no other subscriber remains.
pub struct AccessSubscription {
    receiver: broadcast::Receiver<AccessStatus>,
    _guard: SubGuard,
}

impl AccessSubscription {
    /// Next status update, or `None` once the watch has closed. A slow
    /// consumer skips missed intermediate states and picks up at the newest.
    pub async fn recv(&mut self) -> Option<AccessStatus> {
        loop {
            match self.receiver.recv().await {
                Ok(status) => return Some(status),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct SubGuard {
    inner: Weak<ResolverInner>,
    user_id: Uuid,
}

impl Drop for SubGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut subs = lock(&inner.subs);
        if let Some(entry) = subs.get_mut(&self.user_id) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entry.pump.abort();
                subs.remove(&self.user_id);
                tracing::debug!(user_id = %self.user_id, "Released profile change watch");
            }
        }
    }
}
