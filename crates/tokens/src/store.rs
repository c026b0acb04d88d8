//! Profile Store Adapter
//!
//! One canonical Postgres store behind a trait seam. The historical dual-store
//! situation is not carried into the hot path: legacy rows are drained by the
//! worker's one-time batch import, after which every read and write lands here.
//!
//! Deductions are atomic SQL increments journaled under an idempotency key, so
//! two concurrent completions for one user are both billed (no lost update)
//! and a retried request is billed once.

use async_trait::async_trait;
use muse_shared::{Plan, TierFlags, UserProfile};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{TokenError, TokenResult};
use crate::ledger;

/// Result of applying a deduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeductionOutcome {
    /// False when the request_id was already journaled (retry); nothing was
    /// incremented and `balance` reflects the earlier deduction.
    pub applied: bool,
    /// Tokens charged by this request (0 for duplicates).
    pub tokens: u64,
    /// Remaining balance after the deduction, floored at zero.
    pub balance: u64,
    /// Whether usage now exceeds the limit. A signal, not an error.
    pub overdrawn: bool,
}

/// Storage seam for user profiles.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Fetch a profile. `None` means not found, recovered by creation rather
    /// than surfaced to callers as an error.
    async fn get_profile(&self, user_id: Uuid) -> TokenResult<Option<UserProfile>>;

    /// Create a free-plan profile with the given initial grant. Safe under
    /// concurrent first sign-ins: the insert tolerates an existing row and the
    /// surviving profile is returned.
    async fn create_profile(&self, user_id: Uuid, grant: u64) -> TokenResult<UserProfile>;

    /// Number of existing profiles; the signup ordinal for grant sizing.
    async fn count_profiles(&self) -> TokenResult<u64>;

    /// Atomically add to `tokens_used`, journaled under `request_id` so
    /// retries apply once.
    async fn add_tokens_used(
        &self,
        user_id: Uuid,
        request_id: Uuid,
        tokens: u64,
        provider_cost_usd: f64,
    ) -> TokenResult<DeductionOutcome>;

    /// Repair write: overwrite the secondary tier flags.
    async fn write_tier_flags(&self, user_id: Uuid, flags: &TierFlags) -> TokenResult<()>;

    /// Plan change from the billing path.
    async fn set_plan(&self, user_id: Uuid, plan: Plan) -> TokenResult<()>;

    /// Apply the monthly reset with a compare-and-swap on
    /// `last_token_reset_at`; a lost race re-reads instead of overwriting.
    async fn apply_reset(&self, profile: &UserProfile, now: OffsetDateTime)
        -> TokenResult<UserProfile>;
}

/// Get-or-create a profile for an identity.
///
/// The signup ordinal is a plain count of existing profiles; concurrent
/// signups near the early-adopter boundary may each observe a count below the
/// threshold and all receive the larger grant. That at-least-once looseness is
/// the accepted behavior; it is not serialized away with a lock.
pub async fn ensure_profile(store: &dyn ProfileStore, user_id: Uuid) -> TokenResult<UserProfile> {
    if let Some(profile) = store.get_profile(user_id).await? {
        return Ok(profile);
    }

    let ordinal = store.count_profiles().await?;
    let grant = ledger::initial_grant(ordinal);
    tracing::info!(
        user_id = %user_id,
        signup_ordinal = ordinal,
        grant = grant,
        "Creating profile at first sign-in"
    );
    store.create_profile(user_id, grant).await
}

/// Bill a completed provider job against a profile.
///
/// Called only after the provider reports success; a failed or cancelled job
/// never reaches this path, so nothing is ever "un-deducted". Overdrafts are
/// logged and proceed, since the provider call already happened.
pub async fn deduct_for_completion(
    store: &dyn ProfileStore,
    user_id: Uuid,
    request_id: Uuid,
    provider_cost_usd: f64,
) -> TokenResult<DeductionOutcome> {
    let tokens = ledger::cost_for_completion(provider_cost_usd);
    ensure_profile(store, user_id).await?;

    let outcome = store
        .add_tokens_used(user_id, request_id, tokens, provider_cost_usd)
        .await?;

    if !outcome.applied {
        tracing::info!(
            user_id = %user_id,
            request_id = %request_id,
            "Duplicate deduction request ignored"
        );
    }
    if outcome.overdrawn {
        tracing::warn!(
            user_id = %user_id,
            request_id = %request_id,
            tokens = outcome.tokens,
            "Deduction overdrew balance; usage already incurred, billing recorded"
        );
    }

    Ok(outcome)
}

/// Postgres-backed profile store.
#[derive(Clone)]
pub struct PgProfileStore {
    pool: PgPool,
}

impl PgProfileStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileStore for PgProfileStore {
    async fn get_profile(&self, user_id: Uuid) -> TokenResult<Option<UserProfile>> {
        let profile: Option<UserProfile> =
            sqlx::query_as("SELECT * FROM profiles WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(profile)
    }

    async fn create_profile(&self, user_id: Uuid, grant: u64) -> TokenResult<UserProfile> {
        sqlx::query(
            r#"
            INSERT INTO profiles (
                id, plan, tokens_limit, tokens_used,
                is_premium_flag, is_paid_flag, current_tier_flag,
                last_token_reset_at, migrated_from_legacy
            ) VALUES (
                $1, $2, $3, 0, FALSE, FALSE, $4, NOW(), FALSE
            )
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(Plan::Free)
        .bind(grant as i64)
        .bind(Plan::Free.to_string())
        .execute(&self.pool)
        .await?;

        // Re-read regardless of whether this call won the insert race
        self.get_profile(user_id)
            .await?
            .ok_or_else(|| TokenError::ProfileNotFound(user_id.to_string()))
    }

    async fn count_profiles(&self) -> TokenResult<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM profiles")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn add_tokens_used(
        &self,
        user_id: Uuid,
        request_id: Uuid,
        tokens: u64,
        provider_cost_usd: f64,
    ) -> TokenResult<DeductionOutcome> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO token_deductions (request_id, user_id, tokens, provider_cost_usd)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(request_id)
        .bind(user_id)
        .bind(tokens as i64)
        .bind(provider_cost_usd)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        let (tokens_limit, tokens_used): (i64, i64) = if inserted {
            // Atomic increment: concurrent completions must both be billed
            sqlx::query_as(
                r#"
                UPDATE profiles
                SET tokens_used = tokens_used + $1, updated_at = NOW()
                WHERE id = $2
                RETURNING tokens_limit, tokens_used
                "#,
            )
            .bind(tokens as i64)
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| TokenError::ProfileNotFound(user_id.to_string()))?
        } else {
            sqlx::query_as("SELECT tokens_limit, tokens_used FROM profiles WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| TokenError::ProfileNotFound(user_id.to_string()))?
        };

        tx.commit().await?;

        Ok(DeductionOutcome {
            applied: inserted,
            tokens: if inserted { tokens } else { 0 },
            balance: tokens_limit.saturating_sub(tokens_used).max(0) as u64,
            overdrawn: tokens_used > tokens_limit,
        })
    }

    async fn write_tier_flags(&self, user_id: Uuid, flags: &TierFlags) -> TokenResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE profiles
            SET is_premium_flag = $1, is_paid_flag = $2, current_tier_flag = $3, updated_at = NOW()
            WHERE id = $4
            "#,
        )
        .bind(flags.is_premium)
        .bind(flags.is_paid)
        .bind(&flags.current_tier)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TokenError::ProfileNotFound(user_id.to_string()));
        }
        Ok(())
    }

    async fn set_plan(&self, user_id: Uuid, plan: Plan) -> TokenResult<()> {
        let result = sqlx::query("UPDATE profiles SET plan = $1, updated_at = NOW() WHERE id = $2")
            .bind(plan)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(TokenError::ProfileNotFound(user_id.to_string()));
        }
        Ok(())
    }

    async fn apply_reset(
        &self,
        profile: &UserProfile,
        now: OffsetDateTime,
    ) -> TokenResult<UserProfile> {
        let reset = ledger::apply_reset(profile.clone(), now);

        let updated: Option<UserProfile> = sqlx::query_as(
            r#"
            UPDATE profiles
            SET tokens_used = $1, tokens_limit = $2, last_token_reset_at = $3, updated_at = NOW()
            WHERE id = $4 AND last_token_reset_at = $5
            RETURNING *
            "#,
        )
        .bind(reset.tokens_used)
        .bind(reset.tokens_limit)
        .bind(reset.last_token_reset_at)
        .bind(profile.id)
        .bind(profile.last_token_reset_at)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(p) => Ok(p),
            // Lost the CAS to a concurrent reset; the winner's row stands
            None => self
                .get_profile(profile.id)
                .await?
                .ok_or_else(|| TokenError::ProfileNotFound(profile.id.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod testing {
    //! In-memory ProfileStore for resolver and provisioning tests.

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemStore {
        pub profiles: Mutex<HashMap<Uuid, UserProfile>>,
        pub deductions: Mutex<HashSet<Uuid>>,
        pub fail_reads: AtomicBool,
        pub flag_writes: AtomicUsize,
    }

    impl MemStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, profile: UserProfile) {
            self.profiles
                .lock()
                .unwrap()
                .insert(profile.id, profile);
        }

        pub fn set_fail_reads(&self, fail: bool) {
            self.fail_reads.store(fail, Ordering::SeqCst);
        }

        pub fn make_profile(plan: Plan, limit: i64, used: i64) -> UserProfile {
            let now = OffsetDateTime::now_utc();
            UserProfile {
                id: Uuid::new_v4(),
                plan,
                tokens_limit: limit,
                tokens_used: used,
                is_premium_flag: plan.is_premium(),
                is_paid_flag: plan.is_premium(),
                current_tier_flag: plan.to_string(),
                last_token_reset_at: now,
                migrated_from_legacy: false,
                created_at: now,
                updated_at: now,
            }
        }
    }

    #[async_trait]
    impl ProfileStore for MemStore {
        async fn get_profile(&self, user_id: Uuid) -> TokenResult<Option<UserProfile>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(TokenError::StoreRead("simulated read failure".into()));
            }
            Ok(self.profiles.lock().unwrap().get(&user_id).cloned())
        }

        async fn create_profile(&self, user_id: Uuid, grant: u64) -> TokenResult<UserProfile> {
            let mut profiles = self.profiles.lock().unwrap();
            let profile = profiles.entry(user_id).or_insert_with(|| {
                let mut p = Self::make_profile(Plan::Free, grant as i64, 0);
                p.id = user_id;
                p
            });
            Ok(profile.clone())
        }

        async fn count_profiles(&self) -> TokenResult<u64> {
            Ok(self.profiles.lock().unwrap().len() as u64)
        }

        async fn add_tokens_used(
            &self,
            user_id: Uuid,
            request_id: Uuid,
            tokens: u64,
            _provider_cost_usd: f64,
        ) -> TokenResult<DeductionOutcome> {
            let applied = self.deductions.lock().unwrap().insert(request_id);
            let mut profiles = self.profiles.lock().unwrap();
            let profile = profiles
                .get_mut(&user_id)
                .ok_or_else(|| TokenError::ProfileNotFound(user_id.to_string()))?;
            if applied {
                profile.tokens_used = profile.tokens_used.saturating_add(tokens as i64);
            }
            Ok(DeductionOutcome {
                applied,
                tokens: if applied { tokens } else { 0 },
                balance: profile.balance(),
                overdrawn: profile.tokens_used > profile.tokens_limit,
            })
        }

        async fn write_tier_flags(&self, user_id: Uuid, flags: &TierFlags) -> TokenResult<()> {
            self.flag_writes.fetch_add(1, Ordering::SeqCst);
            let mut profiles = self.profiles.lock().unwrap();
            let profile = profiles
                .get_mut(&user_id)
                .ok_or_else(|| TokenError::ProfileNotFound(user_id.to_string()))?;
            profile.is_premium_flag = flags.is_premium;
            profile.is_paid_flag = flags.is_paid;
            profile.current_tier_flag = flags.current_tier.clone();
            Ok(())
        }

        async fn set_plan(&self, user_id: Uuid, plan: Plan) -> TokenResult<()> {
            let mut profiles = self.profiles.lock().unwrap();
            let profile = profiles
                .get_mut(&user_id)
                .ok_or_else(|| TokenError::ProfileNotFound(user_id.to_string()))?;
            profile.plan = plan;
            Ok(())
        }

        async fn apply_reset(
            &self,
            profile: &UserProfile,
            now: OffsetDateTime,
        ) -> TokenResult<UserProfile> {
            let mut profiles = self.profiles.lock().unwrap();
            let stored = profiles
                .get_mut(&profile.id)
                .ok_or_else(|| TokenError::ProfileNotFound(profile.id.to_string()))?;
            if stored.last_token_reset_at == profile.last_token_reset_at {
                *stored = ledger::apply_reset(stored.clone(), now);
            }
            Ok(stored.clone())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::testing::MemStore;
    use super::*;

    #[tokio::test]
    async fn test_ensure_profile_creates_with_grant() {
        let store = MemStore::new();
        let user_id = Uuid::new_v4();

        let profile = ensure_profile(&store, user_id).await.unwrap();
        // First account: early-adopter grant
        assert_eq!(profile.tokens_limit, 300_000);
        assert_eq!(profile.plan, Plan::Free);
    }

    #[tokio::test]
    async fn test_ensure_profile_is_idempotent() {
        let store = MemStore::new();
        let user_id = Uuid::new_v4();

        let first = ensure_profile(&store, user_id).await.unwrap();
        let second = ensure_profile(&store, user_id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.count_profiles().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_migrated_profile_keeps_legacy_balance() {
        let store = MemStore::new();
        // A migrated power user already exists with a balance above the
        // standard grant; first sign-in must not re-grant anything.
        let mut migrated = MemStore::make_profile(Plan::Free, 512_000, 0);
        migrated.migrated_from_legacy = true;
        let user_id = migrated.id;
        store.insert(migrated);

        let profile = ensure_profile(&store, user_id).await.unwrap();
        assert_eq!(profile.tokens_limit, 512_000);
        assert!(profile.migrated_from_legacy);
    }

    #[tokio::test]
    async fn test_deduction_is_idempotent_under_retry() {
        let store = MemStore::new();
        let profile = MemStore::make_profile(Plan::Pro, 100_000, 0);
        let user_id = profile.id;
        store.insert(profile);

        let request_id = Uuid::new_v4();
        let first = deduct_for_completion(&store, user_id, request_id, 0.01)
            .await
            .unwrap();
        assert!(first.applied);
        assert_eq!(first.tokens, 20_000);
        assert_eq!(first.balance, 80_000);

        // Same request retried: no double-debit, same balance reported
        let retry = deduct_for_completion(&store, user_id, request_id, 0.01)
            .await
            .unwrap();
        assert!(!retry.applied);
        assert_eq!(retry.tokens, 0);
        assert_eq!(retry.balance, 80_000);
    }

    #[tokio::test]
    async fn test_deduction_overdraft_proceeds() {
        let store = MemStore::new();
        let profile = MemStore::make_profile(Plan::Free, 1_000, 900);
        let user_id = profile.id;
        store.insert(profile);

        let outcome = deduct_for_completion(&store, user_id, Uuid::new_v4(), 0.001)
            .await
            .unwrap();
        // 0.001 USD -> 2_000 tokens; usage already happened so it is recorded
        assert!(outcome.applied);
        assert!(outcome.overdrawn);
        assert_eq!(outcome.balance, 0);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_pg_store_roundtrip() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = muse_shared::create_pool(&url).await.expect("pool");
        let store = PgProfileStore::new(pool);

        let user_id = Uuid::new_v4();
        let created = ensure_profile(&store, user_id).await.expect("create");
        assert_eq!(created.id, user_id);

        let outcome = store
            .add_tokens_used(user_id, Uuid::new_v4(), 10, 0.000005)
            .await
            .expect("deduct");
        assert!(outcome.applied);
    }
}
