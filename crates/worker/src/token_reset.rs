//! Monthly token reset sweep
//!
//! The resolver already applies an overdue reset lazily when a user shows up;
//! this sweep catches the accounts that never do, so balances are correct the
//! moment a dormant user returns. Batches are claimed with `FOR UPDATE SKIP
//! LOCKED` so concurrent worker instances never double-scan, and each write
//! still carries the `last_token_reset_at` compare-and-swap guard, so racing
//! with a lazy reset loses cleanly.

use muse_api::realtime::publish_profile_changed;
use muse_shared::UserProfile;
use muse_tokens::ledger;
use redis::aio::ConnectionManager;
use sqlx::PgPool;
use time::OffsetDateTime;
use tracing::{error, info};
use uuid::Uuid;

const BATCH_SIZE: i64 = 100;

/// Reset every overdue profile, draining batch by batch until the backlog is
/// empty. Returns the ids that were reset.
pub async fn process_due_resets(pool: &PgPool, redis: &ConnectionManager) -> Vec<Uuid> {
    let mut reset_ids = Vec::new();

    loop {
        let (claimed, mut batch) = sweep_batch(pool).await;
        let progressed = !batch.is_empty();
        reset_ids.append(&mut batch);

        // A short claim means the backlog is drained; a full claim with zero
        // resets means every row is erroring, so stop rather than spin on it
        if claimed < BATCH_SIZE as usize || !progressed {
            break;
        }
    }

    if !reset_ids.is_empty() {
        info!(count = reset_ids.len(), "Monthly token reset sweep complete");
    }

    // Publish after commit so open tabs re-read the new state, not the old
    for user_id in &reset_ids {
        publish_profile_changed(redis, *user_id).await;
    }

    reset_ids
}

/// Claim and reset one batch. Returns how many rows were claimed and the ids
/// actually reset.
async fn sweep_batch(pool: &PgPool) -> (usize, Vec<Uuid>) {
    let now = OffsetDateTime::now_utc();
    let cutoff = now - ledger::RESET_INTERVAL;

    let mut tx = match pool.begin().await {
        Ok(tx) => tx,
        Err(e) => {
            error!(error = %e, "Failed to begin reset sweep transaction");
            return (0, Vec::new());
        }
    };

    let due: Vec<UserProfile> = match sqlx::query_as(
        r#"
        SELECT * FROM profiles
        WHERE last_token_reset_at <= $1
        ORDER BY last_token_reset_at ASC
        LIMIT $2
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(cutoff)
    .bind(BATCH_SIZE)
    .fetch_all(&mut *tx)
    .await
    {
        Ok(profiles) => profiles,
        Err(e) => {
            error!(error = %e, "Failed to fetch profiles due for reset");
            return (0, Vec::new());
        }
    };

    if due.is_empty() {
        return (0, Vec::new());
    }

    let claimed = due.len();
    let mut reset_ids = Vec::with_capacity(claimed);
    for profile in due {
        let reset = ledger::apply_reset(profile.clone(), now);
        let result = sqlx::query(
            r#"
            UPDATE profiles
            SET tokens_used = $1, tokens_limit = $2, last_token_reset_at = $3, updated_at = NOW()
            WHERE id = $4 AND last_token_reset_at = $5
            "#,
        )
        .bind(reset.tokens_used)
        .bind(reset.tokens_limit)
        .bind(reset.last_token_reset_at)
        .bind(profile.id)
        .bind(profile.last_token_reset_at)
        .execute(&mut *tx)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => reset_ids.push(profile.id),
            // Lost the CAS to a lazy reset on the read path; nothing to do
            Ok(_) => {}
            Err(e) => {
                error!(user_id = %profile.id, error = %e, "Failed to reset profile");
            }
        }
    }

    if let Err(e) = tx.commit().await {
        error!(error = %e, "Failed to commit reset sweep batch");
        return (claimed, Vec::new());
    }

    (claimed, reset_ids)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use time::Duration;

    #[tokio::test]
    #[ignore] // Requires database and redis
    async fn test_sweep_drains_backlog_larger_than_one_batch() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
        let pool = muse_shared::create_pool(&url).await.expect("pool");
        let redis = ConnectionManager::new(redis::Client::open(redis_url).expect("client"))
            .await
            .expect("redis");

        let overdue = OffsetDateTime::now_utc() - ledger::RESET_INTERVAL - Duration::days(1);
        let seeded = BATCH_SIZE as usize + 5;
        let mut ids = Vec::with_capacity(seeded);
        for _ in 0..seeded {
            let id = Uuid::new_v4();
            sqlx::query(
                r#"
                INSERT INTO profiles (
                    id, plan, tokens_limit, tokens_used,
                    is_premium_flag, is_paid_flag, current_tier_flag,
                    last_token_reset_at
                ) VALUES ($1, 'free', 100000, 99000, FALSE, FALSE, 'free', $2)
                "#,
            )
            .bind(id)
            .bind(overdue)
            .execute(&pool)
            .await
            .expect("seed profile");
            ids.push(id);
        }

        // One call clears the whole backlog, not just the first batch
        let reset = process_due_resets(&pool, &redis).await;
        for id in &ids {
            assert!(reset.contains(id));
        }

        let second = process_due_resets(&pool, &redis).await;
        for id in &ids {
            assert!(!second.contains(id));
        }
    }
}
