//! One-time legacy store drain
//!
//! Copies every not-yet-imported row from the legacy profile snapshot into
//! the canonical store. Runs at worker startup and is idempotent: imported
//! rows are stamped, the profile insert tolerates an existing row, and a
//! crash mid-batch simply re-runs.
//!
//! Legacy balances are honored as-is, including ones above the standard
//! grant (migrated power users). The tier flags are copied verbatim even if
//! they disagree with the plan; the access resolver repairs them on first
//! resolve.

use muse_shared::Plan;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

const BATCH_SIZE: i64 = 100;

#[derive(sqlx::FromRow)]
struct LegacyRow {
    user_id: Uuid,
    plan: String,
    tokens_balance: i64,
    is_premium: bool,
    current_tier: String,
}

/// Drain pending legacy rows; returns the number imported.
pub async fn run_legacy_import(pool: &PgPool) -> anyhow::Result<u64> {
    let mut total = 0u64;

    loop {
        let mut tx = pool.begin().await?;

        let rows: Vec<LegacyRow> = sqlx::query_as(
            r#"
            SELECT user_id, plan, tokens_balance, is_premium, current_tier
            FROM legacy_profiles
            WHERE imported_at IS NULL
            ORDER BY user_id
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(BATCH_SIZE)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.commit().await?;
            break;
        }

        let batch = rows.len();
        let now = OffsetDateTime::now_utc();

        for row in rows {
            // Unknown legacy plan strings land on free rather than aborting
            // the whole drain
            let plan: Plan = row.plan.parse().unwrap_or_default();

            sqlx::query(
                r#"
                INSERT INTO profiles (
                    id, plan, tokens_limit, tokens_used,
                    is_premium_flag, is_paid_flag, current_tier_flag,
                    last_token_reset_at, migrated_from_legacy
                ) VALUES ($1, $2, $3, 0, $4, $4, $5, $6, TRUE)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(row.user_id)
            .bind(plan)
            .bind(row.tokens_balance)
            .bind(row.is_premium)
            .bind(&row.current_tier)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query("UPDATE legacy_profiles SET imported_at = NOW() WHERE user_id = $1")
                .bind(row.user_id)
                .execute(&mut *tx)
                .await?;

            total += 1;
        }

        tx.commit().await?;
        tracing::info!(batch = batch, total = total, "Imported legacy profile batch");
    }

    Ok(total)
}
