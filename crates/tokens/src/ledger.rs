//! Token Ledger
//!
//! Pure accounting logic: initial grants by signup order, USD-to-token cost
//! conversion, deductions, and the rolling monthly reset window. No I/O;
//! everything here is deterministic and testable with plain values.

use muse_shared::UserProfile;
use time::{Duration, OffsetDateTime};

/// Number of accounts (by signup order) that receive the early-adopter grant.
pub const EARLY_ADOPTER_SEATS: u64 = 106;

/// One-time allocation for the first [`EARLY_ADOPTER_SEATS`] accounts.
pub const EARLY_ADOPTER_GRANT: u64 = 300_000;

/// Standard allocation for every later account, and the balance a free plan
/// resets to each month.
pub const STANDARD_GRANT: u64 = 100_000;

/// Markup applied to the provider's reported USD cost.
pub const COST_MARKUP: f64 = 2.0;

/// Exchange rate: one token is one micro-dollar.
pub const USD_PER_TOKEN: f64 = 1e-6;

/// Rolling reset window for free-plan balances.
pub const RESET_INTERVAL: Duration = Duration::days(30);

/// Initial token allocation for a new profile.
///
/// `signup_ordinal` is the count of profiles existing at creation time. The
/// count is inherently racy under concurrent signups near the seat boundary;
/// at-least-once semantics are accepted (a handful of extra accounts may land
/// the larger grant) rather than serializing all signups through a lock.
pub fn initial_grant(signup_ordinal: u64) -> u64 {
    if signup_ordinal < EARLY_ADOPTER_SEATS {
        EARLY_ADOPTER_GRANT
    } else {
        STANDARD_GRANT
    }
}

/// Convert a provider's reported USD cost into tokens to bill.
///
/// Applies the markup, converts at the fixed exchange rate, and rounds *up*,
/// never down, to avoid under-billing. Non-positive costs bill nothing.
pub fn cost_for_completion(provider_cost_usd: f64) -> u64 {
    if provider_cost_usd <= 0.0 || !provider_cost_usd.is_finite() {
        return 0;
    }
    (provider_cost_usd * COST_MARKUP / USD_PER_TOKEN).ceil() as u64
}

/// Apply a deduction to a profile.
///
/// Never rejects on overdraft: the service call already happened, so the usage
/// is recorded and the balance floors at zero on read. Callers log the
/// overdraft warning (it is a signal, not an error).
pub fn deduct(mut profile: UserProfile, tokens: u64) -> UserProfile {
    profile.tokens_used = profile.tokens_used.saturating_add(tokens as i64);
    profile
}

/// Whether a deduction of `tokens` would leave the profile overdrawn.
pub fn would_overdraw(profile: &UserProfile, tokens: u64) -> bool {
    profile.balance() < tokens
}

/// Whether the profile's monthly window has elapsed.
pub fn due_for_reset(profile: &UserProfile, now: OffsetDateTime) -> bool {
    now - profile.last_token_reset_at >= RESET_INTERVAL
}

/// Apply the monthly rollover.
///
/// Free plans reset to the standard grant; unused balance does NOT roll over
/// (intentional product behavior). Paid plans keep their balance untouched and
/// only advance the window. `last_token_reset_at` never moves backward.
pub fn apply_reset(mut profile: UserProfile, now: OffsetDateTime) -> UserProfile {
    if now <= profile.last_token_reset_at {
        return profile;
    }
    if !profile.plan.balance_rolls_over() {
        profile.tokens_used = 0;
        profile.tokens_limit = STANDARD_GRANT as i64;
    }
    profile.last_token_reset_at = now;
    profile
}

#[cfg(test)]
mod tests {
    use super::*;
    use muse_shared::Plan;
    use uuid::Uuid;

    fn profile(plan: Plan, limit: i64, used: i64) -> UserProfile {
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

    #[test]
    fn test_initial_grant_boundary() {
        // Exact boundary values: 105 is the last early-adopter seat
        assert_eq!(initial_grant(0), 300_000);
        assert_eq!(initial_grant(105), 300_000);
        assert_eq!(initial_grant(106), 100_000);
        assert_eq!(initial_grant(107), 100_000);
        assert_eq!(initial_grant(1_000_000), 100_000);
    }

    #[test]
    fn test_cost_rounds_up() {
        // $0.0123 * 2 / 1e-6 = 24_600 exactly
        assert_eq!(cost_for_completion(0.0123), 24_600);
        // One tenth of a micro-dollar still bills a whole token
        assert_eq!(cost_for_completion(1e-7 / 2.0), 1);
        // $0.01 * 2e6 = 20_000
        assert_eq!(cost_for_completion(0.01), 20_000);
    }

    #[test]
    fn test_cost_never_under_bills() {
        // ceil may over-bill by one token under float error, never under-bill
        let tokens = cost_for_completion(0.0000015);
        assert!(tokens >= 3);
    }

    #[test]
    fn test_cost_non_positive() {
        assert_eq!(cost_for_completion(0.0), 0);
        assert_eq!(cost_for_completion(-1.0), 0);
        assert_eq!(cost_for_completion(f64::NAN), 0);
    }

    #[test]
    fn test_deduct_allows_overdraft() {
        let p = profile(Plan::Free, 100, 90);
        assert!(would_overdraw(&p, 50));
        let p = deduct(p, 50);
        assert_eq!(p.tokens_used, 140);
        // Balance still floors at zero on read
        assert_eq!(p.balance(), 0);
    }

    #[test]
    fn test_deduct_read_is_stable() {
        // Repeated reads after a deduction return the same value (no drift)
        let p = deduct(profile(Plan::Free, 100_000, 0), 1_234);
        assert_eq!(p.balance(), 98_766);
        assert_eq!(p.balance(), 98_766);
    }

    #[test]
    fn test_due_for_reset_window() {
        let mut p = profile(Plan::Free, 100_000, 50_000);
        let now = OffsetDateTime::now_utc();

        p.last_token_reset_at = now - Duration::days(29);
        assert!(!due_for_reset(&p, now));

        p.last_token_reset_at = now - Duration::days(30);
        assert!(due_for_reset(&p, now));

        p.last_token_reset_at = now - Duration::days(45);
        assert!(due_for_reset(&p, now));
    }

    #[test]
    fn test_reset_free_plan_does_not_roll_over() {
        let now = OffsetDateTime::now_utc();
        let mut p = profile(Plan::Free, 300_000, 20_000);
        p.last_token_reset_at = now - Duration::days(31);

        let p = apply_reset(p, now);
        // Unused early-adopter balance is replaced, not carried
        assert_eq!(p.tokens_used, 0);
        assert_eq!(p.tokens_limit, STANDARD_GRANT as i64);
        assert_eq!(p.last_token_reset_at, now);
    }

    #[test]
    fn test_reset_paid_plan_rolls_over() {
        let now = OffsetDateTime::now_utc();
        let mut p = profile(Plan::Pro, 500_000, 123_456);
        p.last_token_reset_at = now - Duration::days(31);

        let p = apply_reset(p, now);
        assert_eq!(p.tokens_used, 123_456);
        assert_eq!(p.tokens_limit, 500_000);
        assert_eq!(p.last_token_reset_at, now);
    }

    #[test]
    fn test_reset_timestamp_monotonic() {
        let now = OffsetDateTime::now_utc();
        let p = profile(Plan::Free, 100_000, 10_000);
        let reset_at = p.last_token_reset_at;

        // A reset "to the past" is a no-op; the timestamp never moves backward
        let p = apply_reset(p, now - Duration::days(1));
        assert_eq!(p.last_token_reset_at, reset_at);
        assert_eq!(p.tokens_used, 10_000);
    }

    #[test]
    fn test_repeated_reset_checks_are_noops() {
        let now = OffsetDateTime::now_utc();
        let mut p = profile(Plan::Free, 100_000, 60_000);
        p.last_token_reset_at = now - Duration::days(31);

        let p = apply_reset(p, now);
        // Within the fresh window, nothing is due
        assert!(!due_for_reset(&p, now));
        assert!(!due_for_reset(&p, now + Duration::days(29)));
        assert!(due_for_reset(&p, now + Duration::days(30)));
    }
}
