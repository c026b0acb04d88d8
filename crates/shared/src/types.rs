//! Common types used across MuseStudio

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// Subscription plan as set by the billing system.
///
/// The plan is the *sole* source of truth for premium entitlement: a free user
/// sitting on millions of promotional tokens is still not premium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
    Enterprise,
}

impl Default for Plan {
    fn default() -> Self {
        Self::Free
    }
}

impl Plan {
    /// Whether this plan grants premium-gated capabilities.
    pub fn is_premium(&self) -> bool {
        matches!(self, Self::Pro | Self::Enterprise)
    }

    /// Whether this plan's token balance rolls over across the monthly window.
    /// Free balances are replaced by the standard grant; paid balances carry.
    pub fn balance_rolls_over(&self) -> bool {
        self.is_premium()
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Pro => write!(f, "pro"),
            Self::Enterprise => write!(f, "enterprise"),
        }
    }
}

impl std::str::FromStr for Plan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            _ => Err(format!("Invalid plan: {}", s)),
        }
    }
}

/// The generation medium (or plain chat) a user message is requesting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    Chat,
    Image,
    Video,
    Music,
    Voice,
    Slides,
    Code,
}

impl IntentKind {
    /// Whether this kind dispatches a generation job (everything but chat).
    pub fn is_generation(&self) -> bool {
        !matches!(self, Self::Chat)
    }
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chat => write!(f, "chat"),
            Self::Image => write!(f, "image"),
            Self::Video => write!(f, "video"),
            Self::Music => write!(f, "music"),
            Self::Voice => write!(f, "voice"),
            Self::Slides => write!(f, "slides"),
            Self::Code => write!(f, "code"),
        }
    }
}

// =============================================================================
// Tier Flags
// =============================================================================

/// Secondary entitlement flags that historically lived in a separate store.
///
/// Kept consistent with [`Plan`] by the access resolver's repair routine; a
/// disagreement is a `ReconciliationConflict`, recovered silently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierFlags {
    pub is_premium: bool,
    pub is_paid: bool,
    pub current_tier: String,
}

impl TierFlags {
    /// The flags a given plan should carry.
    pub fn for_plan(plan: Plan) -> Self {
        Self {
            is_premium: plan.is_premium(),
            is_paid: plan.is_premium(),
            current_tier: plan.to_string(),
        }
    }

    /// Whether these flags agree with the canonical plan field.
    pub fn matches_plan(&self, plan: Plan) -> bool {
        *self == Self::for_plan(plan)
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// User profile: one per identity, created at first sign-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct UserProfile {
    pub id: Uuid,
    pub plan: Plan,
    pub tokens_limit: i64,
    pub tokens_used: i64,
    // Secondary tier-flag columns (see TierFlags)
    pub is_premium_flag: bool,
    pub is_paid_flag: bool,
    pub current_tier_flag: String,
    pub last_token_reset_at: OffsetDateTime,
    /// Set by the legacy-store batch import; migrated profiles never collect
    /// the early-adopter grant a second time.
    pub migrated_from_legacy: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl UserProfile {
    /// Remaining token balance, floored at zero.
    ///
    /// `tokens_used` may internally exceed `tokens_limit` (overdrafts are
    /// accepted, not rejected), but a negative balance never reaches callers.
    pub fn balance(&self) -> u64 {
        self.tokens_limit.saturating_sub(self.tokens_used).max(0) as u64
    }

    /// Premium entitlement, derived from the plan alone.
    pub fn is_premium(&self) -> bool {
        self.plan.is_premium()
    }

    /// The secondary flags as currently stored.
    pub fn tier_flags(&self) -> TierFlags {
        TierFlags {
            is_premium: self.is_premium_flag,
            is_paid: self.is_paid_flag,
            current_tier: self.current_tier_flag.clone(),
        }
    }
}

// =============================================================================
// Derived Types (not persisted)
// =============================================================================

/// Which path produced an [`AccessStatus`].
///
/// Cache hits return the computed snapshot unchanged (so concurrent
/// resolutions within one TTL window are identical); hits are traced rather
/// than recorded here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessSource {
    /// Computed from a fresh profile read.
    Fresh,
    /// Fresh read that also repaired disagreeing tier flags.
    Repaired,
    /// A store failure degraded this to a free, non-premium status.
    FreeFallback,
}

impl std::fmt::Display for AccessSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Repaired => write!(f, "repaired"),
            Self::FreeFallback => write!(f, "free_fallback"),
        }
    }
}

/// Snapshot answer to "is this identity entitled to premium right now?"
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessStatus {
    pub user_id: Uuid,
    pub is_premium: bool,
    /// Balance attributable to a paid plan; zero for free users regardless of
    /// promotional tokens.
    pub paid_tokens: u64,
    /// Total remaining balance.
    pub total_tokens: u64,
    pub tier: Plan,
    pub source: AccessSource,
    pub computed_at: OffsetDateTime,
}

impl AccessStatus {
    /// The safe status served when a store read fails: gating fails closed.
    pub fn free_fallback(user_id: Uuid, computed_at: OffsetDateTime) -> Self {
        Self {
            user_id,
            is_premium: false,
            paid_tokens: 0,
            total_tokens: 0,
            tier: Plan::Free,
            source: AccessSource::FreeFallback,
            computed_at,
        }
    }
}

/// Classifier output for a single user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    /// 1.0 for a keyword-exact (verb + noun) match, 0.6 for an ambiguous
    /// noun-only match, 1.0 for the chat default.
    pub confidence: f64,
    pub reasoning: String,
}

/// What to do with a classified intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingAction {
    ExecuteInline,
    ConfirmWithUser,
    FallbackChat,
}

/// Routing decision handed back to the chat UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub action: RoutingAction,
    pub target_kind: IntentKind,
    pub requires_new_project: bool,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

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
    fn test_plan_default() {
        assert_eq!(Plan::default(), Plan::Free);
    }

    #[test]
    fn test_plan_premium() {
        assert!(!Plan::Free.is_premium());
        assert!(Plan::Pro.is_premium());
        assert!(Plan::Enterprise.is_premium());
    }

    #[test]
    fn test_plan_display_and_parse() {
        assert_eq!(format!("{}", Plan::Pro), "pro");
        assert_eq!("FREE".parse::<Plan>().unwrap(), Plan::Free);
        assert_eq!("Enterprise".parse::<Plan>().unwrap(), Plan::Enterprise);
        assert!("gold".parse::<Plan>().is_err());
    }

    #[test]
    fn test_balance_floors_at_zero() {
        assert_eq!(profile(Plan::Free, 100_000, 40_000).balance(), 60_000);
        assert_eq!(profile(Plan::Free, 100_000, 100_000).balance(), 0);
        // Overdrawn internally, but never rendered negative
        assert_eq!(profile(Plan::Free, 100_000, 150_000).balance(), 0);
    }

    #[test]
    fn test_tokens_never_grant_premium() {
        // A free user with a huge promotional balance is still not premium
        let rich_free = profile(Plan::Free, 5_000_000, 0);
        assert!(!rich_free.is_premium());

        let broke_pro = profile(Plan::Pro, 100_000, 100_000);
        assert!(broke_pro.is_premium());
    }

    #[test]
    fn test_tier_flags_for_plan() {
        let flags = TierFlags::for_plan(Plan::Pro);
        assert!(flags.is_premium);
        assert!(flags.is_paid);
        assert_eq!(flags.current_tier, "pro");
        assert!(flags.matches_plan(Plan::Pro));
        assert!(!flags.matches_plan(Plan::Free));
    }

    #[test]
    fn test_tier_flags_disagreement_detected() {
        let stale = TierFlags {
            is_premium: false,
            is_paid: false,
            current_tier: "free".to_string(),
        };
        assert!(!stale.matches_plan(Plan::Pro));
    }

    #[test]
    fn test_intent_kind_generation() {
        assert!(!IntentKind::Chat.is_generation());
        assert!(IntentKind::Image.is_generation());
        assert!(IntentKind::Slides.is_generation());
    }

    #[test]
    fn test_free_fallback_status() {
        let now = OffsetDateTime::now_utc();
        let id = Uuid::new_v4();
        let status = AccessStatus::free_fallback(id, now);
        assert!(!status.is_premium);
        assert_eq!(status.total_tokens, 0);
        assert_eq!(status.tier, Plan::Free);
        assert_eq!(status.source, AccessSource::FreeFallback);
    }
}
