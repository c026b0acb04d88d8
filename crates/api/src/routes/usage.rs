//! Usage billing endpoint

use axum::{extract::State, Json};
use muse_tokens::deduct_for_completion;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::{ApiError, ApiResult};
use crate::realtime::publish_profile_changed;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DeductRequest {
    /// Idempotency key for this completion; retries with the same id are
    /// billed once.
    pub request_id: Uuid,
    /// Provider-reported cost of the completed job.
    pub provider_cost_usd: f64,
}

#[derive(Debug, Serialize)]
pub struct DeductResponse {
    pub applied: bool,
    pub tokens_charged: u64,
    pub balance: u64,
    pub overdrawn: bool,
}

/// Bill a completed generation or paid-model completion.
///
/// Called by the chat UI only after the provider reports success; failed jobs
/// never reach this endpoint. The cache invalidation happens before the
/// response is sent, so a resolve issued by the same tab right after this call
/// returns cannot see the pre-deduction balance.
pub async fn deduct(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<DeductRequest>,
) -> ApiResult<Json<DeductResponse>> {
    if !req.provider_cost_usd.is_finite() || req.provider_cost_usd < 0.0 {
        return Err(ApiError::Validation(
            "provider_cost_usd must be a non-negative finite number".to_string(),
        ));
    }

    let outcome = deduct_for_completion(
        state.store.as_ref(),
        identity.user_id,
        req.request_id,
        req.provider_cost_usd,
    )
    .await?;

    state.resolver.invalidate(identity.user_id);
    publish_profile_changed(&state.redis, identity.user_id).await;

    Ok(Json(DeductResponse {
        applied: outcome.applied,
        tokens_charged: outcome.tokens,
        balance: outcome.balance,
        overdrawn: outcome.overdrawn,
    }))
}
