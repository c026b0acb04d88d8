//! Platform admin endpoints

use axum::{extract::State, Json};
use muse_shared::{Plan, TierFlags};
use muse_tokens::ProfileStore;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::AdminIdentity;
use crate::error::ApiResult;
use crate::realtime::publish_profile_changed;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SetPlanRequest {
    pub user_id: Uuid,
    pub plan: Plan,
}

/// Change a user's plan (the billing system's write path).
///
/// Writes the plan and the secondary tier flags together, then invalidates
/// and publishes so every open tab re-resolves within a second.
pub async fn set_plan(
    State(state): State<AppState>,
    admin: AdminIdentity,
    Json(req): Json<SetPlanRequest>,
) -> ApiResult<Json<Value>> {
    state.store.set_plan(req.user_id, req.plan).await?;
    state
        .store
        .write_tier_flags(req.user_id, &TierFlags::for_plan(req.plan))
        .await?;

    state.resolver.invalidate(req.user_id);
    publish_profile_changed(&state.redis, req.user_id).await;

    tracing::info!(
        admin_id = %admin.user_id,
        user_id = %req.user_id,
        plan = %req.plan,
        "Plan changed by admin"
    );

    Ok(Json(json!({ "status": "ok" })))
}
