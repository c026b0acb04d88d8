//! Intent classification and routing endpoints

use axum::{extract::State, Json};
use muse_intent::{decide, RoutingContext};
use muse_shared::{Intent, IntentKind, RoutingDecision};
use serde::{Deserialize, Serialize};

use crate::auth::Identity;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ClassifyRequest {
    pub text: String,
}

/// Classify a raw user message into an intent.
pub async fn classify(
    State(state): State<AppState>,
    _identity: Identity,
    Json(req): Json<ClassifyRequest>,
) -> Json<Intent> {
    Json(state.classifier.classify(&req.text))
}

#[derive(Debug, Deserialize)]
pub struct RouteRequest {
    pub text: String,
    #[serde(default)]
    pub has_active_project: bool,
    #[serde(default)]
    pub active_project_kind: Option<IntentKind>,
    #[serde(default)]
    pub previously_confirmed: bool,
}

#[derive(Debug, Serialize)]
pub struct RouteResponse {
    pub intent: Intent,
    pub decision: RoutingDecision,
}

/// Classify a message and decide how the chat UI should route it.
pub async fn route(
    State(state): State<AppState>,
    identity: Identity,
    Json(req): Json<RouteRequest>,
) -> Json<RouteResponse> {
    let intent = state.classifier.classify(&req.text);
    let decision = decide(
        &intent,
        &RoutingContext {
            has_active_project: req.has_active_project,
            active_project_kind: req.active_project_kind,
            previously_confirmed: req.previously_confirmed,
        },
    );

    tracing::debug!(
        user_id = %identity.user_id,
        kind = %intent.kind,
        confidence = intent.confidence,
        action = ?decision.action,
        "Routed user message"
    );

    Json(RouteResponse { intent, decision })
}
