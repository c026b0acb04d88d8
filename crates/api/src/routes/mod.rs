//! API routes

pub mod access;
pub mod admin;
pub mod health;
pub mod intent;
pub mod usage;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    // Auth is enforced per handler via the Identity extractors
    let api_v1_routes = Router::new()
        .route("/access", get(access::get_access))
        .route("/access/premium", get(access::get_premium_access))
        .route("/access/ws", get(access::access_ws))
        .route("/intent/classify", post(intent::classify))
        .route("/intent/route", post(intent::route))
        .route("/usage/deduct", post(usage::deduct))
        .route("/admin/plan", post(admin::set_plan));

    Router::new()
        .merge(health_routes)
        .nest("/v1", api_v1_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(64 * 1024)) // Requests here are tiny
        .with_state(state)
}
