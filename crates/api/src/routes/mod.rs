//! API routes

pub mod health;
pub mod refunds;
pub mod subscriptions;
pub mod webhooks;

use axum::{
    body::Bytes,
    middleware,
    routing::{get, post},
    Router,
};
use serde::de::DeserializeOwned;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{auth::require_auth, error::ApiError, state::AppState};

/// Parse a JSON body, reporting failures in the API error shape
pub(crate) fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| ApiError::InvalidInput(format!("malformed request body: {}", e)))
}

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check (infrastructure monitoring)
    let health_routes = Router::new().route("/health", get(health::health));

    // Provider webhooks authenticate themselves (shared secret / signature)
    let webhook_routes = Router::new()
        .route("/revenuecat-webhook", post(webhooks::revenuecat_webhook))
        .route("/stripe-webhook", post(webhooks::stripe_webhook));

    // User and admin routes (session token required)
    let protected_routes = Router::new()
        .route(
            "/sync-native-subscription",
            post(subscriptions::sync_native_subscription),
        )
        .route("/entitlement-status", get(subscriptions::own_entitlement_status))
        .route(
            "/entitlement-status/{user_id}",
            get(subscriptions::entitlement_status),
        )
        .route("/refund-last-payment", post(refunds::refund_last_payment))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(health_routes)
        .merge(webhook_routes)
        .merge(protected_routes)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
