//! Provider webhook routes

use axum::{
    body::Bytes,
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap},
    Json,
};
use larder_billing::WebhookAck;

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

/// Subscription aggregator webhook (App Store, Play Store and friends)
pub async fn revenuecat_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let authorization = header(&headers, AUTHORIZATION.as_str());
    let ack = state
        .engine
        .aggregator_webhooks
        .handle(authorization, &body)
        .await?;
    Ok(Json(ack))
}

/// Stripe webhook, verified against the `Stripe-Signature` header
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let signature = header(&headers, "stripe-signature");
    let payload = std::str::from_utf8(&body)
        .map_err(|_| ApiError::InvalidInput("webhook payload is not UTF-8".to_string()))?;

    let ack = state.engine.stripe_webhooks.handle(signature, payload).await?;
    Ok(Json(ack))
}
