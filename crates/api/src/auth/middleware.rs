//! Authentication middleware for Axum

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::error::ApiError;
use crate::state::AppState;

/// Extract bearer token from the Authorization header
pub(crate) fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Middleware that requires a valid session token
///
/// Resolves the token to a [`larder_billing::Caller`] (user id plus stored
/// role) and inserts it into the request extensions.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let token = extract_bearer_token(&request).map(String::from);

    match state.engine.callers.resolve(token.as_deref()).await {
        Ok(caller) => {
            tracing::debug!(
                path = %path,
                user_id = %caller.user_id,
                role = %caller.role,
                "require_auth: authentication successful"
            );
            request.extensions_mut().insert(caller);
            next.run(request).await
        }
        Err(err) => {
            tracing::warn!(path = %path, error = %err, "require_auth: authentication failed");
            ApiError::from(err).into_response()
        }
    }
}
