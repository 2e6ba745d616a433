//! Native store sync and entitlement status routes

use axum::{
    body::Bytes,
    extract::{Path, State},
    Extension, Json,
};
use larder_billing::{Caller, EntitlementView, NativeSyncRequest, NativeSyncResponse};
use uuid::Uuid;

use crate::{error::ApiResult, routes::parse_json, state::AppState};

/// Record a purchase or restore the client completed with a native store
pub async fn sync_native_subscription(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> ApiResult<Json<NativeSyncResponse>> {
    let request: NativeSyncRequest = parse_json(&body)?;
    let response = state
        .engine
        .reconciliation
        .sync_native(&caller, request)
        .await?;
    Ok(Json(response))
}

/// The caller's own entitlement
pub async fn own_entitlement_status(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
) -> ApiResult<Json<EntitlementView>> {
    let view = state
        .engine
        .entitlements
        .get_status(&caller, caller.user_id)
        .await?;
    Ok(Json(view))
}

/// Another user's entitlement (self or admin)
pub async fn entitlement_status(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<EntitlementView>> {
    let view = state.engine.entitlements.get_status(&caller, user_id).await?;
    Ok(Json(view))
}

#[cfg(test)]
mod tests {
    use crate::auth::jwt::test_tokens::valid_token;
    use crate::routes::test_support::{json_request, send, test_app};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use larder_billing::Profile;
    use larder_shared::{Provider, SubscriptionTier, UserRole};
    use serde_json::json;
    use uuid::Uuid;

    fn get(uri: &str, user: Uuid) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("authorization", format!("Bearer {}", valid_token(user)))
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_sync_requires_session() {
        let app = test_app();

        let (status, body) = send(
            &app.router,
            json_request(
                "POST",
                "/sync-native-subscription",
                None,
                json!({ "provider": "apple" }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn test_sync_grants_premium_to_caller() {
        let app = test_app();
        let user = Uuid::new_v4();
        app.profiles.insert(Profile::new(user));
        let auth = format!("Bearer {}", valid_token(user));

        let (status, body) = send(
            &app.router,
            json_request(
                "POST",
                "/sync-native-subscription",
                Some(&auth),
                json!({ "provider": "apple", "expirationDate": "2026-03-01T00:00:00Z" }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true, "message": "Subscription synced" }));
        assert_eq!(app.store.snapshot(user).unwrap().provider, Provider::Apple);
        assert_eq!(
            app.profiles.profile(user).unwrap().subscription_tier,
            SubscriptionTier::Premium
        );
    }

    #[tokio::test]
    async fn test_sync_rejects_unknown_provider() {
        let app = test_app();
        let user = Uuid::new_v4();
        let auth = format!("Bearer {}", valid_token(user));

        let (status, body) = send(
            &app.router,
            json_request(
                "POST",
                "/sync-native-subscription",
                Some(&auth),
                json!({ "provider": "stripe" }),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_INPUT");
        assert!(app.store.snapshot(user).is_none());
    }

    #[tokio::test]
    async fn test_own_status_defaults_to_free() {
        let app = test_app();
        let user = Uuid::new_v4();

        let (status, body) = send(&app.router, get("/entitlement-status", user)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["userId"], user.to_string());
        assert_eq!(body["tier"], "free");
        assert_eq!(body["status"], "inactive");
        assert_eq!(body["hasSubscription"], false);
    }

    #[tokio::test]
    async fn test_other_users_status_requires_admin() {
        let app = test_app();
        let caller = Uuid::new_v4();
        let target = Uuid::new_v4();
        let uri = format!("/entitlement-status/{}", target);

        let (status, body) = send(&app.router, get(&uri, caller)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "FORBIDDEN");

        let mut admin = Profile::new(caller);
        admin.role = UserRole::Admin;
        app.profiles.insert(admin);

        let (status, body) = send(&app.router, get(&uri, caller)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["userId"], target.to_string());
    }
}
