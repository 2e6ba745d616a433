//! Admin refund route

use axum::{body::Bytes, extract::State, Extension, Json};
use larder_billing::{Caller, RefundResult};
use serde::Deserialize;
use uuid::Uuid;

use crate::{error::ApiResult, routes::parse_json, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub user_id: Uuid,
}

/// Refund the target user's most recent payment (admin only)
pub async fn refund_last_payment(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    body: Bytes,
) -> ApiResult<Json<RefundResult>> {
    let request: RefundRequest = parse_json(&body)?;

    tracing::info!(
        admin_user_id = %caller.user_id,
        target_user_id = %request.user_id,
        "Refund requested"
    );

    let result = state
        .engine
        .refunds
        .refund_last_payment(&caller, request.user_id)
        .await?;
    Ok(Json(result))
}
