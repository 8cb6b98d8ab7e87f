//! Billing webhook intake.
//!
//! The provider retries delivery with backoff on any non-2xx response, so
//! the contract here is: signature failures are 400 (no retry will fix
//! them), handler errors are 500 (retry may succeed), duplicates are 200.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state
        .billing
        .as_ref()
        .ok_or(ApiError::BillingUnavailable)?;

    let signature = headers
        .get("Stripe-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing Stripe-Signature header".to_string()))?;

    let event = billing.webhooks.verify_event(&body, signature)?;
    let outcome = billing.webhooks.handle_event(event).await?;

    Ok(Json(serde_json::json!({
        "received": true,
        "outcome": format!("{:?}", outcome),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListWebhooksQuery {
    pub status: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list_webhooks(
    State(state): State<AppState>,
    Query(query): Query<ListWebhooksQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state
        .billing
        .as_ref()
        .ok_or(ApiError::BillingUnavailable)?;

    let records = billing
        .webhooks
        .list_webhooks(query.status.as_deref(), query.limit, query.offset)
        .await?;

    Ok(Json(serde_json::json!({ "events": records })))
}

pub async fn replay_webhook(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state
        .billing
        .as_ref()
        .ok_or(ApiError::BillingUnavailable)?;

    let result = billing.webhooks.replay_webhook(&event_id).await?;
    Ok(Json(serde_json::json!({ "replay": result })))
}
