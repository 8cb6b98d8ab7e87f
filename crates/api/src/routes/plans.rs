//! Public plan listing and balance lookups.

use axum::extract::{Path, State};
use axum::Json;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

pub async fn list_plans(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state
        .billing
        .as_ref()
        .ok_or(ApiError::BillingUnavailable)?;

    let plans = billing.catalog.list_public().await;
    Ok(Json(serde_json::json!({ "plans": plans })))
}

pub async fn get_balance(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state
        .billing
        .as_ref()
        .ok_or(ApiError::BillingUnavailable)?;

    let balance = billing.ledger.get_or_create_balance(user_id).await?;
    let plan = billing
        .ledger
        .current_plan(user_id)
        .await?
        .map(|(plan, status)| serde_json::json!({ "plan": plan, "status": status }));

    Ok(Json(serde_json::json!({
        "user_id": balance.user_id,
        "tokens_remaining": balance.tokens_remaining,
        "tokens_used_this_period": balance.tokens_used_this_period,
        "monthly_tokens": balance.monthly_tokens,
        "period_start": balance.period_start,
        "period_end": balance.period_end,
        "subscription": plan,
    })))
}

pub async fn list_transactions(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state
        .billing
        .as_ref()
        .ok_or(ApiError::BillingUnavailable)?;

    let transactions = billing.ledger.list_transactions(user_id, 100).await?;
    let transactions: Vec<serde_json::Value> = transactions
        .into_iter()
        .map(|t| {
            serde_json::json!({
                "id": t.id,
                "transaction_type": t.transaction_type,
                "tokens": t.tokens,
                "balance_before": t.balance_before,
                "balance_after": t.balance_after,
                "video_id": t.video_id,
                "metadata": t.metadata,
                "created_at": t.created_at,
            })
        })
        .collect();

    Ok(Json(serde_json::json!({ "transactions": transactions })))
}
