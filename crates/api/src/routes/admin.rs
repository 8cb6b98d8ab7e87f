//! Admin endpoints: token grants/deductions with operator audit metadata,
//! plan changes, and invariant checks.

use axum::extract::{Path, State};
use axum::Json;
use clipcast_shared::{PlanType, TransactionType};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub tokens: i64,
    pub reason: String,
    pub operator_id: Uuid,
}

pub async fn grant_tokens(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<GrantRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state
        .billing
        .as_ref()
        .ok_or(ApiError::BillingUnavailable)?;

    let metadata = serde_json::json!({
        "reason": req.reason,
        "operator_id": req.operator_id,
    });
    let granted = billing
        .ledger
        .add(user_id, req.tokens, TransactionType::Grant, Some(metadata))
        .await?;

    let balance = billing.ledger.get_or_create_balance(user_id).await?;
    Ok(Json(serde_json::json!({
        "granted": granted,
        "tokens_remaining": balance.tokens_remaining,
    })))
}

#[derive(Debug, Deserialize)]
pub struct DeductRequest {
    pub tokens: i64,
    pub reason: String,
    pub operator_id: Uuid,
}

/// Admin deduction. The response includes how much NEW overage the
/// deduction triggered, computed before the deduction so the operator sees
/// what the user will be billed.
pub async fn deduct_tokens(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<DeductRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state
        .billing
        .as_ref()
        .ok_or(ApiError::BillingUnavailable)?;

    let overage_preview = billing.ledger.preview_overage(user_id, req.tokens).await?;

    let metadata = serde_json::json!({
        "reason": req.reason,
        "operator_id": req.operator_id,
    });
    let outcome = billing
        .ledger
        .deduct(
            user_id,
            req.tokens,
            TransactionType::AdminTest,
            None,
            Some(metadata),
        )
        .await?;

    let balance = billing.ledger.get_or_create_balance(user_id).await?;
    match outcome {
        clipcast_billing::DeductOutcome::Insufficient {
            required,
            available,
        } => Ok(Json(serde_json::json!({
            "deducted": false,
            "error": format!("insufficient tokens, need {}, have {}", required, available),
            "tokens_remaining": balance.tokens_remaining,
        }))),
        _ => Ok(Json(serde_json::json!({
            "deducted": true,
            "new_overage_units": overage_preview,
            "tokens_remaining": balance.tokens_remaining,
        }))),
    }
}

#[derive(Debug, Deserialize)]
pub struct SwitchPlanRequest {
    pub plan: String,
}

pub async fn switch_plan(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(req): Json<SwitchPlanRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state
        .billing
        .as_ref()
        .ok_or(ApiError::BillingUnavailable)?;

    let plan = PlanType::parse(&req.plan)
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown plan '{}'", req.plan)))?;

    let result = billing.transitions.switch_plan(user_id, plan).await?;
    Ok(Json(serde_json::json!({ "switch": result })))
}

pub async fn cancel_plan(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state
        .billing
        .as_ref()
        .ok_or(ApiError::BillingUnavailable)?;

    let preserved_tokens = billing.transitions.cancel(user_id).await?;
    Ok(Json(serde_json::json!({
        "canceled": true,
        "preserved_tokens": preserved_tokens,
    })))
}

pub async fn enroll_unlimited(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state
        .billing
        .as_ref()
        .ok_or(ApiError::BillingUnavailable)?;

    let result = billing.transitions.enroll_unlimited(user_id).await?;
    Ok(Json(serde_json::json!({ "switch": result })))
}

pub async fn unenroll_unlimited(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state
        .billing
        .as_ref()
        .ok_or(ApiError::BillingUnavailable)?;

    let result = billing.transitions.unenroll_unlimited(user_id).await?;
    Ok(Json(serde_json::json!({ "switch": result })))
}

pub async fn run_invariants(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let billing = state
        .billing
        .as_ref()
        .ok_or(ApiError::BillingUnavailable)?;

    let summary = billing.invariants.run_all_checks().await?;
    Ok(Json(serde_json::json!({ "summary": summary })))
}
