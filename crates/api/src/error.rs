//! API error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use clipcast_billing::BillingError;

/// Error wrapper translating billing errors into HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Billing is not configured")]
    BillingUnavailable,

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Billing(e) => {
                let status = match e {
                    BillingError::WebhookSignatureInvalid
                    | BillingError::WebhookEventNotSupported(_)
                    | BillingError::InvalidInput(_)
                    | BillingError::InvalidPlan(_) => StatusCode::BAD_REQUEST,
                    BillingError::NotFound(_) => StatusCode::NOT_FOUND,
                    BillingError::PlanSwitchBlocked { .. }
                    | BillingError::ConcurrentModification(_) => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
            ApiError::BillingUnavailable => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
        };

        if status.is_server_error() {
            tracing::error!(status = %status, error = %message, "Request failed");
        }

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
