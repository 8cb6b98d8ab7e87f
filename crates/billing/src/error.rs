//! Billing error types.
//!
//! Policy outcomes ("insufficient tokens", "overage not allowed on this
//! plan") are NOT errors — ledger functions return them as domain results
//! so orchestration code can branch on them. Errors here are the things
//! that genuinely failed: the database, the Stripe API, configuration, or
//! provider-side state that blocks an operation from completing.

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Lock error: {0}")]
    Lock(String),

    /// Creating the replacement subscription during a plan switch failed
    /// while provider-side subscriptions still exist. The ids are surfaced
    /// so support can see exactly what is blocking the account.
    #[error(
        "Plan switch to '{target_plan}' failed: {reason}. \
         Active provider subscriptions still present: {blocking_subscription_ids:?}"
    )]
    PlanSwitchBlocked {
        target_plan: String,
        reason: String,
        blocking_subscription_ids: Vec<String>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_switch_blocked_names_the_conflicting_subscriptions() {
        let err = BillingError::PlanSwitchBlocked {
            target_plan: "creator".to_string(),
            reason: "subscription create returned 402".to_string(),
            blocking_subscription_ids: vec!["sub_123".to_string(), "sub_456".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("creator"));
        assert!(msg.contains("sub_123"));
        assert!(msg.contains("sub_456"));
    }
}
