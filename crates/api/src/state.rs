//! Application state

use std::sync::Arc;

use sqlx::PgPool;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    /// Billing service; None when Stripe is not configured (minimal mode:
    /// read-only endpoints still work, mutating billing routes return 503).
    pub billing: Option<Arc<clipcast_billing::BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool) -> Self {
        let billing = match clipcast_billing::BillingService::from_env(pool.clone()) {
            Ok(service) => Some(Arc::new(service)),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    "Billing service unavailable - starting in minimal mode"
                );
                None
            }
        };
        Self { pool, billing }
    }
}
