// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some Stripe operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Clipcast Billing Module
//!
//! Token ledger and subscription-lifecycle reconciliation for the video
//! scheduling backend.
//!
//! ## Features
//!
//! - **Token Ledger**: Per-user balances with an append-only transaction log
//! - **Plan Catalog**: Stripe-synced economic terms with a static fallback
//! - **Renewal Detection**: Period-rollover vs. plan-switch classification
//! - **Webhook Reconciliation**: Idempotent consumption of Stripe events
//! - **Plan Transitions**: Cancel-and-recreate switches that preserve tokens
//! - **Overage Billing**: Incremental metered usage reporting
//! - **Invariants**: Runnable consistency checks over the ledger

pub mod catalog;
pub mod client;
pub mod error;
pub mod invariants;
pub mod ledger;
pub mod lock;
pub mod overage;
pub mod renewal;
pub mod subscriptions;
pub mod sync;
pub mod transitions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Catalog
pub use catalog::{BillingInterval, PlanCatalog, PlanTerms};

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{DeductOutcome, TokenBalance, TokenLedger, TokenTransaction};

// Lock
pub use lock::{Lease, LeaseLock};

// Overage
pub use overage::{OverageReporter, UsageReportResult};

// Subscriptions
pub use subscriptions::{SubscriptionRecord, SubscriptionStore};

// Sync
pub use sync::TokenSyncService;

// Transitions
pub use transitions::{PlanSwitchResult, PlanTransitionOrchestrator};

// Webhooks
pub use webhooks::{WebhookEventRecord, WebhookOutcome, WebhookReconciler, WebhookReplayResult};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub catalog: PlanCatalog,
    pub ledger: TokenLedger,
    pub overage: OverageReporter,
    pub subscriptions: SubscriptionStore,
    pub sync: TokenSyncService,
    pub transitions: PlanTransitionOrchestrator,
    pub webhooks: WebhookReconciler,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::new(stripe, pool))
    }

    /// Create a new billing service with an explicit Stripe client
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let catalog = PlanCatalog::new(stripe.clone());
        let overage = OverageReporter::new(stripe.clone(), pool.clone());
        let ledger = TokenLedger::new(pool.clone(), overage.clone());
        let subscriptions = SubscriptionStore::new(pool.clone());
        let sync = TokenSyncService::new(
            stripe.clone(),
            ledger.clone(),
            subscriptions.clone(),
            catalog.clone(),
        );

        Self {
            catalog: catalog.clone(),
            ledger: ledger.clone(),
            overage,
            subscriptions,
            sync: sync.clone(),
            transitions: PlanTransitionOrchestrator::new(
                stripe.clone(),
                pool.clone(),
                ledger,
                catalog,
            ),
            webhooks: WebhookReconciler::new(stripe, pool.clone(), sync),
            invariants: InvariantChecker::new(pool),
        }
    }
}
