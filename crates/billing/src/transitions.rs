//! Plan transitions.
//!
//! Admin/user-initiated plan changes cancel and recreate the provider-side
//! subscription while preserving the user's unspent token balance: the user
//! already paid for the full period, so no prorating of tokens happens on a
//! switch. Cancellation failures are best-effort (logged, the switch
//! continues); creation failures are fatal and name any provider
//! subscriptions still standing, since leaving the user with no
//! subscription is worse than leaving a stale one.

use clipcast_shared::PlanType;
use sqlx::PgPool;
use stripe::{
    CancelSubscription, CreateCustomer, CreateSubscription, CreateSubscriptionItems, Customer,
    CustomerId, ListSubscriptions, Subscription, SubscriptionId,
    SubscriptionStatus as StripeSubStatus, UpdateSubscription, UpdateSubscriptionItems,
};
use time::OffsetDateTime;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::ledger::TokenLedger;
use crate::subscriptions::SubscriptionStore;

/// Result of a plan switch.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlanSwitchResult {
    pub user_id: Uuid,
    pub from_plan: Option<PlanType>,
    pub to_plan: PlanType,
    /// Balance snapshotted before the switch. On a switch the new plan's
    /// allocation is added on top of this; on an unlimited exit the balance
    /// is restored to exactly this.
    pub preserved_tokens: i64,
    pub stripe_subscription_id: String,
    pub message: String,
}

/// Orchestrates plan switches against the provider and the ledger.
pub struct PlanTransitionOrchestrator {
    stripe: StripeClient,
    pool: PgPool,
    store: SubscriptionStore,
    ledger: TokenLedger,
    catalog: PlanCatalog,
}

impl PlanTransitionOrchestrator {
    pub fn new(
        stripe: StripeClient,
        pool: PgPool,
        ledger: TokenLedger,
        catalog: PlanCatalog,
    ) -> Self {
        let store = SubscriptionStore::new(pool.clone());
        Self {
            stripe,
            pool,
            store,
            ledger,
            catalog,
        }
    }

    /// Switch the user to `target_plan`, preserving their unspent tokens.
    pub async fn switch_plan(
        &self,
        user_id: Uuid,
        target_plan: PlanType,
    ) -> BillingResult<PlanSwitchResult> {
        // Validates the plan has catalog terms before touching anything.
        let terms = self.catalog.terms(target_plan).await?;

        let existing = self.store.get_by_user(user_id).await?;
        let from_plan = existing.as_ref().map(|r| r.plan_type);

        if from_plan == Some(target_plan) {
            let record = existing.ok_or_else(|| {
                BillingError::Internal("Subscription vanished mid-switch".to_string())
            })?;
            return Ok(PlanSwitchResult {
                user_id,
                from_plan,
                to_plan: target_plan,
                preserved_tokens: 0,
                stripe_subscription_id: record.stripe_subscription_id,
                message: format!("Already on plan '{}'", target_plan),
            });
        }

        tracing::info!(
            user_id = %user_id,
            from_plan = ?from_plan,
            to_plan = %target_plan,
            "Starting plan switch"
        );

        // Snapshot before anything mutates; carried on the subscription
        // record when entering unlimited, and returned for messaging.
        let balance = self.ledger.get_or_create_balance(user_id).await?;
        let preserved_tokens = balance.tokens_remaining.max(0);

        let customer_id = self.ensure_customer(user_id).await?;

        // Best-effort teardown of the old provider subscription, with a
        // final invoice collecting any outstanding metered overage.
        if let Some(record) = &existing {
            self.cancel_provider_subscription(&record.stripe_subscription_id, true)
                .await;
        }
        self.cancel_all_active_subscriptions(&customer_id).await;

        // Create the replacement. Fatal on failure: surface what is still
        // standing provider-side so support can untangle it.
        let subscription = match self
            .create_provider_subscription(user_id, &customer_id, target_plan)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                let blocking = self
                    .list_active_subscription_ids(&customer_id)
                    .await
                    .unwrap_or_default();
                return Err(BillingError::PlanSwitchBlocked {
                    target_plan: target_plan.to_string(),
                    reason: e.to_string(),
                    blocking_subscription_ids: blocking,
                });
            }
        };

        // Replace the subscription row: delete + insert, never update, so
        // no state leaks from the old plan.
        self.store.delete_for_user(user_id).await?;
        self.store
            .upsert_from_stripe(user_id, &subscription, target_plan)
            .await?;

        let period_start = OffsetDateTime::from_unix_timestamp(subscription.current_period_start)
            .unwrap_or(OffsetDateTime::now_utc());
        let period_end = OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
            .unwrap_or(OffsetDateTime::now_utc());

        if target_plan == PlanType::Unlimited {
            // Remember what to restore on exit, and mirror the period.
            let preserved_plan = from_plan.unwrap_or(PlanType::Free);
            self.store
                .set_preserved(user_id, preserved_tokens, preserved_plan)
                .await?;
            self.ledger
                .reset_for_subscription(
                    user_id,
                    PlanType::Unlimited,
                    -1,
                    period_start,
                    period_end,
                    false,
                    Some(subscription.id.as_str()),
                )
                .await?;
        } else {
            // Switch semantics are additive: the balance still holds the
            // preserved tokens, and the new plan's allocation lands on top
            // (a switch never resets). The reset transaction's period key
            // stops the subscription-created webhook from adding it again.
            self.ledger
                .reset_for_subscription(
                    user_id,
                    target_plan,
                    terms.allocation(),
                    period_start,
                    period_end,
                    false,
                    Some(subscription.id.as_str()),
                )
                .await?;
        }

        tracing::info!(
            user_id = %user_id,
            to_plan = %target_plan,
            subscription_id = %subscription.id,
            preserved_tokens = preserved_tokens,
            "Plan switch complete"
        );

        Ok(PlanSwitchResult {
            user_id,
            from_plan,
            to_plan: target_plan,
            preserved_tokens,
            stripe_subscription_id: subscription.id.to_string(),
            message: format!(
                "Switched to '{}' preserving {} tokens",
                target_plan, preserved_tokens
            ),
        })
    }

    /// Enroll in the unlimited plan, remembering the current plan and
    /// balance for restoration on exit.
    pub async fn enroll_unlimited(&self, user_id: Uuid) -> BillingResult<PlanSwitchResult> {
        self.switch_plan(user_id, PlanType::Unlimited).await
    }

    /// Exit the unlimited plan, restoring the preserved plan and exactly
    /// the preserved token balance (not preserved-plus-allocation: restore
    /// semantics differ from switch semantics).
    pub async fn unenroll_unlimited(&self, user_id: Uuid) -> BillingResult<PlanSwitchResult> {
        let record = self.store.get_by_user(user_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!("User {} has no subscription", user_id))
        })?;
        if record.plan_type != PlanType::Unlimited {
            return Err(BillingError::InvalidInput(format!(
                "User {} is on plan '{}', not unlimited",
                user_id, record.plan_type
            )));
        }

        // Legacy rows predate the preserved fields: fall back to the lowest
        // free tier, and to the (never decremented while unlimited) stored
        // balance for the token count.
        let restore_plan = record.preserved_plan_type.unwrap_or(PlanType::Free);
        let balance = self.ledger.get_or_create_balance(user_id).await?;
        let preserved_tokens = record
            .preserved_tokens_balance
            .unwrap_or(balance.tokens_remaining)
            .max(0);

        let terms = self.catalog.terms(restore_plan).await?;
        let customer_id = self.ensure_customer(user_id).await?;

        tracing::info!(
            user_id = %user_id,
            restore_plan = %restore_plan,
            preserved_tokens = preserved_tokens,
            "Unenrolling from unlimited plan"
        );

        // Delete the unlimited row first to dodge the user_id unique
        // constraint when the new record lands.
        self.store.delete_for_user(user_id).await?;
        self.cancel_provider_subscription(&record.stripe_subscription_id, false)
            .await;
        self.cancel_all_active_subscriptions(&customer_id).await;

        let subscription = match self
            .create_provider_subscription(user_id, &customer_id, restore_plan)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                let blocking = self
                    .list_active_subscription_ids(&customer_id)
                    .await
                    .unwrap_or_default();
                return Err(BillingError::PlanSwitchBlocked {
                    target_plan: restore_plan.to_string(),
                    reason: e.to_string(),
                    blocking_subscription_ids: blocking,
                });
            }
        };

        self.store
            .upsert_from_stripe(user_id, &subscription, restore_plan)
            .await?;

        let period_start = OffsetDateTime::from_unix_timestamp(subscription.current_period_start)
            .unwrap_or(OffsetDateTime::now_utc());
        let period_end = OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
            .unwrap_or(OffsetDateTime::now_utc());

        // Exactly the preserved amount; the reset transaction's period key
        // keeps the webhook-driven sync from adding the plan allocation on
        // top.
        self.ledger
            .set_balance_preserved(
                user_id,
                preserved_tokens,
                terms.allocation(),
                period_start,
                period_end,
                Some(subscription.id.as_str()),
                serde_json::json!({
                    "reason": "unenroll_unlimited",
                    "restore_plan": restore_plan.as_str(),
                    "preserved_tokens": preserved_tokens,
                }),
            )
            .await?;

        Ok(PlanSwitchResult {
            user_id,
            from_plan: Some(PlanType::Unlimited),
            to_plan: restore_plan,
            preserved_tokens,
            stripe_subscription_id: subscription.id.to_string(),
            message: format!(
                "Restored plan '{}' with {} preserved tokens",
                restore_plan, preserved_tokens
            ),
        })
    }

    /// Cancel: downgrade to free, returning the preserved token count for
    /// user-facing messaging.
    pub async fn cancel(&self, user_id: Uuid) -> BillingResult<i64> {
        let result = self.switch_plan(user_id, PlanType::Free).await?;
        Ok(result.preserved_tokens)
    }

    /// The user's provider customer, created on demand if the account
    /// predates billing or drifted.
    async fn ensure_customer(&self, user_id: Uuid) -> BillingResult<String> {
        if let Some(customer_id) = self.store.customer_for_user(user_id).await? {
            return Ok(customer_id);
        }

        let email: Option<String> = sqlx::query_scalar("SELECT email FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        let mut params = CreateCustomer::new();
        params.email = email.as_deref();
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        params.metadata = Some(metadata);

        let customer = Customer::create(self.stripe.inner(), params).await?;

        sqlx::query("UPDATE users SET stripe_customer_id = $1, updated_at = NOW() WHERE id = $2")
            .bind(customer.id.as_str())
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        tracing::info!(
            user_id = %user_id,
            customer_id = %customer.id,
            "Created Stripe customer for user"
        );
        Ok(customer.id.to_string())
    }

    /// Cancel one provider subscription, optionally invoicing outstanding
    /// metered overage immediately. Best-effort: failures are logged and
    /// the switch continues, retried once with backoff since cancellation
    /// is idempotent provider-side.
    async fn cancel_provider_subscription(&self, subscription_id: &str, invoice_now: bool) {
        let sub_id: SubscriptionId = match subscription_id.parse() {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Stored subscription id failed to parse; skipping cancellation"
                );
                return;
            }
        };

        let strategy = ExponentialBackoff::from_millis(200).take(2);
        let result = Retry::spawn(strategy, || async {
            let params = CancelSubscription {
                cancellation_details: None,
                invoice_now: Some(invoice_now),
                prorate: None,
            };
            Subscription::cancel(self.stripe.inner(), &sub_id, params).await
        })
        .await;

        match result {
            Ok(_) => {
                tracing::info!(
                    subscription_id = %subscription_id,
                    invoice_now = invoice_now,
                    "Cancelled provider subscription"
                );
            }
            Err(e) => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Failed to cancel provider subscription (continuing switch)"
                );
            }
        }
    }

    /// Defensively cancel every remaining active subscription for the
    /// customer. Guards against drift where more than one exists.
    async fn cancel_all_active_subscriptions(&self, customer_id: &str) {
        let subs = match self.list_active_subscriptions(customer_id).await {
            Ok(subs) => subs,
            Err(e) => {
                tracing::warn!(
                    customer_id = %customer_id,
                    error = %e,
                    "Failed to list provider subscriptions for defensive cleanup"
                );
                return;
            }
        };

        if subs.len() > 1 {
            tracing::warn!(
                customer_id = %customer_id,
                count = subs.len(),
                "Customer has multiple active provider subscriptions; cancelling all"
            );
        }

        for sub in subs {
            self.cancel_provider_subscription(sub.id.as_str(), false)
                .await;
        }
    }

    async fn list_active_subscriptions(
        &self,
        customer_id: &str,
    ) -> BillingResult<Vec<Subscription>> {
        let customer_id: CustomerId = customer_id
            .parse()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let mut params = ListSubscriptions::new();
        params.customer = Some(customer_id);
        let list = Subscription::list(self.stripe.inner(), &params).await?;

        Ok(list
            .data
            .into_iter()
            .filter(|s| {
                matches!(
                    s.status,
                    StripeSubStatus::Active | StripeSubStatus::Trialing | StripeSubStatus::PastDue
                )
            })
            .collect())
    }

    async fn list_active_subscription_ids(&self, customer_id: &str) -> BillingResult<Vec<String>> {
        Ok(self
            .list_active_subscriptions(customer_id)
            .await?
            .into_iter()
            .map(|s| s.id.to_string())
            .collect())
    }

    /// Create the provider-side subscription for a plan.
    ///
    /// Paid plans get the base price only at creation; the metered overage
    /// price is attached afterwards, because metered items need usage
    /// reporting infrastructure that only exists post-creation.
    async fn create_provider_subscription(
        &self,
        user_id: Uuid,
        customer_id: &str,
        plan: PlanType,
    ) -> BillingResult<Subscription> {
        let price_id = self
            .stripe
            .config()
            .price_id_for_plan(plan)
            .ok_or_else(|| {
                BillingError::Config(format!("No Stripe price configured for plan '{}'", plan))
            })?
            .to_string();

        let customer_id: CustomerId = customer_id
            .parse()
            .map_err(|e| BillingError::StripeApi(format!("Invalid customer ID: {}", e)))?;

        let mut metadata = std::collections::HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        metadata.insert("plan_type".to_string(), plan.as_str().to_string());

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);

        let subscription = Subscription::create(self.stripe.inner(), params).await?;

        // Attach the metered overage item for overage-eligible plans.
        let subscription =
            if let Some(overage_price) = self.stripe.config().overage_price_id_for_plan(plan) {
                let update = UpdateSubscription {
                    items: Some(vec![UpdateSubscriptionItems {
                        price: Some(overage_price.to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                };
                Subscription::update(self.stripe.inner(), &subscription.id, update).await?
            } else {
                subscription
            };

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            plan = %plan,
            "Created provider subscription"
        );
        Ok(subscription)
    }
}
