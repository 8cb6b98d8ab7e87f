//! Token/subscription synchronization.
//!
//! `ensure_tokens_synced_for_subscription` is the self-healing repair
//! function that keeps the ledger consistent with the provider's view of a
//! subscription. It is called from multiple triggers (webhook handlers,
//! direct subscription creation, the hourly sweep) and MUST be re-entrant:
//! calling it twice with the same inputs never grants twice. Deduplication
//! rides on the dedicated idempotency columns the ledger writes on every
//! reset and grant transaction.

use clipcast_shared::PlanType;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::PlanCatalog;
use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::ledger::TokenLedger;
use crate::renewal;
use crate::subscriptions::{SubscriptionRecord, SubscriptionStore};

/// Period differences under this threshold are the fingerprint of a plan
/// switch (the provider keeps the billing anchor), not a new period.
const PLAN_SWITCH_FINGERPRINT: time::Duration = time::Duration::hours(1);

/// Stored period bounds further than this from the provider's are
/// considered drifted and rewritten.
const PERIOD_DRIFT_TOLERANCE: time::Duration = time::Duration::seconds(60);

/// Keeps token balances in step with subscription periods.
#[derive(Clone)]
pub struct TokenSyncService {
    stripe: StripeClient,
    ledger: TokenLedger,
    store: SubscriptionStore,
    catalog: PlanCatalog,
}

impl TokenSyncService {
    pub fn new(
        stripe: StripeClient,
        ledger: TokenLedger,
        store: SubscriptionStore,
        catalog: PlanCatalog,
    ) -> Self {
        Self {
            stripe,
            ledger,
            store,
            catalog,
        }
    }

    /// The plan catalog this service resolves allocations against.
    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    /// Bring the user's token balance in line with the stored subscription.
    ///
    /// Returns false only when no subscription record exists for the id.
    /// Safe to call redundantly from any trigger.
    pub async fn ensure_tokens_synced_for_subscription(
        &self,
        user_id: Uuid,
        subscription_id: &str,
    ) -> BillingResult<bool> {
        let Some(record) = self.store.get_by_stripe_id(subscription_id).await? else {
            tracing::debug!(
                user_id = %user_id,
                subscription_id = %subscription_id,
                "No subscription record to sync tokens for"
            );
            return Ok(false);
        };
        if record.user_id != user_id {
            return Err(BillingError::InvalidInput(format!(
                "Subscription {} belongs to a different user",
                subscription_id
            )));
        }

        let now = OffsetDateTime::now_utc();

        // Daily-accrual plans bank a capped grant per day instead of
        // running period resets.
        if record.plan_type.is_daily_accrual() {
            let terms = self.catalog.terms(record.plan_type).await?;
            let max_accrual = terms.max_accrual.unwrap_or(terms.included_tokens);
            match self
                .ledger
                .apply_daily_grant(
                    user_id,
                    terms.included_tokens,
                    max_accrual,
                    subscription_id,
                    now.date(),
                )
                .await?
            {
                Some(granted) => {
                    tracing::debug!(
                        user_id = %user_id,
                        granted = granted,
                        "Daily accrual grant performed"
                    );
                }
                None => {
                    tracing::debug!(
                        user_id = %user_id,
                        "Daily accrual already granted today"
                    );
                }
            }
            return Ok(true);
        }

        // A reset for this exact subscription and period already exists:
        // nothing to grant, but fix the balance's period fields if they
        // drifted from the subscription's.
        if self
            .ledger
            .reset_exists_for_period(
                user_id,
                subscription_id,
                record.current_period_start,
                record.current_period_end,
            )
            .await?
        {
            let balance = self.ledger.get_or_create_balance(user_id).await?;
            if Self::period_drifted(&balance.period_end, record.current_period_end)
                || Self::period_drifted(&balance.period_start, record.current_period_start)
            {
                self.ledger
                    .update_period_bounds(
                        user_id,
                        record.current_period_start,
                        record.current_period_end,
                    )
                    .await?;
                tracing::debug!(
                    user_id = %user_id,
                    subscription_id = %subscription_id,
                    "Corrected drifted balance period bounds"
                );
            }
            return Ok(true);
        }

        // Unlimited: amounts are sentinel semantics, only periods mirror.
        if record.plan_type == PlanType::Unlimited {
            self.ledger
                .reset_for_subscription(
                    user_id,
                    PlanType::Unlimited,
                    -1,
                    record.current_period_start,
                    record.current_period_end,
                    false,
                    Some(subscription_id),
                )
                .await?;
            return Ok(true);
        }

        let allocation = self.catalog.allocation(record.plan_type).await?;
        let balance = self.ledger.get_or_create_balance(user_id).await?;

        // Period rollover on a live subscription: discard and refill.
        if renewal::is_renewal(balance.period_end, record.current_period_end, record.status, now) {
            self.ledger
                .reset_for_subscription(
                    user_id,
                    record.plan_type,
                    allocation,
                    record.current_period_start,
                    record.current_period_end,
                    true,
                    Some(subscription_id),
                )
                .await?;
            return Ok(true);
        }

        // Period effectively unchanged: a plan switch keeps the billing
        // anchor, so preserve tokens and just realign the stored bounds.
        if let Some(old_end) = balance.period_end {
            let drift = (record.current_period_end - old_end).abs();
            if drift < PLAN_SWITCH_FINGERPRINT {
                if Self::period_drifted(&balance.period_end, record.current_period_end)
                    || Self::period_drifted(&balance.period_start, record.current_period_start)
                {
                    self.ledger
                        .update_period_bounds(
                            user_id,
                            record.current_period_start,
                            record.current_period_end,
                        )
                        .await?;
                }
                return Ok(true);
            }
        }

        // Uninitialized period, or a fresh future period that the renewal
        // band did not claim: additive reset preserves whatever is there.
        if balance.period_end.is_none() || record.current_period_end > now {
            self.ledger
                .reset_for_subscription(
                    user_id,
                    record.plan_type,
                    allocation,
                    record.current_period_start,
                    record.current_period_end,
                    false,
                    Some(subscription_id),
                )
                .await?;
            return Ok(true);
        }

        // Period is stale on both sides (e.g. a canceled subscription whose
        // period already lapsed): leave the ledger alone.
        tracing::debug!(
            user_id = %user_id,
            subscription_id = %subscription_id,
            period_end = %record.current_period_end,
            "Subscription period already lapsed; no token action"
        );
        Ok(true)
    }

    /// Re-fetch the subscription from the provider, upsert the record, then
    /// run the token sync. Used by the hourly sweep for subscriptions whose
    /// stored period has lapsed (a renewal webhook may have been missed).
    pub async fn refresh_and_sync(&self, record: &SubscriptionRecord) -> BillingResult<bool> {
        let sub_id: stripe::SubscriptionId = record
            .stripe_subscription_id
            .parse()
            .map_err(|e| BillingError::StripeApi(format!("Invalid subscription ID: {}", e)))?;

        let subscription = stripe::Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;

        let plan = match crate::subscriptions::find_base_price_id(&subscription) {
            Some(price_id) => self
                .catalog
                .plan_for_price_id(&price_id)
                .await
                .unwrap_or(record.plan_type),
            None => record.plan_type,
        };

        self.store
            .upsert_from_stripe(record.user_id, &subscription, plan)
            .await?;
        self.ensure_tokens_synced_for_subscription(record.user_id, record.stripe_subscription_id.as_str())
            .await
    }

    fn period_drifted(stored: &Option<OffsetDateTime>, provider: OffsetDateTime) -> bool {
        match stored {
            Some(stored) => (provider - *stored).abs() > PERIOD_DRIFT_TOLERANCE,
            None => true,
        }
    }
}
