//! Metered overage reporting.
//!
//! Stripe's usage-record API is additive: each report increments the
//! period's total. Reporting the full accumulated overage on every deduct
//! would therefore double-count, so this service computes the strictly-new
//! overage created by the deduction that just happened and reports only
//! that delta.

use clipcast_shared::{PlanType, TokenPolicy};
use sqlx::PgPool;
use stripe::{CreateUsageRecord, SubscriptionItemId, UsageRecord, UsageRecordAction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Outcome of a usage report.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum UsageReportResult {
    /// Plan does not bill overage (free or unlimited).
    NotEligible { user_id: Uuid },
    /// Subscription has no metered item configured.
    NoMeteredItem { user_id: Uuid },
    /// The deduction created no new overage.
    NoNewOverage { user_id: Uuid, total_overage: i64 },
    /// New overage units were reported to Stripe.
    Reported {
        user_id: Uuid,
        new_overage_units: i64,
        total_overage: i64,
    },
}

/// New overage units created by a deduction of `tokens_just_used`, given
/// the post-deduction `tokens_used_this_period` and the period baseline.
pub fn overage_delta(tokens_used_this_period: i64, tokens_just_used: i64, monthly_tokens: i64) -> i64 {
    let current = (tokens_used_this_period - monthly_tokens).max(0);
    let previous = ((tokens_used_this_period - tokens_just_used) - monthly_tokens).max(0);
    current - previous
}

/// Reports incremental overage to Stripe for overage-eligible plans.
#[derive(Clone)]
pub struct OverageReporter {
    stripe: StripeClient,
    pool: PgPool,
}

impl OverageReporter {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self { stripe, pool }
    }

    /// Report the overage created by a deduction of `tokens_just_used`.
    ///
    /// Called after the ledger commit, so the balance row already reflects
    /// the deduction. No-ops for plans that do not bill overage and for
    /// subscriptions without a metered item.
    pub async fn report_usage(
        &self,
        user_id: Uuid,
        tokens_just_used: i64,
    ) -> BillingResult<UsageReportResult> {
        let sub: Option<(String, Option<String>)> = sqlx::query_as(
            "SELECT plan_type, stripe_metered_item_id FROM subscriptions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((plan_str, metered_item_id)) = sub else {
            return Ok(UsageReportResult::NotEligible { user_id });
        };
        let plan = PlanType::parse(&plan_str);
        if !matches!(plan.map(|p| p.policy()), Some(TokenPolicy::OverageEligible)) {
            return Ok(UsageReportResult::NotEligible { user_id });
        }
        let Some(metered_item_id) = metered_item_id else {
            tracing::debug!(
                user_id = %user_id,
                plan = %plan_str,
                "No metered item on subscription, skipping usage report"
            );
            return Ok(UsageReportResult::NoMeteredItem { user_id });
        };

        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT tokens_used_this_period, monthly_tokens FROM token_balances WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some((tokens_used, monthly_tokens)) = row else {
            return Ok(UsageReportResult::NotEligible { user_id });
        };

        let total_overage = (tokens_used - monthly_tokens).max(0);
        let delta = overage_delta(tokens_used, tokens_just_used, monthly_tokens);
        if delta <= 0 {
            return Ok(UsageReportResult::NoNewOverage {
                user_id,
                total_overage,
            });
        }

        let item_id: SubscriptionItemId = metered_item_id
            .parse()
            .map_err(|e| BillingError::StripeApi(format!("Invalid metered item ID: {}", e)))?;

        let params = CreateUsageRecord {
            quantity: delta as u64,
            action: Some(UsageRecordAction::Increment),
            timestamp: Some(OffsetDateTime::now_utc().unix_timestamp()),
        };
        UsageRecord::create(self.stripe.inner(), &item_id, params).await?;

        tracing::info!(
            user_id = %user_id,
            new_overage_units = delta,
            total_overage = total_overage,
            "Reported incremental overage to Stripe"
        );

        Ok(UsageReportResult::Reported {
            user_id,
            new_overage_units: delta,
            total_overage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_is_zero_below_threshold() {
        assert_eq!(overage_delta(50, 10, 100), 0);
        assert_eq!(overage_delta(100, 10, 100), 0);
    }

    #[test]
    fn delta_counts_only_the_crossing_part() {
        // Went from 95 to 105 used of 100: only 5 units are new overage.
        assert_eq!(overage_delta(105, 10, 100), 5);
    }

    #[test]
    fn delta_is_full_amount_once_past_threshold() {
        // 100 -> 105 used of 100: all 5 are new.
        assert_eq!(overage_delta(105, 5, 100), 5);
        // 105 -> 112 used of 100: all 7 are new.
        assert_eq!(overage_delta(112, 7, 100), 7);
    }
}
