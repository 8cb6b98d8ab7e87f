//! Durable subscription records.
//!
//! One row per user, mirroring the provider's view of the subscription.
//! The row is replaced (deleted and re-inserted) on plan switches rather
//! than updated in place, which avoids unique-constraint collisions when
//! the provider issues a new subscription id and stops state leaking from
//! the old plan. The upsert path still exists for webhook-driven sync,
//! where the user keeps the same row across status/period updates.

use clipcast_shared::{PlanType, SubscriptionStatus};
use sqlx::PgPool;
use stripe::{Subscription, SubscriptionStatus as StripeSubStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// A user's current subscription, as last synced from the provider.
#[derive(Debug, Clone)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_type: PlanType,
    pub status: SubscriptionStatus,
    pub stripe_subscription_id: String,
    pub stripe_customer_id: String,
    pub stripe_metered_item_id: Option<String>,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    /// Balance snapshotted on entry to the unlimited plan, restored on exit.
    pub preserved_tokens_balance: Option<i64>,
    pub preserved_plan_type: Option<PlanType>,
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    plan_type: String,
    status: String,
    stripe_subscription_id: String,
    stripe_customer_id: String,
    stripe_metered_item_id: Option<String>,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    cancel_at_period_end: bool,
    canceled_at: Option<OffsetDateTime>,
    preserved_tokens_balance: Option<i64>,
    preserved_plan_type: Option<String>,
}

impl TryFrom<SubscriptionRow> for SubscriptionRecord {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let plan_type = PlanType::parse(&row.plan_type).ok_or_else(|| {
            BillingError::Internal(format!(
                "Unknown plan_type '{}' in subscription row",
                row.plan_type
            ))
        })?;
        let status = SubscriptionStatus::parse(&row.status).ok_or_else(|| {
            BillingError::Internal(format!("Unknown status '{}' in subscription row", row.status))
        })?;
        Ok(SubscriptionRecord {
            id: row.id,
            user_id: row.user_id,
            plan_type,
            status,
            stripe_subscription_id: row.stripe_subscription_id,
            stripe_customer_id: row.stripe_customer_id,
            stripe_metered_item_id: row.stripe_metered_item_id,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            canceled_at: row.canceled_at,
            preserved_tokens_balance: row.preserved_tokens_balance,
            preserved_plan_type: row.preserved_plan_type.as_deref().and_then(PlanType::parse),
        })
    }
}

/// Map the provider's subscription status onto ours.
pub fn map_stripe_status(status: StripeSubStatus) -> SubscriptionStatus {
    match status {
        StripeSubStatus::Active => SubscriptionStatus::Active,
        StripeSubStatus::Trialing => SubscriptionStatus::Trialing,
        StripeSubStatus::PastDue => SubscriptionStatus::PastDue,
        StripeSubStatus::Canceled => SubscriptionStatus::Canceled,
        StripeSubStatus::Unpaid => SubscriptionStatus::Unpaid,
        StripeSubStatus::Incomplete => SubscriptionStatus::Incomplete,
        StripeSubStatus::IncompleteExpired => SubscriptionStatus::IncompleteExpired,
        StripeSubStatus::Paused => SubscriptionStatus::Paused,
    }
}

/// Find the metered subscription item (usage_type = "metered") used for
/// overage billing, if the subscription carries one.
pub fn find_metered_item_id(subscription: &Subscription) -> Option<String> {
    subscription
        .items
        .data
        .iter()
        .find(|item| {
            item.price
                .as_ref()
                .and_then(|p| p.recurring.as_ref())
                .map(|r| r.usage_type == stripe::RecurringUsageType::Metered)
                .unwrap_or(false)
        })
        .map(|item| item.id.to_string())
}

/// First non-metered price id on the subscription; this is the licensed
/// base price that identifies the plan.
pub fn find_base_price_id(subscription: &Subscription) -> Option<String> {
    subscription
        .items
        .data
        .iter()
        .find(|item| {
            item.price
                .as_ref()
                .and_then(|p| p.recurring.as_ref())
                .map(|r| r.usage_type != stripe::RecurringUsageType::Metered)
                .unwrap_or(true)
        })
        .and_then(|item| item.price.as_ref())
        .map(|p| p.id.to_string())
}

/// Store for subscription rows.
#[derive(Clone)]
pub struct SubscriptionStore {
    pool: PgPool,
}

impl SubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_user(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, plan_type, status,
                   stripe_subscription_id, stripe_customer_id, stripe_metered_item_id,
                   current_period_start, current_period_end,
                   cancel_at_period_end, canceled_at,
                   preserved_tokens_balance, preserved_plan_type
            FROM subscriptions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SubscriptionRecord::try_from).transpose()
    }

    pub async fn get_by_stripe_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, plan_type, status,
                   stripe_subscription_id, stripe_customer_id, stripe_metered_item_id,
                   current_period_start, current_period_end,
                   cancel_at_period_end, canceled_at,
                   preserved_tokens_balance, preserved_plan_type
            FROM subscriptions
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(SubscriptionRecord::try_from).transpose()
    }

    /// Upsert the user's subscription row from the provider's subscription
    /// object. ON CONFLICT targets the user_id unique index: after a
    /// cancel-and-recreate the provider hands out a new subscription id but
    /// the user still has exactly one row.
    pub async fn upsert_from_stripe(
        &self,
        user_id: Uuid,
        subscription: &Subscription,
        plan: PlanType,
    ) -> BillingResult<()> {
        let status = map_stripe_status(subscription.status);
        let metered_item_id = find_metered_item_id(subscription);

        if metered_item_id.is_some() {
            tracing::debug!(
                user_id = %user_id,
                subscription_id = %subscription.id,
                metered_item_id = ?metered_item_id,
                "Found metered subscription item for overage billing"
            );
        }

        let current_period_start =
            OffsetDateTime::from_unix_timestamp(subscription.current_period_start)
                .unwrap_or(OffsetDateTime::now_utc());
        let current_period_end =
            OffsetDateTime::from_unix_timestamp(subscription.current_period_end)
                .unwrap_or(OffsetDateTime::now_utc());
        let canceled_at = subscription
            .canceled_at
            .map(|t| OffsetDateTime::from_unix_timestamp(t).unwrap_or(OffsetDateTime::now_utc()));

        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                id, user_id, plan_type, status,
                stripe_subscription_id, stripe_customer_id, stripe_metered_item_id,
                current_period_start, current_period_end,
                cancel_at_period_end, canceled_at, created_at, updated_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW()
            )
            ON CONFLICT (user_id) DO UPDATE SET
                plan_type = EXCLUDED.plan_type,
                status = EXCLUDED.status,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                stripe_metered_item_id = EXCLUDED.stripe_metered_item_id,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                canceled_at = EXCLUDED.canceled_at,
                updated_at = NOW()
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(plan.as_str())
        .bind(status.as_str())
        .bind(subscription.id.as_str())
        .bind(&customer_id)
        .bind(&metered_item_id)
        .bind(current_period_start)
        .bind(current_period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(canceled_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark a subscription canceled by its provider id. Token balances are
    /// untouched: cancellation alone never clears a balance.
    pub async fn mark_canceled(&self, stripe_subscription_id: &str) -> BillingResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = 'canceled', canceled_at = NOW(), updated_at = NOW()
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    /// Delete the user's subscription row. Used by the transition
    /// orchestrator before recreating, to dodge the user_id unique
    /// constraint on insert.
    pub async fn delete_for_user(&self, user_id: Uuid) -> BillingResult<()> {
        sqlx::query("DELETE FROM subscriptions WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record what to restore when the user later exits the unlimited plan.
    pub async fn set_preserved(
        &self,
        user_id: Uuid,
        preserved_tokens: i64,
        preserved_plan: PlanType,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET preserved_tokens_balance = $2, preserved_plan_type = $3, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(preserved_tokens)
        .bind(preserved_plan.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Look up the owning user for a provider customer id.
    pub async fn user_for_customer(&self, customer_id: &str) -> BillingResult<Option<Uuid>> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(id,)| id))
    }

    /// Attach a provider customer id to the user record if it has none.
    pub async fn attach_customer_if_missing(
        &self,
        user_id: Uuid,
        customer_id: &str,
    ) -> BillingResult<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE users
            SET stripe_customer_id = $1, updated_at = NOW()
            WHERE id = $2 AND stripe_customer_id IS NULL
            "#,
        )
        .bind(customer_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    /// The user's stored provider customer id, if any.
    pub async fn customer_for_user(&self, user_id: Uuid) -> BillingResult<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT stripe_customer_id FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((customer,)) => Ok(customer),
            None => Err(BillingError::NotFound(format!("User {} not found", user_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripe_status_mapping_covers_all_variants() {
        assert_eq!(map_stripe_status(StripeSubStatus::Active), SubscriptionStatus::Active);
        assert_eq!(map_stripe_status(StripeSubStatus::Trialing), SubscriptionStatus::Trialing);
        assert_eq!(map_stripe_status(StripeSubStatus::PastDue), SubscriptionStatus::PastDue);
        assert_eq!(map_stripe_status(StripeSubStatus::Canceled), SubscriptionStatus::Canceled);
        assert_eq!(map_stripe_status(StripeSubStatus::Unpaid), SubscriptionStatus::Unpaid);
    }
}
