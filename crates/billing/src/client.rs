//! Stripe client wrapper and configuration.
//!
//! Wraps the async-stripe client together with the price-id table sourced
//! from the environment. Price ids come in two flavors per paid plan: the
//! licensed base price and (for overage-eligible plans) a metered overage
//! price. Plan resolution from a webhook's price id must skip the
//! overage-only prices, which is why both tables live here.

use clipcast_shared::PlanType;

use crate::error::{BillingError, BillingResult};

/// Stripe price ids for each plan, loaded from the environment.
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub free: Option<String>,
    pub free_daily: Option<String>,
    pub starter: Option<String>,
    pub creator: Option<String>,
    pub unlimited: Option<String>,
    /// Metered overage prices. Never used to resolve a plan from a webhook.
    pub starter_overage: Option<String>,
    pub creator_overage: Option<String>,
}

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
}

impl StripeConfig {
    /// Load configuration from environment variables. Fails fast on the
    /// required keys; price ids are optional so partial environments
    /// (tests, staging without every plan) still start.
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;

        let price_ids = PriceIds {
            free: std::env::var("STRIPE_PRICE_FREE").ok(),
            free_daily: std::env::var("STRIPE_PRICE_FREE_DAILY").ok(),
            starter: std::env::var("STRIPE_PRICE_STARTER").ok(),
            creator: std::env::var("STRIPE_PRICE_CREATOR").ok(),
            unlimited: std::env::var("STRIPE_PRICE_UNLIMITED").ok(),
            starter_overage: std::env::var("STRIPE_PRICE_STARTER_OVERAGE").ok(),
            creator_overage: std::env::var("STRIPE_PRICE_CREATOR_OVERAGE").ok(),
        };

        Ok(Self {
            secret_key,
            webhook_secret,
            price_ids,
        })
    }

    /// Base (licensed) price id for a plan.
    pub fn price_id_for_plan(&self, plan: PlanType) -> Option<&str> {
        match plan {
            PlanType::Free => self.price_ids.free.as_deref(),
            PlanType::FreeDaily => self.price_ids.free_daily.as_deref(),
            PlanType::Starter => self.price_ids.starter.as_deref(),
            PlanType::Creator => self.price_ids.creator.as_deref(),
            PlanType::Unlimited => self.price_ids.unlimited.as_deref(),
        }
    }

    /// Metered overage price id for a plan, if the plan bills overage.
    pub fn overage_price_id_for_plan(&self, plan: PlanType) -> Option<&str> {
        match plan {
            PlanType::Starter => self.price_ids.starter_overage.as_deref(),
            PlanType::Creator => self.price_ids.creator_overage.as_deref(),
            _ => None,
        }
    }

    /// True if the price id is one of the metered overage prices.
    pub fn is_overage_price(&self, price_id: &str) -> bool {
        [
            self.price_ids.starter_overage.as_deref(),
            self.price_ids.creator_overage.as_deref(),
        ]
        .into_iter()
        .flatten()
        .any(|p| p == price_id)
    }

    /// Resolve a plan from a subscription item's price id, skipping
    /// overage-only prices.
    pub fn plan_for_price_id(&self, price_id: &str) -> Option<PlanType> {
        if self.is_overage_price(price_id) {
            return None;
        }
        let pairs = [
            (self.price_ids.free.as_deref(), PlanType::Free),
            (self.price_ids.free_daily.as_deref(), PlanType::FreeDaily),
            (self.price_ids.starter.as_deref(), PlanType::Starter),
            (self.price_ids.creator.as_deref(), PlanType::Creator),
            (self.price_ids.unlimited.as_deref(), PlanType::Unlimited),
        ];
        pairs
            .into_iter()
            .find(|(id, _)| *id == Some(price_id))
            .map(|(_, plan)| plan)
    }
}

/// Shared Stripe client handle.
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    /// The underlying async-stripe client for direct API calls.
    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_prices() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_x".to_string(),
            webhook_secret: "whsec_x".to_string(),
            price_ids: PriceIds {
                free: Some("price_free".to_string()),
                free_daily: Some("price_free_daily".to_string()),
                starter: Some("price_starter".to_string()),
                creator: Some("price_creator".to_string()),
                unlimited: Some("price_unlimited".to_string()),
                starter_overage: Some("price_starter_ovr".to_string()),
                creator_overage: Some("price_creator_ovr".to_string()),
            },
        }
    }

    #[test]
    fn plan_resolution_skips_overage_prices() {
        let config = config_with_prices();
        assert_eq!(config.plan_for_price_id("price_starter"), Some(PlanType::Starter));
        assert_eq!(config.plan_for_price_id("price_starter_ovr"), None);
        assert_eq!(config.plan_for_price_id("price_creator_ovr"), None);
        assert_eq!(config.plan_for_price_id("price_unknown"), None);
    }

    #[test]
    fn overage_price_only_for_overage_eligible_plans() {
        let config = config_with_prices();
        assert_eq!(config.overage_price_id_for_plan(PlanType::Starter), Some("price_starter_ovr"));
        assert_eq!(config.overage_price_id_for_plan(PlanType::Free), None);
        assert_eq!(config.overage_price_id_for_plan(PlanType::Unlimited), None);
    }
}
