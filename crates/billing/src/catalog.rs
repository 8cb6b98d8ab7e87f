//! Plan catalog: economic terms per plan, synced from Stripe.
//!
//! The catalog is an injected cache object owned by the service context,
//! not a process-wide singleton. Entries refresh from the Stripe product
//! catalog on a TTL; if Stripe is unreachable the bundled static terms are
//! served so the ledger never blocks on the provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clipcast_shared::PlanType;
use stripe::{Expandable, Price, PriceId};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::client::StripeClient;
use crate::error::BillingResult;

/// Billing interval for a plan's base price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BillingInterval {
    Day,
    Month,
    Year,
}

/// Economic terms for one plan.
///
/// For daily-accrual plans `included_tokens` is the per-day grant and
/// `max_accrual` the banking cap; for everything else `included_tokens` is
/// the per-period allocation (−1 = unlimited) and `max_accrual` is unset.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlanTerms {
    pub plan: PlanType,
    pub price_id: Option<String>,
    pub product_id: Option<String>,
    pub name: String,
    pub included_tokens: i64,
    pub overage_unit_price_cents: Option<i64>,
    pub hidden: bool,
    pub max_accrual: Option<i64>,
    pub interval: BillingInterval,
}

impl PlanTerms {
    /// Tokens granted at a period reset. Unlimited plans return the −1
    /// sentinel and are never reset numerically.
    pub fn allocation(&self) -> i64 {
        self.included_tokens
    }
}

/// Bundled static terms, used at startup and whenever Stripe is unreachable.
fn static_terms() -> HashMap<PlanType, PlanTerms> {
    let mut terms = HashMap::new();
    terms.insert(
        PlanType::Free,
        PlanTerms {
            plan: PlanType::Free,
            price_id: None,
            product_id: None,
            name: "Free".to_string(),
            included_tokens: 25,
            overage_unit_price_cents: None,
            hidden: false,
            max_accrual: None,
            interval: BillingInterval::Month,
        },
    );
    terms.insert(
        PlanType::FreeDaily,
        PlanTerms {
            plan: PlanType::FreeDaily,
            price_id: None,
            product_id: None,
            name: "Free Daily".to_string(),
            included_tokens: 3,
            overage_unit_price_cents: None,
            hidden: true,
            max_accrual: Some(10),
            interval: BillingInterval::Day,
        },
    );
    terms.insert(
        PlanType::Starter,
        PlanTerms {
            plan: PlanType::Starter,
            price_id: None,
            product_id: None,
            name: "Starter".to_string(),
            included_tokens: 300,
            overage_unit_price_cents: Some(5),
            hidden: false,
            max_accrual: None,
            interval: BillingInterval::Month,
        },
    );
    terms.insert(
        PlanType::Creator,
        PlanTerms {
            plan: PlanType::Creator,
            price_id: None,
            product_id: None,
            name: "Creator".to_string(),
            included_tokens: 1250,
            overage_unit_price_cents: Some(4),
            hidden: false,
            max_accrual: None,
            interval: BillingInterval::Month,
        },
    );
    terms.insert(
        PlanType::Unlimited,
        PlanTerms {
            plan: PlanType::Unlimited,
            price_id: None,
            product_id: None,
            name: "Unlimited".to_string(),
            included_tokens: -1,
            overage_unit_price_cents: None,
            hidden: true,
            max_accrual: None,
            interval: BillingInterval::Month,
        },
    );
    terms
}

struct CatalogState {
    terms: HashMap<PlanType, PlanTerms>,
    refreshed_at: Option<OffsetDateTime>,
}

/// TTL-cached plan catalog.
#[derive(Clone)]
pub struct PlanCatalog {
    stripe: Option<StripeClient>,
    state: Arc<RwLock<CatalogState>>,
    ttl: Duration,
}

impl PlanCatalog {
    const DEFAULT_TTL: Duration = Duration::from_secs(6 * 60 * 60);

    pub fn new(stripe: StripeClient) -> Self {
        Self {
            stripe: Some(stripe),
            state: Arc::new(RwLock::new(CatalogState {
                terms: static_terms(),
                refreshed_at: None,
            })),
            ttl: Self::DEFAULT_TTL,
        }
    }

    /// Catalog that serves only the bundled terms. Used in tests and in
    /// minimal mode when Stripe is not configured.
    pub fn static_only() -> Self {
        Self {
            stripe: None,
            state: Arc::new(RwLock::new(CatalogState {
                terms: static_terms(),
                refreshed_at: Some(OffsetDateTime::now_utc()),
            })),
            ttl: Self::DEFAULT_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Terms for a plan, refreshing from Stripe first if the cache is stale.
    pub async fn terms(&self, plan: PlanType) -> BillingResult<PlanTerms> {
        self.refresh_if_stale().await;
        let state = self.state.read().await;
        state.terms.get(&plan).cloned().ok_or_else(|| {
            crate::error::BillingError::InvalidPlan(format!("No catalog entry for '{}'", plan))
        })
    }

    /// Included-token allocation for a plan (−1 = unlimited).
    pub async fn allocation(&self, plan: PlanType) -> BillingResult<i64> {
        Ok(self.terms(plan).await?.included_tokens)
    }

    /// Resolve a plan from a base price id. Falls through to a forced
    /// re-sync on a miss before giving up — the escape hatch for prices
    /// created in the Stripe console after the last refresh.
    pub async fn plan_for_price_id(&self, price_id: &str) -> Option<PlanType> {
        if let Some(stripe) = &self.stripe {
            if stripe.config().is_overage_price(price_id) {
                return None;
            }
            if let Some(plan) = stripe.config().plan_for_price_id(price_id) {
                return Some(plan);
            }
        }
        {
            let state = self.state.read().await;
            if let Some(plan) = Self::lookup_price(&state.terms, price_id) {
                return Some(plan);
            }
        }
        self.force_refresh().await;
        let state = self.state.read().await;
        Self::lookup_price(&state.terms, price_id)
    }

    fn lookup_price(terms: &HashMap<PlanType, PlanTerms>, price_id: &str) -> Option<PlanType> {
        terms
            .values()
            .find(|t| t.price_id.as_deref() == Some(price_id))
            .map(|t| t.plan)
    }

    /// Publicly listable plans (hidden entries excluded).
    pub async fn list_public(&self) -> Vec<PlanTerms> {
        self.refresh_if_stale().await;
        let state = self.state.read().await;
        let mut plans: Vec<PlanTerms> = state.terms.values().filter(|t| !t.hidden).cloned().collect();
        plans.sort_by_key(|t| t.included_tokens);
        plans
    }

    /// Drop the TTL and re-sync from Stripe now.
    pub async fn force_refresh(&self) {
        self.refresh_inner(true).await;
    }

    async fn refresh_if_stale(&self) {
        self.refresh_inner(false).await;
    }

    async fn refresh_inner(&self, force: bool) {
        let Some(stripe) = &self.stripe else {
            return;
        };

        if !force {
            let state = self.state.read().await;
            if let Some(at) = state.refreshed_at {
                let age = OffsetDateTime::now_utc() - at;
                if age < self.ttl {
                    return;
                }
            }
        }

        match self.fetch_from_stripe(stripe).await {
            Ok(fetched) => {
                let mut state = self.state.write().await;
                state.terms = fetched;
                state.refreshed_at = Some(OffsetDateTime::now_utc());
                tracing::debug!("Plan catalog refreshed from Stripe");
            }
            Err(e) => {
                // Serve the previous (or static) terms; the provider being
                // down must not block ledger policy decisions.
                let mut state = self.state.write().await;
                state.refreshed_at = Some(OffsetDateTime::now_utc());
                tracing::warn!(
                    error = %e,
                    "Plan catalog sync failed, serving cached/static terms"
                );
            }
        }
    }

    /// Pull each configured plan's price (and product metadata) from Stripe
    /// and overlay it onto the static terms.
    async fn fetch_from_stripe(
        &self,
        stripe: &StripeClient,
    ) -> BillingResult<HashMap<PlanType, PlanTerms>> {
        let mut terms = static_terms();

        for (plan, entry) in terms.iter_mut() {
            let Some(price_id) = stripe.config().price_id_for_plan(*plan) else {
                continue;
            };
            let price_id: PriceId = price_id
                .parse()
                .map_err(|e| crate::error::BillingError::Config(format!("Bad price id: {}", e)))?;

            let price = Price::retrieve(stripe.inner(), &price_id, &["product"]).await?;
            entry.price_id = Some(price.id.to_string());

            match price.product {
                Some(Expandable::Object(product)) => {
                    entry.product_id = Some(product.id.to_string());
                    if let Some(name) = product.name {
                        entry.name = name;
                    }
                    if let Some(metadata) = product.metadata {
                        if let Some(v) =
                            metadata.get("included_tokens").and_then(|v| v.parse().ok())
                        {
                            entry.included_tokens = v;
                        }
                        if let Some(v) = metadata.get("max_accrual").and_then(|v| v.parse().ok()) {
                            entry.max_accrual = Some(v);
                        }
                        if let Some(v) = metadata.get("hidden") {
                            entry.hidden = v == "true";
                        }
                    }
                }
                Some(Expandable::Id(product_id)) => {
                    entry.product_id = Some(product_id.to_string());
                }
                None => {}
            }

            // Overage unit price comes off the metered price object.
            if let Some(overage_id) = stripe.config().overage_price_id_for_plan(*plan) {
                let overage_id: PriceId = overage_id.parse().map_err(|e| {
                    crate::error::BillingError::Config(format!("Bad overage price id: {}", e))
                })?;
                let overage_price = Price::retrieve(stripe.inner(), &overage_id, &[]).await?;
                if let Some(unit_amount) = overage_price.unit_amount {
                    entry.overage_unit_price_cents = Some(unit_amount);
                }
            }
        }

        Ok(terms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_catalog_serves_all_plans() {
        let catalog = PlanCatalog::static_only();
        assert_eq!(catalog.allocation(PlanType::Starter).await.unwrap(), 300);
        assert_eq!(catalog.allocation(PlanType::Creator).await.unwrap(), 1250);
        assert_eq!(catalog.allocation(PlanType::Unlimited).await.unwrap(), -1);
    }

    #[tokio::test]
    async fn daily_plan_carries_banking_cap() {
        let catalog = PlanCatalog::static_only();
        let terms = catalog.terms(PlanType::FreeDaily).await.unwrap();
        assert_eq!(terms.included_tokens, 3);
        assert_eq!(terms.max_accrual, Some(10));
        assert_eq!(terms.interval, BillingInterval::Day);
    }

    #[tokio::test]
    async fn public_listing_excludes_hidden_plans() {
        let catalog = PlanCatalog::static_only();
        let public = catalog.list_public().await;
        assert!(public.iter().all(|t| t.plan != PlanType::Unlimited));
        assert!(public.iter().all(|t| t.plan != PlanType::FreeDaily));
        assert!(public.iter().any(|t| t.plan == PlanType::Starter));
    }
}
