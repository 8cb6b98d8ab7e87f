//! Shared domain types for the Clipcast backend.
//!
//! Holds the plan/tier model used by every crate: the closed `PlanType`
//! enum with its token policy table, subscription status, and the ledger
//! transaction type vocabulary.

use serde::{Deserialize, Serialize};

/// Sentinel recorded in audit transactions for unlimited-plan balances.
/// Unlimited balances are never decremented; the sentinel marks rows where
/// the numeric before/after values carry no meaning.
pub const UNLIMITED_SENTINEL: i64 = -1;

/// Subscription plan tiers.
///
/// A closed enum rather than free-form strings: every policy decision in
/// the ledger dispatches on `TokenPolicy`, so adding a tier means extending
/// this enum and the policy table in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    #[default]
    Free,
    FreeDaily,
    Starter,
    Creator,
    Unlimited,
}

/// How a plan treats token consumption once the included allocation runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPolicy {
    /// Hard floor at zero. Deductions that would need overage are rejected.
    HardLimit,
    /// Included tokens first, then metered overage billed to the provider.
    OverageEligible,
    /// No numeric balance at all; deductions are audit-only.
    Unlimited,
}

impl PlanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanType::Free => "free",
            PlanType::FreeDaily => "free_daily",
            PlanType::Starter => "starter",
            PlanType::Creator => "creator",
            PlanType::Unlimited => "unlimited",
        }
    }

    /// Parse a stored plan string. Unknown values map to `None` so callers
    /// decide whether drift is an error or a fallback-to-free situation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "free" => Some(PlanType::Free),
            "free_daily" => Some(PlanType::FreeDaily),
            "starter" => Some(PlanType::Starter),
            "creator" => Some(PlanType::Creator),
            "unlimited" => Some(PlanType::Unlimited),
            _ => None,
        }
    }

    /// The token policy table.
    pub fn policy(&self) -> TokenPolicy {
        match self {
            PlanType::Free | PlanType::FreeDaily => TokenPolicy::HardLimit,
            PlanType::Starter | PlanType::Creator => TokenPolicy::OverageEligible,
            PlanType::Unlimited => TokenPolicy::Unlimited,
        }
    }

    /// Plans billed through the provider with a non-zero base price.
    pub fn is_paid(&self) -> bool {
        matches!(self, PlanType::Starter | PlanType::Creator | PlanType::Unlimited)
    }

    /// Plans that bank a daily grant instead of a monthly allocation.
    pub fn is_daily_accrual(&self) -> bool {
        matches!(self, PlanType::FreeDaily)
    }
}

impl std::fmt::Display for PlanType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Subscription lifecycle status, mirroring the provider's vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::IncompleteExpired => "incomplete_expired",
            SubscriptionStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SubscriptionStatus::Active),
            "trialing" => Some(SubscriptionStatus::Trialing),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" => Some(SubscriptionStatus::Canceled),
            "unpaid" => Some(SubscriptionStatus::Unpaid),
            "incomplete" => Some(SubscriptionStatus::Incomplete),
            "incomplete_expired" => Some(SubscriptionStatus::IncompleteExpired),
            "paused" => Some(SubscriptionStatus::Paused),
            _ => None,
        }
    }

    /// Statuses under which a period advance may count as a renewal.
    pub fn counts_for_renewal(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ledger transaction types. The transaction log is append-only; these
/// values are the full vocabulary of what can appear in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Token consumption after a successful platform upload.
    Upload,
    /// Tokens purchased outright.
    Purchase,
    /// Tokens returned after a failed or refunded upload.
    Refund,
    /// Period reset (renewal overwrite or additive plan-switch grant).
    Reset,
    /// Admin or daily-accrual grant.
    Grant,
    /// Admin test deduction, kept out of revenue reporting.
    AdminTest,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Upload => "upload",
            TransactionType::Purchase => "purchase",
            TransactionType::Refund => "refund",
            TransactionType::Reset => "reset",
            TransactionType::Grant => "grant",
            TransactionType::AdminTest => "admin_test",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upload" => Some(TransactionType::Upload),
            "purchase" => Some(TransactionType::Purchase),
            "refund" => Some(TransactionType::Refund),
            "reset" => Some(TransactionType::Reset),
            "grant" => Some(TransactionType::Grant),
            "admin_test" => Some(TransactionType::AdminTest),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_type_round_trips_through_strings() {
        for plan in [
            PlanType::Free,
            PlanType::FreeDaily,
            PlanType::Starter,
            PlanType::Creator,
            PlanType::Unlimited,
        ] {
            assert_eq!(PlanType::parse(plan.as_str()), Some(plan));
        }
        assert_eq!(PlanType::parse("enterprise"), None);
    }

    #[test]
    fn policy_table_matches_tier_semantics() {
        assert_eq!(PlanType::Free.policy(), TokenPolicy::HardLimit);
        assert_eq!(PlanType::FreeDaily.policy(), TokenPolicy::HardLimit);
        assert_eq!(PlanType::Starter.policy(), TokenPolicy::OverageEligible);
        assert_eq!(PlanType::Creator.policy(), TokenPolicy::OverageEligible);
        assert_eq!(PlanType::Unlimited.policy(), TokenPolicy::Unlimited);
    }

    #[test]
    fn renewal_only_counts_for_live_statuses() {
        assert!(SubscriptionStatus::Active.counts_for_renewal());
        assert!(SubscriptionStatus::Trialing.counts_for_renewal());
        assert!(!SubscriptionStatus::Canceled.counts_for_renewal());
        assert!(!SubscriptionStatus::PastDue.counts_for_renewal());
    }
}
