//! Billing invariants.
//!
//! Runnable consistency checks for the ledger and subscription state.
//! These can be run after any mutation or webhook replay to verify the
//! system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - system may be charging incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for multiple subscriptions violation
#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    user_id: Uuid,
    sub_count: i64,
}

/// Row type for conservation violation
#[derive(Debug, sqlx::FromRow)]
struct ConservationRow {
    user_id: Uuid,
    plan_type: String,
    tokens_remaining: i64,
    tokens_used_this_period: i64,
    monthly_tokens: i64,
}

/// Row type for negative balance violation
#[derive(Debug, sqlx::FromRow)]
struct NegativeBalanceRow {
    user_id: Uuid,
    tokens_remaining: i64,
    tokens_used_this_period: i64,
}

/// Row type for ledger/balance mismatch violation
#[derive(Debug, sqlx::FromRow)]
struct LedgerMismatchRow {
    user_id: Uuid,
    tokens_remaining: i64,
    last_balance_after: i64,
}

/// Row type for period mirror drift violation
#[derive(Debug, sqlx::FromRow)]
struct PeriodDriftRow {
    user_id: Uuid,
    balance_period_end: Option<OffsetDateTime>,
    subscription_period_end: OffsetDateTime,
}

/// Row type for missing Stripe customer violation
#[derive(Debug, sqlx::FromRow)]
struct MissingStripeCustomerRow {
    user_id: Uuid,
    plan_type: String,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_subscription_per_user().await?);
        violations.extend(self.check_free_tier_conservation().await?);
        violations.extend(self.check_no_negative_balance().await?);
        violations.extend(self.check_ledger_matches_balance().await?);
        violations.extend(self.check_period_mirror().await?);
        violations.extend(self.check_stripe_customer_exists().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: At most 1 subscription row per user
    ///
    /// Multiple rows would cause double-billing and ambiguous plan policy.
    async fn check_single_subscription_per_user(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) as sub_count
            FROM subscriptions
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_subscription_per_user".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} subscription rows (expected at most 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Free-tier conservation
    ///
    /// For hard-limit plans there is no overage escape valve, so
    /// `tokens_remaining + tokens_used_this_period` must equal
    /// `monthly_tokens` at all times.
    async fn check_free_tier_conservation(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ConservationRow> = sqlx::query_as(
            r#"
            SELECT
                b.user_id,
                s.plan_type,
                b.tokens_remaining,
                b.tokens_used_this_period,
                b.monthly_tokens
            FROM token_balances b
            JOIN subscriptions s ON s.user_id = b.user_id
            WHERE s.plan_type IN ('free', 'free_daily')
              AND b.tokens_remaining + b.tokens_used_this_period != b.monthly_tokens
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "free_tier_conservation".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Free-tier balance broken: {} remaining + {} used != {} monthly",
                    row.tokens_remaining, row.tokens_used_this_period, row.monthly_tokens
                ),
                context: serde_json::json!({
                    "plan_type": row.plan_type,
                    "tokens_remaining": row.tokens_remaining,
                    "tokens_used_this_period": row.tokens_used_this_period,
                    "monthly_tokens": row.monthly_tokens,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: Balances never go negative
    ///
    /// `tokens_remaining` is clamped at zero by policy (overage is tracked
    /// via usage exceeding the baseline, never a negative balance), and
    /// `tokens_used_this_period` is monotonically non-negative.
    async fn check_no_negative_balance(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeBalanceRow> = sqlx::query_as(
            r#"
            SELECT user_id, tokens_remaining, tokens_used_this_period
            FROM token_balances
            WHERE tokens_remaining < 0 OR tokens_used_this_period < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_negative_balance".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Negative balance field: remaining={}, used={}",
                    row.tokens_remaining, row.tokens_used_this_period
                ),
                context: serde_json::json!({
                    "tokens_remaining": row.tokens_remaining,
                    "tokens_used_this_period": row.tokens_used_this_period,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: Transaction log replays to the current balance
    ///
    /// The newest transaction's `balance_after` must equal the stored
    /// `tokens_remaining` (sentinel rows from unlimited plans excluded).
    async fn check_ledger_matches_balance(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<LedgerMismatchRow> = sqlx::query_as(
            r#"
            SELECT
                b.user_id,
                b.tokens_remaining,
                t.balance_after as last_balance_after
            FROM token_balances b
            JOIN LATERAL (
                SELECT balance_after
                FROM token_transactions
                WHERE user_id = b.user_id AND balance_after >= 0
                ORDER BY created_at DESC
                LIMIT 1
            ) t ON true
            WHERE t.balance_after != b.tokens_remaining
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "ledger_matches_balance".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Latest transaction ends at {} but balance holds {}",
                    row.last_balance_after, row.tokens_remaining
                ),
                context: serde_json::json!({
                    "tokens_remaining": row.tokens_remaining,
                    "last_balance_after": row.last_balance_after,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: Balance period mirrors the subscription period
    ///
    /// The balance's stored period bounds are the staleness detector for
    /// renewal classification; drift past an hour on a live subscription
    /// means missed syncs.
    async fn check_period_mirror(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PeriodDriftRow> = sqlx::query_as(
            r#"
            SELECT
                b.user_id,
                b.period_end as balance_period_end,
                s.current_period_end as subscription_period_end
            FROM token_balances b
            JOIN subscriptions s ON s.user_id = b.user_id
            WHERE s.status IN ('active', 'trialing')
              AND (b.period_end IS NULL
                   OR ABS(EXTRACT(EPOCH FROM (b.period_end - s.current_period_end))) > 3600)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "period_mirror".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Balance period_end {:?} drifted from subscription period_end {}",
                    row.balance_period_end, row.subscription_period_end
                ),
                context: serde_json::json!({
                    "balance_period_end": row.balance_period_end.map(|t| t.to_string()),
                    "subscription_period_end": row.subscription_period_end.to_string(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: Paid plans have a Stripe customer
    ///
    /// Users on paid plans should have a Stripe customer id, or the next
    /// invoice has nobody to bill.
    async fn check_stripe_customer_exists(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MissingStripeCustomerRow> = sqlx::query_as(
            r#"
            SELECT
                s.user_id,
                s.plan_type
            FROM subscriptions s
            JOIN users u ON u.id = s.user_id
            WHERE s.plan_type IN ('starter', 'creator', 'unlimited')
              AND u.stripe_customer_id IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "stripe_customer_exists".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User on plan '{}' has no Stripe customer",
                    row.plan_type
                ),
                context: serde_json::json!({
                    "plan_type": row.plan_type,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_subscription_per_user" => self.check_single_subscription_per_user().await,
            "free_tier_conservation" => self.check_free_tier_conservation().await,
            "no_negative_balance" => self.check_no_negative_balance().await,
            "ledger_matches_balance" => self.check_ledger_matches_balance().await,
            "period_mirror" => self.check_period_mirror().await,
            "stripe_customer_exists" => self.check_stripe_customer_exists().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_subscription_per_user",
            "free_tier_conservation",
            "no_negative_balance",
            "ledger_matches_balance",
            "period_mirror",
            "stripe_customer_exists",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 6);
        assert!(checks.contains(&"free_tier_conservation"));
        assert!(checks.contains(&"single_subscription_per_user"));
    }
}
