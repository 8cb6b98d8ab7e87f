//! Token ledger: per-user balances and the append-only transaction log.
//!
//! The ledger owns the only mutable billing state in the system. Every
//! mutation runs inside a database transaction that locks the balance row
//! (`SELECT ... FOR UPDATE`), so two uploads finishing at once cannot lose
//! an update. Policy decisions (hard limit vs. overage vs. unlimited) are
//! pure functions over the in-memory balance so they can be tested without
//! a database; the async methods are thin SQL shells around them.
//!
//! Insufficient tokens is an expected outcome, not an error: `deduct`
//! returns [`DeductOutcome::Insufficient`] with both numbers so callers can
//! show "need X, have Y".

use clipcast_shared::{PlanType, SubscriptionStatus, TokenPolicy, TransactionType, UNLIMITED_SENTINEL};
use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::overage::OverageReporter;

/// One user's mutable token balance.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct TokenBalance {
    pub user_id: Uuid,
    pub tokens_remaining: i64,
    pub tokens_used_this_period: i64,
    pub monthly_tokens: i64,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub last_reset_at: Option<OffsetDateTime>,
}

impl TokenBalance {
    fn zeroed(user_id: Uuid) -> Self {
        Self {
            user_id,
            tokens_remaining: 0,
            tokens_used_this_period: 0,
            monthly_tokens: 0,
            period_start: None,
            period_end: None,
            last_reset_at: None,
        }
    }

    /// Tokens consumed beyond the period's starting allocation.
    pub fn overage_used(&self) -> i64 {
        (self.tokens_used_this_period - self.monthly_tokens).max(0)
    }
}

/// Immutable row in the append-only transaction log.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub video_id: Option<Uuid>,
    pub transaction_type: String,
    pub tokens: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub metadata: serde_json::Value,
    pub subscription_id: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub grant_day: Option<Date>,
    pub created_at: OffsetDateTime,
}

/// Outcome of a deduction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeductOutcome {
    /// Balance mutated; the amount split into included and overage parts.
    Deducted { included_used: i64, overage_used: i64 },
    /// Unlimited plan: audit row written, numeric balance untouched.
    Unlimited,
    /// Policy rejection, zero mutation.
    Insufficient { required: i64, available: i64 },
}

impl DeductOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, DeductOutcome::Insufficient { .. })
    }
}

/// Pure deduction decision over an in-memory balance.
///
/// `plan` is `None` when the user has no subscription record, which is
/// treated like a hard-limit plan: granted tokens spend fine, overage never.
pub fn decide_deduct(plan: Option<PlanType>, balance: &TokenBalance, tokens: i64) -> DeductOutcome {
    if plan == Some(PlanType::Unlimited) {
        return DeductOutcome::Unlimited;
    }

    let included_used = tokens.min(balance.tokens_remaining.max(0));
    let overage_used = tokens - included_used;

    if overage_used > 0 {
        let overage_allowed = matches!(plan.map(|p| p.policy()), Some(TokenPolicy::OverageEligible));
        if !overage_allowed {
            return DeductOutcome::Insufficient {
                required: tokens,
                available: balance.tokens_remaining.max(0),
            };
        }
    }

    DeductOutcome::Deducted {
        included_used,
        overage_used,
    }
}

/// Apply a decided deduction to the balance. Caller must only pass a
/// `Deducted` split produced by [`decide_deduct`] for this balance.
pub fn apply_deduct(balance: &mut TokenBalance, included_used: i64, tokens: i64) {
    balance.tokens_remaining -= included_used;
    balance.tokens_used_this_period += tokens;
}

/// Apply a period reset. Renewal overwrites to the plan allocation
/// (tokens do not roll over); a plan switch or fresh subscription adds the
/// allocation on top of whatever is left, preserving grants and unspent
/// paid-tier tokens.
pub fn apply_reset(
    balance: &mut TokenBalance,
    allocation: i64,
    is_renewal: bool,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
) {
    if is_renewal {
        balance.tokens_remaining = allocation;
        balance.monthly_tokens = allocation;
    } else {
        balance.tokens_remaining += allocation;
        balance.monthly_tokens = balance.tokens_remaining;
    }
    balance.tokens_used_this_period = 0;
    balance.period_start = Some(period_start);
    balance.period_end = Some(period_end);
    balance.last_reset_at = Some(now);
}

/// How many tokens a daily-accrual grant may add without exceeding the
/// banking cap.
pub fn banked_grant_amount(tokens_remaining: i64, daily_grant: i64, max_accrual: i64) -> i64 {
    daily_grant.min((max_accrual - tokens_remaining).max(0))
}

/// New overage units a deduction of `tokens` would create, given the
/// current balance. Used for the admin pre-deduction preview.
pub fn overage_delta_preview(balance: &TokenBalance, tokens: i64) -> i64 {
    let after = (balance.tokens_used_this_period + tokens - balance.monthly_tokens).max(0);
    let before = (balance.tokens_used_this_period - balance.monthly_tokens).max(0);
    after - before
}

/// Token ledger service.
#[derive(Clone)]
pub struct TokenLedger {
    pool: PgPool,
    overage: Option<OverageReporter>,
}

impl TokenLedger {
    pub fn new(pool: PgPool, overage: OverageReporter) -> Self {
        Self {
            pool,
            overage: Some(overage),
        }
    }

    /// Ledger without a usage reporter. Overage is still tracked in the
    /// balance; it just is not pushed to Stripe. Used in minimal mode.
    pub fn without_reporter(pool: PgPool) -> Self {
        Self {
            pool,
            overage: None,
        }
    }

    /// Fetch the user's balance, creating a zeroed row if absent.
    pub async fn get_or_create_balance(&self, user_id: Uuid) -> BillingResult<TokenBalance> {
        sqlx::query(
            r#"
            INSERT INTO token_balances (user_id)
            VALUES ($1)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        let balance: TokenBalance = sqlx::query_as(
            r#"
            SELECT user_id, tokens_remaining, tokens_used_this_period, monthly_tokens,
                   period_start, period_end, last_reset_at
            FROM token_balances
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(balance)
    }

    /// The user's current plan and status, if a subscription record exists.
    pub async fn current_plan(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<(PlanType, SubscriptionStatus)>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT plan_type, status FROM subscriptions WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.and_then(|(plan, status)| {
            match (PlanType::parse(&plan), SubscriptionStatus::parse(&status)) {
                (Some(p), Some(s)) => Some((p, s)),
                _ => {
                    tracing::warn!(
                        user_id = %user_id,
                        plan = %plan,
                        status = %status,
                        "Subscription row has unrecognized plan or status"
                    );
                    None
                }
            }
        }))
    }

    /// Can the user afford `tokens_required` right now?
    ///
    /// Paid plans always pass (overage absorbs the rest); the check exists
    /// to gate free-tier queuing. With `include_queued`, the cost of
    /// not-yet-charged queued videos counts against the balance so a free
    /// user cannot queue more than they can afford.
    pub async fn check_available(
        &self,
        user_id: Uuid,
        tokens_required: i64,
        include_queued: bool,
    ) -> BillingResult<bool> {
        if tokens_required <= 0 {
            return Ok(true);
        }

        let plan = self.current_plan(user_id).await?.map(|(p, _)| p);
        match plan.map(|p| p.policy()) {
            Some(TokenPolicy::Unlimited) => return Ok(true),
            Some(TokenPolicy::OverageEligible) => return Ok(true),
            Some(TokenPolicy::HardLimit) | None => {}
        }

        let balance = self.get_or_create_balance(user_id).await?;

        let queued: i64 = if include_queued {
            let sum: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT COALESCE(SUM(tokens_required), 0)::BIGINT
                FROM videos
                WHERE user_id = $1 AND status = 'queued' AND tokens_charged = FALSE
                "#,
            )
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
            sum.unwrap_or(0)
        } else {
            0
        };

        Ok(balance.tokens_remaining >= tokens_required + queued)
    }

    /// Deduct tokens after an upload (or admin test).
    ///
    /// The ledger does not deduplicate deduct calls; upload pipelines set a
    /// per-video charged flag after the first successful deduction so later
    /// platform destinations for the same video do not charge again.
    pub async fn deduct(
        &self,
        user_id: Uuid,
        tokens: i64,
        transaction_type: TransactionType,
        video_id: Option<Uuid>,
        metadata: Option<serde_json::Value>,
    ) -> BillingResult<DeductOutcome> {
        if tokens <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "Deduct amount must be positive, got {}",
                tokens
            )));
        }

        let plan = self.current_plan(user_id).await?.map(|(p, _)| p);

        let mut tx = self.pool.begin().await?;
        let mut balance = self.lock_balance(&mut tx, user_id).await?;

        let outcome = decide_deduct(plan, &balance, tokens);
        match outcome {
            DeductOutcome::Insufficient {
                required,
                available,
            } => {
                tx.rollback().await?;
                tracing::info!(
                    user_id = %user_id,
                    required = required,
                    available = available,
                    plan = ?plan,
                    "Deduction rejected: insufficient tokens"
                );
                Ok(outcome)
            }
            DeductOutcome::Unlimited => {
                let meta = metadata.unwrap_or_else(|| serde_json::json!({}));
                self.insert_transaction(
                    &mut tx,
                    user_id,
                    video_id,
                    transaction_type,
                    -tokens,
                    UNLIMITED_SENTINEL,
                    UNLIMITED_SENTINEL,
                    meta,
                    None,
                    None,
                    None,
                    None,
                )
                .await?;
                tx.commit().await?;
                Ok(outcome)
            }
            DeductOutcome::Deducted {
                included_used,
                overage_used,
            } => {
                let before = balance.tokens_remaining;
                apply_deduct(&mut balance, included_used, tokens);
                self.store_balance(&mut tx, &balance).await?;

                let mut meta = metadata.unwrap_or_else(|| serde_json::json!({}));
                if let Some(obj) = meta.as_object_mut() {
                    obj.insert("included_used".to_string(), serde_json::json!(included_used));
                    obj.insert("overage_used".to_string(), serde_json::json!(overage_used));
                }
                self.insert_transaction(
                    &mut tx,
                    user_id,
                    video_id,
                    transaction_type,
                    -tokens,
                    before,
                    balance.tokens_remaining,
                    meta,
                    None,
                    None,
                    None,
                    None,
                )
                .await?;
                tx.commit().await?;

                tracing::info!(
                    user_id = %user_id,
                    tokens = tokens,
                    included_used = included_used,
                    overage_used = overage_used,
                    "Tokens deducted"
                );

                // Incremental overage reporting for paid plans. Best-effort:
                // the deduction is already committed; a failed report is an
                // external-dependency failure, logged for the next sweep.
                if matches!(plan.map(|p| p.policy()), Some(TokenPolicy::OverageEligible)) {
                    if let Some(reporter) = &self.overage {
                        if let Err(e) = reporter.report_usage(user_id, tokens).await {
                            tracing::error!(
                                user_id = %user_id,
                                tokens = tokens,
                                error = %e,
                                "Failed to report metered usage to Stripe"
                            );
                        }
                    }
                }

                Ok(outcome)
            }
        }
    }

    /// Grant tokens. Raises both `tokens_remaining` and the period baseline
    /// `monthly_tokens`, so grants push the overage threshold out instead of
    /// silently converting into billable overage.
    pub async fn add(
        &self,
        user_id: Uuid,
        tokens: i64,
        transaction_type: TransactionType,
        metadata: Option<serde_json::Value>,
    ) -> BillingResult<bool> {
        if tokens <= 0 {
            return Err(BillingError::InvalidInput(format!(
                "Grant amount must be positive, got {}",
                tokens
            )));
        }

        let user_exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        if !user_exists {
            tracing::warn!(user_id = %user_id, "Grant skipped: user does not exist");
            return Ok(false);
        }

        let plan = self.current_plan(user_id).await?.map(|(p, _)| p);
        let meta = metadata.unwrap_or_else(|| serde_json::json!({}));

        let mut tx = self.pool.begin().await?;

        if plan == Some(PlanType::Unlimited) {
            self.insert_transaction(
                &mut tx,
                user_id,
                None,
                transaction_type,
                tokens,
                UNLIMITED_SENTINEL,
                UNLIMITED_SENTINEL,
                meta,
                None,
                None,
                None,
                None,
            )
            .await?;
            tx.commit().await?;
            return Ok(true);
        }

        let mut balance = self.lock_balance(&mut tx, user_id).await?;
        let before = balance.tokens_remaining;
        balance.tokens_remaining += tokens;
        balance.monthly_tokens += tokens;
        self.store_balance(&mut tx, &balance).await?;
        self.insert_transaction(
            &mut tx,
            user_id,
            None,
            transaction_type,
            tokens,
            before,
            balance.tokens_remaining,
            meta,
            None,
            None,
            None,
            None,
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            tokens = tokens,
            transaction_type = %transaction_type,
            "Tokens granted"
        );
        Ok(true)
    }

    /// Reset the balance for a subscription period.
    ///
    /// `is_renewal = true` is the only code path allowed to shrink a balance
    /// to a fixed plan value (tokens do not roll over). `is_renewal = false`
    /// adds the allocation on top of the current balance, preserving grants
    /// and unspent tokens across plan switches.
    ///
    /// The written `reset` transaction carries the subscription id and the
    /// period bounds in dedicated columns; those are the idempotency key the
    /// sync layer checks before granting for a period.
    #[allow(clippy::too_many_arguments)]
    pub async fn reset_for_subscription(
        &self,
        user_id: Uuid,
        plan: PlanType,
        allocation: i64,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
        is_renewal: bool,
        subscription_id: Option<&str>,
    ) -> BillingResult<bool> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;
        let mut balance = self.lock_balance(&mut tx, user_id).await?;

        // Additive resets must not double-apply when two triggers race past
        // the caller's dedup check; re-check under the row lock. Renewal
        // resets are overwrite-idempotent and skip this.
        if !is_renewal && plan != PlanType::Unlimited {
            if let Some(sub_id) = subscription_id {
                let exists: bool = sqlx::query_scalar(
                    r#"
                    SELECT EXISTS(
                        SELECT 1 FROM token_transactions
                        WHERE user_id = $1
                          AND transaction_type = 'reset'
                          AND subscription_id = $2
                          AND period_start BETWEEN $3 AND $4
                          AND period_end BETWEEN $5 AND $6
                    )
                    "#,
                )
                .bind(user_id)
                .bind(sub_id)
                .bind(period_start - time::Duration::seconds(60))
                .bind(period_start + time::Duration::seconds(60))
                .bind(period_end - time::Duration::seconds(60))
                .bind(period_end + time::Duration::seconds(60))
                .fetch_one(&mut *tx)
                .await?;
                if exists {
                    tx.rollback().await?;
                    tracing::debug!(
                        user_id = %user_id,
                        subscription_id = %sub_id,
                        "Reset already applied for this period; skipping"
                    );
                    return Ok(true);
                }
            }
        }

        if plan == PlanType::Unlimited {
            // Unlimited never needs a token reset; only the period bounds
            // are mirrored for staleness detection.
            balance.period_start = Some(period_start);
            balance.period_end = Some(period_end);
            self.store_balance(&mut tx, &balance).await?;
            tx.commit().await?;
            return Ok(true);
        }

        let before = balance.tokens_remaining;
        apply_reset(&mut balance, allocation, is_renewal, period_start, period_end, now);
        self.store_balance(&mut tx, &balance).await?;

        let meta = serde_json::json!({
            "plan_type": plan.as_str(),
            "period_start": period_start.format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default(),
            "period_end": period_end.format(&time::format_description::well_known::Rfc3339)
                .unwrap_or_default(),
            "is_renewal": is_renewal,
            "subscription_id": subscription_id,
        });
        self.insert_transaction(
            &mut tx,
            user_id,
            None,
            TransactionType::Reset,
            balance.tokens_remaining - before,
            before,
            balance.tokens_remaining,
            meta,
            subscription_id,
            Some(period_start),
            Some(period_end),
            None,
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            plan = %plan,
            allocation = allocation,
            is_renewal = is_renewal,
            tokens_remaining = balance.tokens_remaining,
            "Token balance reset for subscription period"
        );
        Ok(true)
    }

    /// Perform the daily banked grant for a daily-accrual plan, capped at
    /// `max_accrual`. Returns `None` if a grant for `grant_day` and this
    /// subscription already exists (the dedup check runs inside the same
    /// transaction that holds the balance row lock, so concurrent sweeps
    /// serialize). Returns `Some(granted)` otherwise, where `granted` may
    /// be zero when the balance is already at the cap.
    pub async fn apply_daily_grant(
        &self,
        user_id: Uuid,
        daily_grant: i64,
        max_accrual: i64,
        subscription_id: &str,
        grant_day: Date,
    ) -> BillingResult<Option<i64>> {
        let mut tx = self.pool.begin().await?;
        let mut balance = self.lock_balance(&mut tx, user_id).await?;

        let already_granted: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM token_transactions
                WHERE user_id = $1
                  AND transaction_type = 'grant'
                  AND subscription_id = $2
                  AND grant_day = $3
            )
            "#,
        )
        .bind(user_id)
        .bind(subscription_id)
        .bind(grant_day)
        .fetch_one(&mut *tx)
        .await?;

        if already_granted {
            tx.rollback().await?;
            return Ok(None);
        }

        let granted = banked_grant_amount(balance.tokens_remaining, daily_grant, max_accrual);
        let before = balance.tokens_remaining;
        if granted > 0 {
            balance.tokens_remaining += granted;
            balance.monthly_tokens += granted;
            self.store_balance(&mut tx, &balance).await?;
        }

        let meta = serde_json::json!({
            "kind": "daily",
            "daily_grant": daily_grant,
            "max_accrual": max_accrual,
            "granted": granted,
        });
        self.insert_transaction(
            &mut tx,
            user_id,
            None,
            TransactionType::Grant,
            granted,
            before,
            balance.tokens_remaining,
            meta,
            Some(subscription_id),
            None,
            None,
            Some(grant_day),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            granted = granted,
            tokens_remaining = balance.tokens_remaining,
            "Daily banked grant applied"
        );
        Ok(Some(granted))
    }

    /// Admin preview: how many NEW overage units a deduction of `tokens`
    /// would create, without mutating anything.
    pub async fn preview_overage(&self, user_id: Uuid, tokens: i64) -> BillingResult<i64> {
        let balance = self.get_or_create_balance(user_id).await?;
        Ok(overage_delta_preview(&balance, tokens))
    }

    /// Overwrite the balance to an exact value, logging the overwrite as a
    /// transaction. Used by the plan-transition orchestrator, which owns
    /// the preserve/merge math; the period baseline becomes
    /// `max(tokens, baseline_floor)`.
    ///
    /// The written `reset` transaction carries the new subscription's id and
    /// period, which makes the later webhook-driven sync for the same period
    /// a no-op instead of an additive double-grant.
    #[allow(clippy::too_many_arguments)]
    pub async fn set_balance_preserved(
        &self,
        user_id: Uuid,
        tokens: i64,
        baseline_floor: i64,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
        subscription_id: Option<&str>,
        metadata: serde_json::Value,
    ) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;
        let mut balance = self.lock_balance(&mut tx, user_id).await?;

        let before = balance.tokens_remaining;
        balance.tokens_remaining = tokens;
        balance.monthly_tokens = tokens.max(baseline_floor);
        balance.tokens_used_this_period = 0;
        balance.period_start = Some(period_start);
        balance.period_end = Some(period_end);
        balance.last_reset_at = Some(now);
        self.store_balance(&mut tx, &balance).await?;

        self.insert_transaction(
            &mut tx,
            user_id,
            None,
            TransactionType::Reset,
            tokens - before,
            before,
            tokens,
            metadata,
            subscription_id,
            Some(period_start),
            Some(period_end),
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Recent transactions for a user, newest first.
    pub async fn list_transactions(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<TokenTransaction>> {
        let rows: Vec<TokenTransaction> = sqlx::query_as(
            r#"
            SELECT id, user_id, video_id, transaction_type, tokens,
                   balance_before, balance_after, metadata,
                   subscription_id, period_start, period_end, grant_day, created_at
            FROM token_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Does a `reset` transaction already exist for this subscription and
    /// period? The period bounds match within a 60-second window to absorb
    /// provider clock skew.
    pub async fn reset_exists_for_period(
        &self,
        user_id: Uuid,
        subscription_id: &str,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<bool> {
        let tolerance = time::Duration::seconds(60);
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM token_transactions
                WHERE user_id = $1
                  AND transaction_type = 'reset'
                  AND subscription_id = $2
                  AND period_start BETWEEN $3 AND $4
                  AND period_end BETWEEN $5 AND $6
            )
            "#,
        )
        .bind(user_id)
        .bind(subscription_id)
        .bind(period_start - tolerance)
        .bind(period_start + tolerance)
        .bind(period_end - tolerance)
        .bind(period_end + tolerance)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// Correct the balance's stored period bounds without touching amounts.
    pub async fn update_period_bounds(
        &self,
        user_id: Uuid,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE token_balances
            SET period_start = $2, period_end = $3, updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(period_start)
        .bind(period_end)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn lock_balance(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
    ) -> BillingResult<TokenBalance> {
        sqlx::query(
            r#"
            INSERT INTO token_balances (user_id)
            VALUES ($1)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&mut **tx)
        .await?;

        let balance: Option<TokenBalance> = sqlx::query_as(
            r#"
            SELECT user_id, tokens_remaining, tokens_used_this_period, monthly_tokens,
                   period_start, period_end, last_reset_at
            FROM token_balances
            WHERE user_id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(balance.unwrap_or_else(|| TokenBalance::zeroed(user_id)))
    }

    async fn store_balance(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        balance: &TokenBalance,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE token_balances SET
                tokens_remaining = $2,
                tokens_used_this_period = $3,
                monthly_tokens = $4,
                period_start = $5,
                period_end = $6,
                last_reset_at = $7,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(balance.user_id)
        .bind(balance.tokens_remaining)
        .bind(balance.tokens_used_this_period)
        .bind(balance.monthly_tokens)
        .bind(balance.period_start)
        .bind(balance.period_end)
        .bind(balance.last_reset_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_transaction(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
        video_id: Option<Uuid>,
        transaction_type: TransactionType,
        tokens: i64,
        balance_before: i64,
        balance_after: i64,
        metadata: serde_json::Value,
        subscription_id: Option<&str>,
        period_start: Option<OffsetDateTime>,
        period_end: Option<OffsetDateTime>,
        grant_day: Option<Date>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO token_transactions (
                id, user_id, video_id, transaction_type, tokens,
                balance_before, balance_after, metadata,
                subscription_id, period_start, period_end, grant_day
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(video_id)
        .bind(transaction_type.as_str())
        .bind(tokens)
        .bind(balance_before)
        .bind(balance_after)
        .bind(metadata)
        .bind(subscription_id)
        .bind(period_start)
        .bind(period_end)
        .bind(grant_day)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn balance(remaining: i64, used: i64, monthly: i64) -> TokenBalance {
        TokenBalance {
            user_id: Uuid::new_v4(),
            tokens_remaining: remaining,
            tokens_used_this_period: used,
            monthly_tokens: monthly,
            period_start: None,
            period_end: None,
            last_reset_at: None,
        }
    }

    #[test]
    fn free_plan_rejects_overage() {
        let b = balance(5, 20, 25);
        let outcome = decide_deduct(Some(PlanType::Free), &b, 10);
        assert_eq!(
            outcome,
            DeductOutcome::Insufficient {
                required: 10,
                available: 5
            }
        );
    }

    #[test]
    fn no_subscription_behaves_like_hard_limit() {
        let b = balance(5, 0, 5);
        assert!(decide_deduct(None, &b, 5).succeeded());
        assert!(!decide_deduct(None, &b, 6).succeeded());
    }

    #[test]
    fn paid_plan_splits_into_included_and_overage() {
        let b = balance(5, 295, 300);
        let outcome = decide_deduct(Some(PlanType::Starter), &b, 10);
        assert_eq!(
            outcome,
            DeductOutcome::Deducted {
                included_used: 5,
                overage_used: 5
            }
        );
    }

    #[test]
    fn paid_plan_deduct_floors_remaining_at_zero() {
        let mut b = balance(5, 295, 300);
        if let DeductOutcome::Deducted { included_used, .. } =
            decide_deduct(Some(PlanType::Starter), &b, 10)
        {
            apply_deduct(&mut b, included_used, 10);
        }
        assert_eq!(b.tokens_remaining, 0);
        assert_eq!(b.tokens_used_this_period, 305);
    }

    #[test]
    fn unlimited_plan_is_audit_only() {
        let b = balance(0, 0, 0);
        assert_eq!(
            decide_deduct(Some(PlanType::Unlimited), &b, 1_000_000),
            DeductOutcome::Unlimited
        );
    }

    #[test]
    fn renewal_reset_discards_unused_tokens() {
        let mut b = balance(50, 250, 300);
        apply_reset(
            &mut b,
            300,
            true,
            datetime!(2025-02-01 0:00 UTC),
            datetime!(2025-03-01 0:00 UTC),
            datetime!(2025-02-01 0:05 UTC),
        );
        assert_eq!(b.tokens_remaining, 300);
        assert_eq!(b.monthly_tokens, 300);
        assert_eq!(b.tokens_used_this_period, 0);
    }

    #[test]
    fn plan_switch_reset_preserves_and_adds() {
        let mut b = balance(50, 250, 300);
        apply_reset(
            &mut b,
            300,
            false,
            datetime!(2025-02-01 0:00 UTC),
            datetime!(2025-03-01 0:00 UTC),
            datetime!(2025-02-01 0:05 UTC),
        );
        assert_eq!(b.tokens_remaining, 350);
        assert_eq!(b.monthly_tokens, 350);
        assert_eq!(b.tokens_used_this_period, 0);
    }

    #[test]
    fn banked_grant_respects_cap() {
        assert_eq!(banked_grant_amount(8, 3, 10), 2);
        assert_eq!(banked_grant_amount(10, 3, 10), 0);
        assert_eq!(banked_grant_amount(0, 3, 10), 3);
        // Balance already over the cap (legacy grants) never goes negative.
        assert_eq!(banked_grant_amount(12, 3, 10), 0);
    }

    #[test]
    fn overage_preview_reports_only_new_units() {
        // 100 used of 100: the next 5 are all new overage.
        let b = balance(0, 100, 100);
        assert_eq!(overage_delta_preview(&b, 5), 5);
        // 95 used of 100: only 5 of 10 cross the threshold.
        let b = balance(5, 95, 100);
        assert_eq!(overage_delta_preview(&b, 10), 5);
        // Well under the threshold: nothing new.
        let b = balance(90, 10, 100);
        assert_eq!(overage_delta_preview(&b, 5), 0);
    }

    #[test]
    fn free_tier_conservation_holds_across_operations() {
        let mut b = balance(25, 0, 25);
        for _ in 0..5 {
            if let DeductOutcome::Deducted { included_used, .. } =
                decide_deduct(Some(PlanType::Free), &b, 3)
            {
                apply_deduct(&mut b, included_used, 3);
            }
            assert_eq!(b.tokens_remaining + b.tokens_used_this_period, b.monthly_tokens);
        }
        assert_eq!(b.tokens_remaining, 10);
    }
}
