//! Clipcast Background Worker
//!
//! Handles scheduled jobs including:
//! - Hourly sweep of subscriptions whose billing period has lapsed
//!   (self-heals missed renewal webhooks)
//! - Daily token accrual for free_daily plans (00:10 UTC)
//! - Plan catalog refresh from Stripe (every 6 hours)
//! - Billing invariant checks (daily at 4:00 AM UTC)

use std::sync::Arc;
use std::time::Duration;

use clipcast_billing::{BillingService, LeaseLock};
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Sweep subscriptions whose stored period has lapsed while they are still
/// live provider-side. Each one gets re-fetched from Stripe and its tokens
/// re-synced; the period-level idempotency makes overlapping sweeps safe.
async fn sweep_expired_periods(billing: &BillingService, pool: &sqlx::PgPool) {
    let rows: Result<Vec<(Uuid, String)>, sqlx::Error> = sqlx::query_as(
        r#"
        SELECT user_id, stripe_subscription_id
        FROM subscriptions
        WHERE status IN ('active', 'trialing')
          AND current_period_end < NOW()
        "#,
    )
    .fetch_all(pool)
    .await;

    let rows = match rows {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "Failed to list lapsed-period subscriptions");
            return;
        }
    };

    if rows.is_empty() {
        return;
    }
    info!(count = rows.len(), "Sweeping lapsed-period subscriptions");

    let mut synced = 0usize;
    let mut errors = 0usize;
    for (user_id, subscription_id) in rows {
        let record = match billing.subscriptions.get_by_stripe_id(&subscription_id).await {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(e) => {
                errors += 1;
                error!(user_id = %user_id, error = %e, "Failed to load subscription record");
                continue;
            }
        };
        match billing.sync.refresh_and_sync(&record).await {
            Ok(_) => synced += 1,
            Err(e) => {
                errors += 1;
                error!(
                    user_id = %user_id,
                    subscription_id = %subscription_id,
                    error = %e,
                    "Failed to refresh and sync lapsed subscription"
                );
            }
        }
    }

    info!(synced = synced, errors = errors, "Lapsed-period sweep complete");
}

/// Grant the daily banked tokens for every live free_daily subscription.
/// The per-day grant transaction deduplicates, so re-runs are no-ops.
async fn sweep_daily_accrual(billing: &BillingService, pool: &sqlx::PgPool) {
    let rows: Result<Vec<(Uuid, String)>, sqlx::Error> = sqlx::query_as(
        r#"
        SELECT user_id, stripe_subscription_id
        FROM subscriptions
        WHERE plan_type = 'free_daily'
          AND status IN ('active', 'trialing')
        "#,
    )
    .fetch_all(pool)
    .await;

    let rows = match rows {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "Failed to list free_daily subscriptions");
            return;
        }
    };

    info!(count = rows.len(), "Running daily accrual sweep");

    let mut granted = 0usize;
    let mut errors = 0usize;
    for (user_id, subscription_id) in rows {
        match billing
            .sync
            .ensure_tokens_synced_for_subscription(user_id, &subscription_id)
            .await
        {
            Ok(_) => granted += 1,
            Err(e) => {
                errors += 1;
                error!(user_id = %user_id, error = %e, "Daily accrual failed");
            }
        }
    }

    info!(processed = granted, errors = errors, "Daily accrual sweep complete");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Clipcast Worker");

    let pool = create_db_pool().await?;

    let billing = match BillingService::from_env(pool.clone()) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            // If Stripe isn't configured, run in minimal mode
            warn!(error = %e, "Failed to create billing service - running in minimal mode");
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
                info!("Worker heartbeat (minimal mode)");
            }
        }
    };

    // The lease lock keeps multi-instance deployments from running the
    // same sweep concurrently. Without Redis the sweeps still run; the
    // period/day idempotency keys make duplicates harmless, just noisy.
    let lock = match std::env::var("REDIS_URL") {
        Ok(url) => match LeaseLock::connect(&url).await {
            Ok(lock) => Some(lock),
            Err(e) => {
                warn!(error = %e, "Redis unavailable - sweeps run without cross-process lock");
                None
            }
        },
        Err(_) => None,
    };

    let scheduler = JobScheduler::new().await?;

    // Job 1: Hourly lapsed-period sweep
    {
        let billing = billing.clone();
        let pool = pool.clone();
        scheduler
            .add(Job::new_async("0 15 * * * *", move |_uuid, _l| {
                let billing = billing.clone();
                let pool = pool.clone();
                Box::pin(async move {
                    info!("Running lapsed-period sweep");
                    sweep_expired_periods(&billing, &pool).await;
                })
            })?)
            .await?;
    }

    // Job 2: Daily accrual sweep at 00:10 UTC, behind the lease lock
    {
        let billing = billing.clone();
        let pool = pool.clone();
        let lock = lock.clone();
        scheduler
            .add(Job::new_async("0 10 0 * * *", move |_uuid, _l| {
                let billing = billing.clone();
                let pool = pool.clone();
                let lock = lock.clone();
                Box::pin(async move {
                    if let Some(lock) = &lock {
                        match lock.acquire("clipcast:daily-accrual-sweep", Duration::from_secs(600)).await {
                            Ok(Some(lease)) => {
                                sweep_daily_accrual(&billing, &pool).await;
                                if let Err(e) = lock.release(&lease).await {
                                    warn!(error = %e, "Failed to release sweep lease");
                                }
                            }
                            Ok(None) => {
                                // Another instance holds the sweep; let it finish.
                                lock.wait_cooldown().await;
                                info!("Daily accrual sweep already running elsewhere");
                            }
                            Err(e) => {
                                warn!(error = %e, "Lock acquire failed - running sweep anyway");
                                sweep_daily_accrual(&billing, &pool).await;
                            }
                        }
                    } else {
                        sweep_daily_accrual(&billing, &pool).await;
                    }
                })
            })?)
            .await?;
    }

    // Job 3: Plan catalog refresh every 6 hours
    {
        let billing = billing.clone();
        scheduler
            .add(Job::new_async("0 0 */6 * * *", move |_uuid, _l| {
                let billing = billing.clone();
                Box::pin(async move {
                    info!("Refreshing plan catalog from Stripe");
                    billing.catalog.force_refresh().await;
                })
            })?)
            .await?;
    }

    // Job 4: Invariant checks daily at 4:00 AM UTC
    {
        let billing = billing.clone();
        scheduler
            .add(Job::new_async("0 0 4 * * *", move |_uuid, _l| {
                let billing = billing.clone();
                Box::pin(async move {
                    match billing.invariants.run_all_checks().await {
                        Ok(summary) if summary.healthy => {
                            info!(
                                checks_run = summary.checks_run,
                                "Billing invariants healthy"
                            );
                        }
                        Ok(summary) => {
                            for violation in &summary.violations {
                                warn!(
                                    invariant = %violation.invariant,
                                    severity = %violation.severity,
                                    description = %violation.description,
                                    "Billing invariant violation"
                                );
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Invariant check run failed");
                        }
                    }
                })
            })?)
            .await?;
    }

    scheduler.start().await?;
    info!("Worker scheduler started");

    // Park the main task; jobs run on the scheduler.
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
