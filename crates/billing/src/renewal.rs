//! Renewal detection.
//!
//! When a subscription's billing period advances, the ledger has to decide
//! between two very different token actions: a renewal resets the balance
//! to the plan allocation (tokens do not roll over), while a plan switch or
//! fresh subscription adds to it. Getting this wrong in one direction wipes
//! a user's banked tokens, so the heuristic is deliberately conservative:
//! anything outside the expected band is flagged and treated as NOT a
//! renewal.

use clipcast_shared::SubscriptionStatus;
use time::OffsetDateTime;

/// Minimum plausible period advance for a renewal. Rejects sub-day noise
/// (daily accrual uses the banking mechanism, not resets) and short
/// proration adjustments.
const MIN_RENEWAL_ADVANCE_DAYS: i64 = 20;

/// Maximum plausible period advance. Jumps past a year are more likely a
/// plan switch or provider-console edit than a renewal.
const MAX_RENEWAL_ADVANCE_DAYS: i64 = 365;

/// Classify a period-boundary change as a renewal.
///
/// Returns true only when an existing, live subscription's period end moved
/// forward by 20–365 days into the future. Every other advance returns
/// false; advances that moved forward but fall outside the band are logged
/// for manual inspection since they may be either a misclassified renewal
/// or provider drift.
pub fn is_renewal(
    old_period_end: Option<OffsetDateTime>,
    new_period_end: OffsetDateTime,
    status: SubscriptionStatus,
    now: OffsetDateTime,
) -> bool {
    let Some(old_end) = old_period_end else {
        // No prior period: a brand-new subscription, never a renewal.
        return false;
    };

    if new_period_end <= old_end {
        return false;
    }
    if new_period_end <= now {
        return false;
    }
    if !status.counts_for_renewal() {
        return false;
    }

    let advance = new_period_end - old_end;
    let advance_days = advance.whole_days();

    if advance_days >= MIN_RENEWAL_ADVANCE_DAYS && advance_days < MAX_RENEWAL_ADVANCE_DAYS {
        return true;
    }

    tracing::warn!(
        old_period_end = %old_end,
        new_period_end = %new_period_end,
        advance_days = advance_days,
        "Period advanced outside the renewal band; treating as non-renewal, \
         flagging for manual inspection"
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2025-03-15 12:00 UTC);

    #[test]
    fn monthly_rollover_is_a_renewal() {
        let old_end = datetime!(2025-03-01 0:00 UTC);
        let new_end = datetime!(2025-04-01 0:00 UTC);
        assert!(is_renewal(Some(old_end), new_end, SubscriptionStatus::Active, NOW));
    }

    #[test]
    fn quarterly_rollover_is_a_renewal() {
        let old_end = datetime!(2025-01-01 0:00 UTC);
        let new_end = datetime!(2025-04-01 0:00 UTC);
        assert!(is_renewal(Some(old_end), new_end, SubscriptionStatus::Active, NOW));
    }

    #[test]
    fn no_prior_period_is_never_a_renewal() {
        let new_end = datetime!(2025-04-01 0:00 UTC);
        assert!(!is_renewal(None, new_end, SubscriptionStatus::Active, NOW));
    }

    #[test]
    fn period_must_actually_advance() {
        let old_end = datetime!(2025-04-01 0:00 UTC);
        assert!(!is_renewal(Some(old_end), old_end, SubscriptionStatus::Active, NOW));
        let earlier = datetime!(2025-03-20 0:00 UTC);
        assert!(!is_renewal(Some(old_end), earlier, SubscriptionStatus::Active, NOW));
    }

    #[test]
    fn new_period_end_must_be_in_the_future() {
        let old_end = datetime!(2025-01-01 0:00 UTC);
        let new_end = datetime!(2025-02-01 0:00 UTC); // before NOW
        assert!(!is_renewal(Some(old_end), new_end, SubscriptionStatus::Active, NOW));
    }

    #[test]
    fn inactive_statuses_do_not_renew() {
        let old_end = datetime!(2025-03-01 0:00 UTC);
        let new_end = datetime!(2025-04-01 0:00 UTC);
        assert!(!is_renewal(Some(old_end), new_end, SubscriptionStatus::Canceled, NOW));
        assert!(!is_renewal(Some(old_end), new_end, SubscriptionStatus::PastDue, NOW));
        assert!(!is_renewal(Some(old_end), new_end, SubscriptionStatus::Unpaid, NOW));
        assert!(is_renewal(Some(old_end), new_end, SubscriptionStatus::Trialing, NOW));
    }

    #[test]
    fn sub_band_advance_is_flagged_not_renewed() {
        // Advanced by only 2 days: daily noise or proration, not a renewal.
        let old_end = datetime!(2025-03-20 0:00 UTC);
        let new_end = datetime!(2025-03-22 0:00 UTC);
        assert!(!is_renewal(Some(old_end), new_end, SubscriptionStatus::Active, NOW));
    }

    #[test]
    fn over_band_advance_is_flagged_not_renewed() {
        // Advanced by 400 days: likely a plan switch.
        let old_end = datetime!(2025-03-01 0:00 UTC);
        let new_end = datetime!(2026-04-05 0:00 UTC);
        assert!(!is_renewal(Some(old_end), new_end, SubscriptionStatus::Active, NOW));
    }

    #[test]
    fn band_boundaries() {
        let old_end = datetime!(2025-03-01 0:00 UTC);
        // Exactly 20 days: inside the band.
        let at_min = old_end + time::Duration::days(20);
        assert!(is_renewal(Some(old_end), at_min, SubscriptionStatus::Active, NOW));
        // Just under 20 days: outside.
        let under_min = old_end + time::Duration::days(19);
        assert!(!is_renewal(Some(old_end), under_min, SubscriptionStatus::Active, NOW));
        // Exactly 365 days: outside (band is half-open).
        let at_max = old_end + time::Duration::days(365);
        assert!(!is_renewal(Some(old_end), at_max, SubscriptionStatus::Active, NOW));
        // 364 days: inside.
        let under_max = old_end + time::Duration::days(364);
        assert!(is_renewal(Some(old_end), under_max, SubscriptionStatus::Active, NOW));
    }
}
