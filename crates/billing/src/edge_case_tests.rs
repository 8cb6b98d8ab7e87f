// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Token Ledger
//!
//! Tests critical boundary conditions in:
//! - Deduction policy (LED-01 to LED-09)
//! - Period resets (RST-01 to RST-05)
//! - Renewal classification (REN-01 to REN-04)
//! - Overage delta reporting (OVR-01 to OVR-04)
//! - Daily banking (BNK-01 to BNK-04)

#[cfg(test)]
mod deduction_tests {
    use crate::ledger::{apply_deduct, decide_deduct, DeductOutcome, TokenBalance};
    use clipcast_shared::PlanType;
    use uuid::Uuid;

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

    // =========================================================================
    // LED-01: Exact balance deduction on free plan - succeeds, lands on zero
    // =========================================================================
    #[test]
    fn test_exact_balance_deduction_free_plan() {
        let mut b = balance(25, 0, 25);
        let outcome = decide_deduct(Some(PlanType::Free), &b, 25);
        assert_eq!(
            outcome,
            DeductOutcome::Deducted {
                included_used: 25,
                overage_used: 0
            }
        );
        apply_deduct(&mut b, 25, 25);
        assert_eq!(b.tokens_remaining, 0);
        assert_eq!(b.tokens_used_this_period, 25);
    }

    // =========================================================================
    // LED-02: One token over balance on free plan - rejected, zero mutation
    // =========================================================================
    #[test]
    fn test_one_over_balance_rejected_free_plan() {
        let b = balance(25, 0, 25);
        let outcome = decide_deduct(Some(PlanType::Free), &b, 26);
        assert_eq!(
            outcome,
            DeductOutcome::Insufficient {
                required: 26,
                available: 25
            }
        );
    }

    // =========================================================================
    // LED-03: free_daily is hard-limited like free
    // =========================================================================
    #[test]
    fn test_free_daily_is_hard_limited() {
        let b = balance(2, 8, 10);
        assert!(!decide_deduct(Some(PlanType::FreeDaily), &b, 3).succeeded());
        assert!(decide_deduct(Some(PlanType::FreeDaily), &b, 2).succeeded());
    }

    // =========================================================================
    // LED-04: Starter with 5 remaining of 300 deducting 10 - spec example
    // =========================================================================
    #[test]
    fn test_starter_overage_spec_example() {
        let mut b = balance(5, 295, 300);
        let outcome = decide_deduct(Some(PlanType::Starter), &b, 10);
        let DeductOutcome::Deducted {
            included_used,
            overage_used,
        } = outcome
        else {
            panic!("expected success, got {:?}", outcome);
        };
        assert_eq!(included_used, 5);
        assert_eq!(overage_used, 5);
        apply_deduct(&mut b, included_used, 10);
        assert_eq!(b.tokens_remaining, 0);
        assert_eq!(b.tokens_used_this_period, 305);
    }

    // =========================================================================
    // LED-05: Creator plan already at zero - whole deduction is overage
    // =========================================================================
    #[test]
    fn test_creator_all_overage_at_zero() {
        let b = balance(0, 1250, 1250);
        assert_eq!(
            decide_deduct(Some(PlanType::Creator), &b, 40),
            DeductOutcome::Deducted {
                included_used: 0,
                overage_used: 40
            }
        );
    }

    // =========================================================================
    // LED-06: No subscription - granted tokens spend, overage never
    // =========================================================================
    #[test]
    fn test_no_subscription_spends_grants_only() {
        let b = balance(10, 0, 10);
        assert!(decide_deduct(None, &b, 10).succeeded());
        assert_eq!(
            decide_deduct(None, &b, 11),
            DeductOutcome::Insufficient {
                required: 11,
                available: 10
            }
        );
    }

    // =========================================================================
    // LED-07: Unlimited plan bypasses the numeric balance entirely
    // =========================================================================
    #[test]
    fn test_unlimited_bypass() {
        let b = balance(0, 0, 0);
        assert_eq!(
            decide_deduct(Some(PlanType::Unlimited), &b, 1),
            DeductOutcome::Unlimited
        );
        assert_eq!(
            decide_deduct(Some(PlanType::Unlimited), &b, i64::MAX),
            DeductOutcome::Unlimited
        );
    }

    // =========================================================================
    // LED-08: Negative stored balance (legacy data) never yields negative
    //         included_used
    // =========================================================================
    #[test]
    fn test_negative_legacy_balance_clamped() {
        let b = balance(-3, 10, 7);
        let outcome = decide_deduct(Some(PlanType::Starter), &b, 5);
        assert_eq!(
            outcome,
            DeductOutcome::Deducted {
                included_used: 0,
                overage_used: 5
            }
        );
    }

    // =========================================================================
    // LED-09: Conservation holds on free tier through a mixed sequence
    // =========================================================================
    #[test]
    fn test_conservation_through_mixed_sequence() {
        let mut b = balance(25, 0, 25);
        let deducts = [3i64, 7, 2, 5];
        for d in deducts {
            if let DeductOutcome::Deducted { included_used, .. } =
                decide_deduct(Some(PlanType::Free), &b, d)
            {
                apply_deduct(&mut b, included_used, d);
            }
            // Grants raise both sides of the equation.
            b.tokens_remaining += 4;
            b.monthly_tokens += 4;
            assert_eq!(
                b.tokens_remaining + b.tokens_used_this_period,
                b.monthly_tokens
            );
        }
    }
}

#[cfg(test)]
mod reset_tests {
    use crate::ledger::{apply_reset, TokenBalance};
    use time::macros::datetime;
    use uuid::Uuid;

    fn balance(remaining: i64, used: i64, monthly: i64) -> TokenBalance {
        TokenBalance {
            user_id: Uuid::new_v4(),
            tokens_remaining: remaining,
            tokens_used_this_period: used,
            monthly_tokens: monthly,
            period_start: Some(datetime!(2025-01-01 0:00 UTC)),
            period_end: Some(datetime!(2025-02-01 0:00 UTC)),
            last_reset_at: None,
        }
    }

    const START: time::OffsetDateTime = datetime!(2025-02-01 0:00 UTC);
    const END: time::OffsetDateTime = datetime!(2025-03-01 0:00 UTC);
    const NOW: time::OffsetDateTime = datetime!(2025-02-01 0:03 UTC);

    // =========================================================================
    // RST-01: Renewal overwrites - spec example (50 of 300 -> 300)
    // =========================================================================
    #[test]
    fn test_renewal_overwrites() {
        let mut b = balance(50, 250, 300);
        apply_reset(&mut b, 300, true, START, END, NOW);
        assert_eq!(b.tokens_remaining, 300);
        assert_eq!(b.monthly_tokens, 300);
    }

    // =========================================================================
    // RST-02: Switch adds - spec example (50 of 300 -> 350)
    // =========================================================================
    #[test]
    fn test_switch_adds() {
        let mut b = balance(50, 250, 300);
        apply_reset(&mut b, 300, false, START, END, NOW);
        assert_eq!(b.tokens_remaining, 350);
        assert_eq!(b.monthly_tokens, 350);
    }

    // =========================================================================
    // RST-03: Usage always zeroes, even when balance was exhausted
    // =========================================================================
    #[test]
    fn test_usage_zeroed_on_reset() {
        let mut b = balance(0, 305, 300);
        apply_reset(&mut b, 300, true, START, END, NOW);
        assert_eq!(b.tokens_used_this_period, 0);
    }

    // =========================================================================
    // RST-04: Period bounds and last_reset_at are stamped
    // =========================================================================
    #[test]
    fn test_period_stamped() {
        let mut b = balance(10, 0, 10);
        apply_reset(&mut b, 25, false, START, END, NOW);
        assert_eq!(b.period_start, Some(START));
        assert_eq!(b.period_end, Some(END));
        assert_eq!(b.last_reset_at, Some(NOW));
    }

    // =========================================================================
    // RST-05: Renewal discards a larger-than-allocation balance too
    // =========================================================================
    #[test]
    fn test_renewal_discards_banked_surplus() {
        // Admin grants pushed remaining above the plan allocation; renewal
        // still lands exactly on the allocation.
        let mut b = balance(900, 0, 900);
        apply_reset(&mut b, 300, true, START, END, NOW);
        assert_eq!(b.tokens_remaining, 300);
        assert_eq!(b.monthly_tokens, 300);
    }
}

#[cfg(test)]
mod renewal_classification_tests {
    use crate::renewal::is_renewal;
    use clipcast_shared::SubscriptionStatus;
    use time::macros::datetime;

    const NOW: time::OffsetDateTime = datetime!(2025-06-15 12:00 UTC);

    // =========================================================================
    // REN-01: Identical period delivered twice (webhook replay) - no renewal
    // =========================================================================
    #[test]
    fn test_replayed_period_not_renewal() {
        let end = datetime!(2025-07-01 0:00 UTC);
        assert!(!is_renewal(Some(end), end, SubscriptionStatus::Active, NOW));
    }

    // =========================================================================
    // REN-02: Out-of-order delivery (older period arrives late) - no renewal
    // =========================================================================
    #[test]
    fn test_out_of_order_period_not_renewal() {
        let stored = datetime!(2025-07-01 0:00 UTC);
        let stale = datetime!(2025-06-01 0:00 UTC);
        assert!(!is_renewal(Some(stored), stale, SubscriptionStatus::Active, NOW));
    }

    // =========================================================================
    // REN-03: Monthly advance on past_due subscription - no renewal
    // =========================================================================
    #[test]
    fn test_past_due_monthly_advance_not_renewal() {
        let old = datetime!(2025-06-01 0:00 UTC);
        let new = datetime!(2025-07-01 0:00 UTC);
        assert!(!is_renewal(Some(old), new, SubscriptionStatus::PastDue, NOW));
    }

    // =========================================================================
    // REN-04: 18-day proration-shortened period - flagged, not renewed
    // =========================================================================
    #[test]
    fn test_short_proration_period_flagged() {
        let old = datetime!(2025-06-12 0:00 UTC);
        let new = datetime!(2025-06-30 0:00 UTC);
        assert!(!is_renewal(Some(old), new, SubscriptionStatus::Active, NOW));
    }
}

#[cfg(test)]
mod overage_delta_tests {
    use crate::overage::overage_delta;

    // =========================================================================
    // OVR-01: Spec example - 100 -> 105 of 100 reports exactly 5
    // =========================================================================
    #[test]
    fn test_spec_example_delta() {
        assert_eq!(overage_delta(105, 5, 100), 5);
    }

    // =========================================================================
    // OVR-02: Deduction landing exactly on the threshold reports nothing
    // =========================================================================
    #[test]
    fn test_landing_on_threshold_reports_zero() {
        assert_eq!(overage_delta(100, 10, 100), 0);
    }

    // =========================================================================
    // OVR-03: Successive deltas sum to the total overage (no double-count)
    // =========================================================================
    #[test]
    fn test_deltas_sum_to_total_overage() {
        let monthly = 100;
        let deducts = [40i64, 40, 40, 40];
        let mut used = 0;
        let mut reported = 0;
        for d in deducts {
            used += d;
            reported += overage_delta(used, d, monthly);
        }
        assert_eq!(used, 160);
        assert_eq!(reported, 60);
        assert_eq!(reported, (used - monthly).max(0));
    }

    // =========================================================================
    // OVR-04: Zero baseline (unconfigured balance) treats everything as
    //         overage without going negative
    // =========================================================================
    #[test]
    fn test_zero_baseline() {
        assert_eq!(overage_delta(7, 7, 0), 7);
        assert_eq!(overage_delta(7, 0, 0), 0);
    }
}

#[cfg(test)]
mod banking_tests {
    use crate::ledger::banked_grant_amount;

    // =========================================================================
    // BNK-01: Spec example - 8 of cap 10 with grant 3 receives 2
    // =========================================================================
    #[test]
    fn test_partial_grant_at_cap_edge() {
        assert_eq!(banked_grant_amount(8, 3, 10), 2);
    }

    // =========================================================================
    // BNK-02: At the cap receives 0
    // =========================================================================
    #[test]
    fn test_zero_grant_at_cap() {
        assert_eq!(banked_grant_amount(10, 3, 10), 0);
    }

    // =========================================================================
    // BNK-03: Empty balance receives the full daily amount
    // =========================================================================
    #[test]
    fn test_full_grant_when_empty() {
        assert_eq!(banked_grant_amount(0, 3, 10), 3);
    }

    // =========================================================================
    // BNK-04: Above the cap (grandfathered balance) receives 0, never negative
    // =========================================================================
    #[test]
    fn test_above_cap_never_negative() {
        assert_eq!(banked_grant_amount(15, 3, 10), 0);
    }
}
