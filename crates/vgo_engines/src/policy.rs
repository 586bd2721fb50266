#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use vgo_kernel_contracts::allocation::{AllocationReason, Decision};
use vgo_kernel_contracts::ids::PrincipalId;
use vgo_kernel_contracts::policy::PolicyManifest;

use crate::compute::InvariantViolation;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSplit {
    pub shares: BTreeMap<PrincipalId, i128>,
    /// Units lost to flooring; always `< number of weighted principals`.
    pub remainder: i128,
}

/// Floors `pool * weight / total_weight` for every positive weight.
pub fn split_pool(
    pool: i128,
    weights: &BTreeMap<PrincipalId, i128>,
) -> Result<PoolSplit, InvariantViolation> {
    let overflow = InvariantViolation::AccumulatorOverflow { stage: "pool_split" };
    let total_weight = weights
        .values()
        .filter(|w| **w > 0)
        .try_fold(0i128, |acc, w| acc.checked_add(*w))
        .ok_or(overflow.clone())?;
    if pool <= 0 || total_weight == 0 {
        return Ok(PoolSplit {
            shares: BTreeMap::new(),
            remainder: pool.max(0),
        });
    }
    let mut shares = BTreeMap::new();
    let mut distributed = 0i128;
    for (principal, weight) in weights.iter().filter(|(_, w)| **w > 0) {
        let share = pool.checked_mul(*weight).ok_or(overflow.clone())? / total_weight;
        distributed = distributed.checked_add(share).ok_or(overflow.clone())?;
        shares.insert(principal.clone(), share);
    }
    Ok(PoolSplit {
        shares,
        remainder: pool - distributed,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyOutcome {
    pub decision: Decision,
    pub final_minor: i128,
    pub carry_out_minor: i128,
    pub reasons: BTreeSet<AllocationReason>,
}

impl PolicyOutcome {
    /// Room left under the cap, `None` when uncapped.
    pub fn cap_headroom(&self, policy: &PolicyManifest) -> Option<i128> {
        policy
            .cap_minor
            .map(|cap| (i128::from(cap) - self.final_minor).max(0))
    }
}

/// Applies eligibility, caps, negative balances and the payout minimum to
/// one principal's gross amount. `gross` already includes carry-in and any
/// pool share.
pub fn evaluate_principal(
    principal_id: &PrincipalId,
    gross: i128,
    carry_in: i128,
    pool_share: i128,
    policy: &PolicyManifest,
) -> PolicyOutcome {
    let mut reasons = BTreeSet::new();
    if carry_in != 0 {
        reasons.insert(AllocationReason::CarryInApplied);
    }
    if pool_share > 0 {
        reasons.insert(AllocationReason::BonusPoolShare);
    }
    let mut hold = false;
    if policy.ineligible_principals.contains(principal_id) {
        reasons.insert(AllocationReason::PrincipalIneligible);
        hold = true;
    }

    let (final_minor, carry_out_minor) = if gross < 0 {
        reasons.insert(AllocationReason::NegativeBalanceCarried);
        hold = true;
        (0, gross)
    } else if gross == 0 {
        reasons.insert(AllocationReason::NothingDue);
        hold = true;
        (0, 0)
    } else {
        let mut paid = gross;
        let mut carried = 0;
        if let Some(cap) = policy.cap_minor.map(i128::from) {
            if paid > cap {
                reasons.insert(AllocationReason::CapApplied);
                carried = paid - cap;
                paid = cap;
            }
        }
        if paid < i128::from(policy.min_payout_minor) {
            reasons.insert(AllocationReason::BelowMinPayout);
            hold = true;
            carried += paid;
            paid = 0;
        }
        (paid, carried)
    };

    PolicyOutcome {
        decision: if hold { Decision::Hold } else { Decision::Allow },
        final_minor,
        carry_out_minor,
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::policy_normal;

    fn p(id: &str) -> PrincipalId {
        PrincipalId::new(id).unwrap()
    }

    #[test]
    fn at_policy_engine_01_pool_split_floors_and_reports_remainder() {
        let weights = BTreeMap::from([(p("alice"), 1), (p("bob"), 1), (p("carol"), 1)]);
        let split = split_pool(100, &weights).unwrap();
        assert_eq!(split.shares.values().copied().collect::<Vec<_>>(), vec![33, 33, 33]);
        assert_eq!(split.remainder, 1);

        let none = split_pool(50, &BTreeMap::new()).unwrap();
        assert!(none.shares.is_empty());
        assert_eq!(none.remainder, 50);
    }

    #[test]
    fn at_policy_engine_02_cap_excess_is_carried() {
        let mut policy = policy_normal();
        policy.cap_minor = Some(1_000);
        let out = evaluate_principal(&p("bob"), 2_000, 0, 0, &policy);
        assert_eq!(out.decision, Decision::Allow);
        assert_eq!(out.final_minor, 1_000);
        assert_eq!(out.carry_out_minor, 1_000);
        assert!(out.reasons.contains(&AllocationReason::CapApplied));
        assert_eq!(out.cap_headroom(&policy), Some(0));
    }

    #[test]
    fn at_policy_engine_03_negative_and_small_balances_hold() {
        let mut policy = policy_normal();
        policy.min_payout_minor = 500;

        let negative = evaluate_principal(&p("alice"), -300, -100, 0, &policy);
        assert_eq!(negative.decision, Decision::Hold);
        assert_eq!(negative.final_minor, 0);
        assert_eq!(negative.carry_out_minor, -300);
        assert!(negative
            .reasons
            .contains(&AllocationReason::NegativeBalanceCarried));
        assert!(negative.reasons.contains(&AllocationReason::CarryInApplied));

        let small = evaluate_principal(&p("alice"), 499, 0, 0, &policy);
        assert_eq!(small.decision, Decision::Hold);
        assert_eq!((small.final_minor, small.carry_out_minor), (0, 499));

        let zero = evaluate_principal(&p("alice"), 0, 0, 0, &policy);
        assert_eq!(zero.reasons, BTreeSet::from([AllocationReason::NothingDue]));
    }

    #[test]
    fn at_policy_engine_04_ineligible_principal_is_held_not_dropped() {
        let mut policy = policy_normal();
        policy.ineligible_principals.insert(p("mallory"));
        let out = evaluate_principal(&p("mallory"), 900, 0, 0, &policy);
        assert_eq!(out.decision, Decision::Hold);
        assert_eq!(out.final_minor, 900);
        assert!(out.reasons.contains(&AllocationReason::PrincipalIneligible));
    }
}
