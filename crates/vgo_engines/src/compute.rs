#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use vgo_kernel_contracts::allocation::{AllocationReason, AllocationRecord, Decision, WindowTotals};
use vgo_kernel_contracts::ids::PrincipalId;
use vgo_kernel_contracts::transcript::{TranscriptInputs, TranscriptOutputs};
use vgo_kernel_contracts::{ContractViolation, Validate};

use crate::accumulate::{accumulate, PrincipalSums};
use crate::carry::{assign_remainder, RemainderCandidate};
use crate::ordering::filter_membership;
use crate::policy::{evaluate_principal, split_pool};

/// A computation that would break conservation or overflow. The window that
/// produced it is marked INVALID instead of being sealed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("transcript inputs rejected: {0}")]
    InputContract(ContractViolation),
    #[error("accumulator overflow at {stage}")]
    AccumulatorOverflow { stage: &'static str },
    #[error("{field} does not fit in i64: {value}")]
    AmountOutOfRange { field: &'static str, value: i128 },
    #[error("conservation broken: target {target}, accounted {accounted}")]
    ConservationBroken { target: i128, accounted: i128 },
    #[error("computed outputs rejected: {0}")]
    OutputContract(ContractViolation),
}

fn to_i64(field: &'static str, value: i128) -> Result<i64, InvariantViolation> {
    i64::try_from(value).map_err(|_| InvariantViolation::AmountOutOfRange { field, value })
}

fn checked_sum(
    stage: &'static str,
    values: impl IntoIterator<Item = i128>,
) -> Result<i128, InvariantViolation> {
    values
        .into_iter()
        .try_fold(0i128, |acc, v| acc.checked_add(v))
        .ok_or(InvariantViolation::AccumulatorOverflow { stage })
}

struct Row {
    base: i128,
    carry_in: i128,
    adjustments: i128,
    final_minor: i128,
    carry_out: i128,
    headroom: Option<i128>,
    decision: Decision,
    reasons: BTreeSet<AllocationReason>,
}

/// Pure window computation: membership, canonical fold, policy, carry.
///
/// Output depends only on `inputs`; storage order of events is irrelevant.
pub fn compute_window(inputs: &TranscriptInputs) -> Result<TranscriptOutputs, InvariantViolation> {
    inputs.validate().map_err(InvariantViolation::InputContract)?;
    let policy = &inputs.policy;

    let membership = filter_membership(
        &inputs.events,
        inputs.opens_at,
        inputs.watermark,
        policy.late_grace_ticks,
    );
    let sums = accumulate(&membership.included)?;

    let carry_in = inputs
        .carry_in
        .iter()
        .map(|c| (c.principal_id.clone(), i128::from(c.carry_minor)))
        .collect::<BTreeMap<_, _>>();
    let principals = sums
        .keys()
        .chain(carry_in.keys())
        .cloned()
        .collect::<BTreeSet<PrincipalId>>();

    let weights = sums
        .iter()
        .map(|(p, s)| (p.clone(), s.pool_weight()))
        .filter(|(_, w)| *w > 0)
        .collect::<BTreeMap<_, _>>();
    let pool = i128::from(policy.bonus_pool_minor) + i128::from(inputs.pool_carry_in_minor);
    let split = split_pool(pool, &weights)?;

    let mut rows: BTreeMap<PrincipalId, Row> = BTreeMap::new();
    for principal in &principals {
        let base = sums
            .get(principal)
            .copied()
            .unwrap_or_else(PrincipalSums::default)
            .net()?;
        let carry = carry_in.get(principal).copied().unwrap_or(0);
        let share = split.shares.get(principal).copied().unwrap_or(0);
        let gross = checked_sum("principal_gross", [carry, base, share])?;
        let outcome = evaluate_principal(principal, gross, carry, share, policy);
        rows.insert(
            principal.clone(),
            Row {
                base,
                carry_in: carry,
                adjustments: share,
                final_minor: outcome.final_minor,
                carry_out: outcome.carry_out_minor,
                headroom: outcome.cap_headroom(policy),
                decision: outcome.decision,
                reasons: outcome.reasons,
            },
        );
    }

    let candidates = rows
        .iter()
        .filter(|(p, row)| row.decision == Decision::Allow && weights.contains_key(*p))
        .map(|(p, row)| RemainderCandidate {
            principal_id: p.clone(),
            headroom: row.headroom,
        })
        .collect::<Vec<_>>();
    let assignment = assign_remainder(split.remainder, &candidates);
    for (principal, units) in &assignment.units {
        if let Some(row) = rows.get_mut(principal) {
            row.final_minor += units;
            row.adjustments += units;
            row.reasons.insert(AllocationReason::RemainderUnit);
        }
    }

    let target = checked_sum(
        "target_total",
        rows.values()
            .map(|r| r.carry_in)
            .chain(rows.values().map(|r| r.base))
            .chain([pool]),
    )?;
    let final_total = checked_sum("final_total", rows.values().map(|r| r.final_minor))?;
    let carry_total = checked_sum("carry_out_total", rows.values().map(|r| r.carry_out))?;
    let accounted = checked_sum("accounted", [final_total, carry_total, assignment.leftover])?;
    if accounted != target {
        return Err(InvariantViolation::ConservationBroken { target, accounted });
    }
    let allow_total = checked_sum(
        "allow_total",
        rows.values()
            .filter(|r| r.decision == Decision::Allow)
            .map(|r| r.final_minor),
    )?;

    let mut allocations = Vec::with_capacity(rows.len());
    for (principal, row) in rows {
        let record = AllocationRecord::v1(
            principal,
            to_i64("base_minor", row.base)?,
            to_i64("policy_adjustments", row.adjustments)?,
            to_i64("final_minor", row.final_minor)?,
            to_i64("carry_in_minor", row.carry_in)?,
            to_i64("carry_out_minor", row.carry_out)?,
            row.decision,
            row.reasons.into_iter().collect(),
        )
        .map_err(InvariantViolation::OutputContract)?;
        allocations.push(record);
    }

    let totals = WindowTotals {
        target_total_minor: to_i64("target_total_minor", target)?,
        final_total_minor: to_i64("final_total_minor", final_total)?,
        carry_out_total_minor: to_i64("carry_out_total_minor", carry_total)?,
        bonus_pool_minor: policy.bonus_pool_minor,
        pool_carry_in_minor: inputs.pool_carry_in_minor,
        pool_carry_out_minor: to_i64("pool_carry_out_minor", assignment.leftover)?,
        allow_total_minor: to_i64("allow_total_minor", allow_total)?,
        hold_total_minor: to_i64("hold_total_minor", final_total - allow_total)?,
    };

    let outputs = TranscriptOutputs {
        ordered_event_ids: membership
            .included
            .iter()
            .map(|ev| ev.event_id.clone())
            .collect(),
        excluded: membership.excluded,
        allocations,
        totals,
    };
    outputs
        .validate()
        .map_err(InvariantViolation::OutputContract)?;
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use vgo_kernel_contracts::allocation::CarryEntry;
    use vgo_kernel_contracts::event::EventKind;

    use super::*;
    use crate::test_support::{inputs_with, policy_normal, record, record_kind};

    fn row<'a>(outputs: &'a TranscriptOutputs, principal: &str) -> &'a AllocationRecord {
        outputs
            .allocations
            .iter()
            .find(|r| r.principal_id.as_str() == principal)
            .unwrap()
    }

    #[test]
    fn at_compute_01_simple_window_pays_base_earnings() {
        let inputs = inputs_with(
            policy_normal(),
            vec![record("ev_1", "alice", 700, 10), record("ev_2", "bob", 2_000, 20)],
        );
        let out = compute_window(&inputs).unwrap();
        assert_eq!(row(&out, "alice").final_minor, 700);
        assert_eq!(row(&out, "bob").final_minor, 2_000);
        assert_eq!(out.totals.target_total_minor, 2_700);
        assert_eq!(out.totals.final_total_minor, 2_700);
        assert_eq!(out.totals.allow_total_minor, 2_700);
        assert_eq!(out.totals.remainder_carried_out(), 0);
    }

    #[test]
    fn at_compute_02_result_independent_of_arrival_order() {
        let mut events = vec![
            record("ev_1", "alice", 700, 10),
            record("ev_2", "bob", 2_000, 20),
            record_kind("ev_3", "alice", EventKind::Refund, -150, 35),
            record_kind("ev_4", "carol", EventKind::Adjustment, 11, 47),
            record("ev_5", "carol", 333, 47),
        ];
        events.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        let mut policy = policy_normal();
        policy.bonus_pool_minor = 1_000;
        let expected = compute_window(&inputs_with(policy.clone(), events.clone())).unwrap();

        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..32 {
            let mut shuffled = events.clone();
            shuffled.shuffle(&mut rng);
            let ordered = crate::ordering::order_events(&shuffled);
            let mut reinput = inputs_with(policy.clone(), shuffled);
            reinput.events.sort_by(|a, b| a.event_id.cmp(&b.event_id));
            let got = compute_window(&reinput).unwrap();
            assert_eq!(got, expected);
            let ids = ordered.iter().map(|e| e.event_id.clone()).collect::<Vec<_>>();
            assert_eq!(got.ordered_event_ids, ids);
        }
    }

    #[test]
    fn at_compute_03_pool_remainder_units_and_conservation() {
        let mut policy = policy_normal();
        policy.bonus_pool_minor = 100;
        let inputs = inputs_with(
            policy,
            vec![
                record("ev_1", "alice", 100, 1),
                record("ev_2", "bob", 100, 2),
                record("ev_3", "carol", 100, 3),
            ],
        );
        let out = compute_window(&inputs).unwrap();
        assert_eq!(row(&out, "alice").final_minor, 134);
        assert_eq!(row(&out, "alice").policy_adjustments, 34);
        assert!(row(&out, "alice")
            .reason_codes
            .contains(&AllocationReason::RemainderUnit));
        assert_eq!(row(&out, "bob").final_minor, 133);
        assert_eq!(row(&out, "carol").final_minor, 133);
        assert_eq!(out.totals.final_total_minor, 400);
        assert_eq!(out.totals.pool_carry_out_minor, 0);
    }

    #[test]
    fn at_compute_04_capped_remainder_goes_to_pool_carry() {
        let mut policy = policy_normal();
        policy.bonus_pool_minor = 10;
        policy.cap_minor = Some(103);
        let inputs = inputs_with(
            policy,
            vec![
                record("ev_1", "alice", 100, 1),
                record("ev_2", "bob", 100, 2),
                record("ev_3", "carol", 100, 3),
            ],
        );
        let out = compute_window(&inputs).unwrap();
        // Shares are 3 each; remainder 1 finds every principal at the cap.
        for p in ["alice", "bob", "carol"] {
            assert_eq!(row(&out, p).final_minor, 103);
        }
        assert_eq!(out.totals.pool_carry_out_minor, 1);
        assert_eq!(
            i128::from(out.totals.final_total_minor) + out.totals.remainder_carried_out(),
            i128::from(out.totals.target_total_minor)
        );
    }

    #[test]
    fn at_compute_05_carry_in_feeds_same_principal_only() {
        let mut inputs = inputs_with(policy_normal(), vec![record("ev_1", "alice", 700, 10)]);
        inputs.carry_in = vec![
            CarryEntry {
                principal_id: PrincipalId::new("alice").unwrap(),
                carry_minor: -200,
            },
            CarryEntry {
                principal_id: PrincipalId::new("dave").unwrap(),
                carry_minor: 40,
            },
        ];
        let out = compute_window(&inputs).unwrap();
        let alice = row(&out, "alice");
        assert_eq!(alice.final_minor, 500);
        assert_eq!(alice.carry_in_minor, -200);
        assert!(alice.reason_codes.contains(&AllocationReason::CarryInApplied));
        let dave = row(&out, "dave");
        assert_eq!(dave.base_minor, 0);
        assert_eq!(dave.final_minor, 40);
        assert_eq!(out.totals.target_total_minor, 540);
    }

    #[test]
    fn at_compute_06_out_of_window_events_are_excluded_not_dropped() {
        let inputs = inputs_with(
            policy_normal(),
            vec![record("ev_1", "alice", 700, 10), record("ev_2", "alice", 50, 5_000)],
        );
        let out = compute_window(&inputs).unwrap();
        assert_eq!(out.ordered_event_ids.len(), 1);
        assert_eq!(out.excluded.len(), 1);
        assert_eq!(out.excluded[0].event_id.as_str(), "ev_2");
        assert_eq!(row(&out, "alice").final_minor, 700);
    }

    #[test]
    fn at_compute_07_overflowing_totals_are_invariant_violations() {
        let inputs = inputs_with(
            policy_normal(),
            vec![record("ev_1", "alice", i64::MAX, 1), record("ev_2", "alice", i64::MAX, 2)],
        );
        let err = compute_window(&inputs).unwrap_err();
        assert!(matches!(err, InvariantViolation::AmountOutOfRange { .. }));
    }

    #[test]
    fn at_compute_08_capped_row_reconciles_through_carry_out() {
        let mut policy = policy_normal();
        policy.cap_minor = Some(1_000);
        let out = compute_window(&inputs_with(policy.clone(), vec![record("ev_1", "bob", 2_000, 20)]))
            .unwrap();
        let bob = row(&out, "bob");
        assert_eq!(bob.base_minor, 2_000);
        assert_eq!(bob.policy_adjustments, 0);
        assert_eq!(bob.final_minor, 1_000);
        assert_eq!(bob.carry_out_minor, 1_000);
        assert!(bob.reason_codes.contains(&AllocationReason::CapApplied));

        policy.bonus_pool_minor = 500;
        let out = compute_window(&inputs_with(policy, vec![record("ev_1", "bob", 2_000, 20)])).unwrap();
        let bob = row(&out, "bob");
        assert_eq!(bob.policy_adjustments, 500);
        assert_eq!(bob.final_minor, 1_000);
        assert_eq!(bob.carry_out_minor, 1_500);
        assert_eq!(
            bob.carry_in_minor + bob.base_minor + bob.policy_adjustments,
            bob.final_minor + bob.carry_out_minor
        );
        assert_eq!(out.totals.pool_carry_out_minor, 0);
    }
}
