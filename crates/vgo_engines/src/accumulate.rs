#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use vgo_kernel_contracts::event::{EventKind, EventRecord};
use vgo_kernel_contracts::ids::PrincipalId;

use crate::compute::InvariantViolation;
use crate::ordering::assert_canonical_order;

/// Per-principal sums for one window, held in i128.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrincipalSums {
    pub base_earning: i128,
    pub refund: i128,
    pub adjustment: i128,
    pub bonus: i128,
    pub event_count: u32,
}

impl PrincipalSums {
    /// Sum of every event amount, regardless of kind.
    pub fn net(&self) -> Result<i128, InvariantViolation> {
        [self.refund, self.adjustment, self.bonus]
            .into_iter()
            .try_fold(self.base_earning, |acc, v| acc.checked_add(v))
            .ok_or(InvariantViolation::AccumulatorOverflow {
                stage: "principal_net",
            })
    }

    /// Pro-rata weight for the bonus pool.
    pub fn pool_weight(&self) -> i128 {
        self.base_earning.max(0)
    }

    fn add(&mut self, kind: EventKind, amount: i128) -> Result<(), InvariantViolation> {
        let slot = match kind {
            EventKind::BaseEarning => &mut self.base_earning,
            EventKind::Refund => &mut self.refund,
            EventKind::Adjustment => &mut self.adjustment,
            EventKind::Bonus => &mut self.bonus,
        };
        *slot = slot
            .checked_add(amount)
            .ok_or(InvariantViolation::AccumulatorOverflow {
                stage: "event_fold",
            })?;
        self.event_count = self.event_count.saturating_add(1);
        Ok(())
    }
}

/// Folds canonically ordered events into per-principal sums.
pub fn accumulate(
    ordered: &[EventRecord],
) -> Result<BTreeMap<PrincipalId, PrincipalSums>, InvariantViolation> {
    assert_canonical_order(ordered);
    let mut sums: BTreeMap<PrincipalId, PrincipalSums> = BTreeMap::new();
    for ev in ordered {
        sums.entry(ev.principal_id.clone())
            .or_default()
            .add(ev.kind, i128::from(ev.amount_minor))?;
    }
    Ok(sums)
}
