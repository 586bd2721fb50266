#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::ids::PrincipalId;
use crate::{ContractViolation, Validate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    Hold,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Allow => "ALLOW",
            Decision::Hold => "HOLD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AllocationReason {
    CarryInApplied,
    BonusPoolShare,
    RemainderUnit,
    CapApplied,
    PrincipalIneligible,
    NegativeBalanceCarried,
    BelowMinPayout,
    NothingDue,
}

impl AllocationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AllocationReason::CarryInApplied => "CARRY_IN_APPLIED",
            AllocationReason::BonusPoolShare => "BONUS_POOL_SHARE",
            AllocationReason::RemainderUnit => "REMAINDER_UNIT",
            AllocationReason::CapApplied => "CAP_APPLIED",
            AllocationReason::PrincipalIneligible => "PRINCIPAL_INELIGIBLE",
            AllocationReason::NegativeBalanceCarried => "NEGATIVE_BALANCE_CARRIED",
            AllocationReason::BelowMinPayout => "BELOW_MIN_PAYOUT",
            AllocationReason::NothingDue => "NOTHING_DUE",
        }
    }
}

/// One row per principal per window.
///
/// Row identity: `carry_in + base + policy_adjustments == final + carry_out`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub principal_id: PrincipalId,
    pub base_minor: i64,
    pub policy_adjustments: i64,
    pub final_minor: i64,
    pub carry_in_minor: i64,
    pub carry_out_minor: i64,
    pub decision: Decision,
    pub reason_codes: Vec<AllocationReason>,
}

impl AllocationRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        principal_id: PrincipalId,
        base_minor: i64,
        policy_adjustments: i64,
        final_minor: i64,
        carry_in_minor: i64,
        carry_out_minor: i64,
        decision: Decision,
        reason_codes: Vec<AllocationReason>,
    ) -> Result<Self, ContractViolation> {
        let row = Self {
            principal_id,
            base_minor,
            policy_adjustments,
            final_minor,
            carry_in_minor,
            carry_out_minor,
            decision,
            reason_codes,
        };
        row.validate()?;
        Ok(row)
    }
}

impl Validate for AllocationRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.principal_id.validate()?;
        if self.final_minor < 0 {
            return Err(ContractViolation::InvalidValue {
                field: "allocation_record.final_minor",
                reason: "must be >= 0",
            });
        }
        let inflow = i128::from(self.carry_in_minor)
            + i128::from(self.base_minor)
            + i128::from(self.policy_adjustments);
        let outflow = i128::from(self.final_minor) + i128::from(self.carry_out_minor);
        if inflow != outflow {
            return Err(ContractViolation::InvalidValue {
                field: "allocation_record.final_minor",
                reason: "carry_in + base + adjustments must equal final + carry_out",
            });
        }
        if self.reason_codes.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ContractViolation::InvalidValue {
                field: "allocation_record.reason_codes",
                reason: "must be sorted and unique",
            });
        }
        Ok(())
    }
}

/// Per-principal carry handed from one window to its successor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CarryEntry {
    pub principal_id: PrincipalId,
    pub carry_minor: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowTotals {
    pub target_total_minor: i64,
    pub final_total_minor: i64,
    pub carry_out_total_minor: i64,
    pub bonus_pool_minor: i64,
    pub pool_carry_in_minor: i64,
    pub pool_carry_out_minor: i64,
    pub allow_total_minor: i64,
    pub hold_total_minor: i64,
}

impl WindowTotals {
    /// Everything that leaves the window without being paid.
    pub fn remainder_carried_out(&self) -> i128 {
        i128::from(self.carry_out_total_minor) + i128::from(self.pool_carry_out_minor)
    }
}

impl Validate for WindowTotals {
    fn validate(&self) -> Result<(), ContractViolation> {
        if i128::from(self.final_total_minor) + self.remainder_carried_out()
            != i128::from(self.target_total_minor)
        {
            return Err(ContractViolation::InvalidValue {
                field: "window_totals.target_total_minor",
                reason: "final_total + remainder_carried_out must equal target_total",
            });
        }
        if i128::from(self.allow_total_minor) + i128::from(self.hold_total_minor)
            != i128::from(self.final_total_minor)
        {
            return Err(ContractViolation::InvalidValue {
                field: "window_totals.final_total_minor",
                reason: "allow_total + hold_total must equal final_total",
            });
        }
        if self.pool_carry_out_minor < 0 || self.bonus_pool_minor < 0 {
            return Err(ContractViolation::InvalidValue {
                field: "window_totals.pool_carry_out_minor",
                reason: "pool amounts must be >= 0",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_allocation_01_row_identity_enforced() {
        let p = PrincipalId::new("alice").unwrap();
        assert!(AllocationRecord::v1(
            p.clone(),
            700,
            0,
            700,
            0,
            0,
            Decision::Allow,
            vec![]
        )
        .is_ok());
        assert!(AllocationRecord::v1(
            p.clone(),
            700,
            0,
            600,
            0,
            0,
            Decision::Allow,
            vec![]
        )
        .is_err());
        assert!(AllocationRecord::v1(
            p,
            -50,
            0,
            -50,
            0,
            0,
            Decision::Hold,
            vec![AllocationReason::NegativeBalanceCarried]
        )
        .is_err());
    }

    #[test]
    fn at_allocation_02_totals_conserve() {
        let totals = WindowTotals {
            target_total_minor: 2_700,
            final_total_minor: 2_650,
            carry_out_total_minor: 49,
            bonus_pool_minor: 0,
            pool_carry_in_minor: 0,
            pool_carry_out_minor: 1,
            allow_total_minor: 2_650,
            hold_total_minor: 0,
        };
        assert!(totals.validate().is_ok());
        let broken = WindowTotals {
            pool_carry_out_minor: 2,
            ..totals
        };
        assert!(broken.validate().is_err());
    }
}
