#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use vgo_kernel_contracts::allocation::{AllocationRecord, CarryEntry};
use vgo_kernel_contracts::ids::PrincipalId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemainderCandidate {
    pub principal_id: PrincipalId,
    /// `None` means uncapped.
    pub headroom: Option<i128>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemainderAssignment {
    pub units: BTreeMap<PrincipalId, i128>,
    pub leftover: i128,
}

/// Hands out `remainder` one minor unit at a time, walking candidates in
/// principal order and skipping anyone at their cap. Whatever cannot be
/// placed is returned as `leftover` for the next window.
pub fn assign_remainder(remainder: i128, candidates: &[RemainderCandidate]) -> RemainderAssignment {
    let mut ordered = candidates.to_vec();
    ordered.sort_by(|a, b| a.principal_id.cmp(&b.principal_id));
    ordered.dedup_by(|a, b| a.principal_id == b.principal_id);

    let mut units: BTreeMap<PrincipalId, i128> = BTreeMap::new();
    let mut left = remainder.max(0);
    while left > 0 {
        let mut placed_this_pass = false;
        for candidate in &ordered {
            if left == 0 {
                break;
            }
            let given = units.get(&candidate.principal_id).copied().unwrap_or(0);
            if candidate.headroom.is_some_and(|room| given >= room) {
                continue;
            }
            *units.entry(candidate.principal_id.clone()).or_insert(0) += 1;
            left -= 1;
            placed_this_pass = true;
        }
        if !placed_this_pass {
            break;
        }
    }
    RemainderAssignment {
        units,
        leftover: left,
    }
}

/// Non-zero per-principal carry handed to the successor window.
pub fn carry_forward(allocations: &[AllocationRecord]) -> Vec<CarryEntry> {
    let mut out = allocations
        .iter()
        .filter(|row| row.carry_out_minor != 0)
        .map(|row| CarryEntry {
            principal_id: row.principal_id.clone(),
            carry_minor: row.carry_out_minor,
        })
        .collect::<Vec<_>>();
    out.sort();
    out
}
