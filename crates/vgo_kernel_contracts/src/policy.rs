#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::ids::{PrincipalId, ProofKind};
use crate::{ContractViolation, SchemaVersion, Validate};

pub const POLICY_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const MAX_QUORUM: u8 = 16;
pub const MAX_FRESHNESS_S: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PolicyVersion(pub u32);

/// Named quorum/freshness pairs. The manifest stores the resolved numbers,
/// so a preset can be retuned without changing any sealed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcceptancePreset {
    Strict,
    Normal,
    Lenient,
}

impl AcceptancePreset {
    pub fn quorum(self) -> u8 {
        match self {
            AcceptancePreset::Strict => 3,
            AcceptancePreset::Normal => 2,
            AcceptancePreset::Lenient => 1,
        }
    }

    pub fn freshness_s(self) -> u64 {
        match self {
            AcceptancePreset::Strict => 15 * 60,
            AcceptancePreset::Normal => 60 * 60,
            AcceptancePreset::Lenient => 24 * 60 * 60,
        }
    }

    pub fn parse(v: &str) -> Option<Self> {
        match v.to_ascii_lowercase().as_str() {
            "strict" => Some(AcceptancePreset::Strict),
            "normal" => Some(AcceptancePreset::Normal),
            "lenient" => Some(AcceptancePreset::Lenient),
            _ => None,
        }
    }
}

/// Per-tenant settlement policy, sealed into every transcript it governs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyManifest {
    pub schema_version: SchemaVersion,
    pub policy_version: PolicyVersion,
    pub cap_minor: Option<i64>,
    pub min_payout_minor: i64,
    pub bonus_pool_minor: i64,
    pub ineligible_principals: BTreeSet<PrincipalId>,
    pub late_grace_ticks: u64,
    pub quorum: u8,
    pub freshness_s: u64,
    pub required_proof_kinds: BTreeSet<ProofKind>,
    pub hold_rows_in_ledger: bool,
}

impl PolicyManifest {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        policy_version: PolicyVersion,
        cap_minor: Option<i64>,
        min_payout_minor: i64,
        bonus_pool_minor: i64,
        ineligible_principals: BTreeSet<PrincipalId>,
        late_grace_ticks: u64,
        quorum: u8,
        freshness_s: u64,
        required_proof_kinds: BTreeSet<ProofKind>,
        hold_rows_in_ledger: bool,
    ) -> Result<Self, ContractViolation> {
        let manifest = Self {
            schema_version: POLICY_CONTRACT_VERSION,
            policy_version,
            cap_minor,
            min_payout_minor,
            bonus_pool_minor,
            ineligible_principals,
            late_grace_ticks,
            quorum,
            freshness_s,
            required_proof_kinds,
            hold_rows_in_ledger,
        };
        manifest.validate()?;
        Ok(manifest)
    }

    /// No caps, no pool, no minimum; quorum and freshness from `preset`.
    pub fn from_preset(
        policy_version: PolicyVersion,
        preset: AcceptancePreset,
    ) -> Result<Self, ContractViolation> {
        Self::v1(
            policy_version,
            None,
            0,
            0,
            BTreeSet::new(),
            0,
            preset.quorum(),
            preset.freshness_s(),
            BTreeSet::from([ProofKind::book_reserves_ok()]),
            true,
        )
    }
}

impl Validate for PolicyManifest {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != POLICY_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "policy_manifest.schema_version",
                reason: "must match POLICY_CONTRACT_VERSION",
            });
        }
        if self.policy_version.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "policy_manifest.policy_version",
                reason: "must be > 0",
            });
        }
        if let Some(cap) = self.cap_minor {
            if cap <= 0 {
                return Err(ContractViolation::InvalidValue {
                    field: "policy_manifest.cap_minor",
                    reason: "must be > 0 when present",
                });
            }
        }
        if self.min_payout_minor < 0 {
            return Err(ContractViolation::InvalidValue {
                field: "policy_manifest.min_payout_minor",
                reason: "must be >= 0",
            });
        }
        if self.bonus_pool_minor < 0 {
            return Err(ContractViolation::InvalidValue {
                field: "policy_manifest.bonus_pool_minor",
                reason: "must be >= 0",
            });
        }
        for principal in &self.ineligible_principals {
            principal.validate()?;
        }
        if self.quorum == 0 || self.quorum > MAX_QUORUM {
            return Err(ContractViolation::InvalidRange {
                field: "policy_manifest.quorum",
                min: 1,
                max: i128::from(MAX_QUORUM),
                got: i128::from(self.quorum),
            });
        }
        if self.freshness_s == 0 || self.freshness_s > MAX_FRESHNESS_S {
            return Err(ContractViolation::InvalidRange {
                field: "policy_manifest.freshness_s",
                min: 1,
                max: i128::from(MAX_FRESHNESS_S),
                got: i128::from(self.freshness_s),
            });
        }
        for kind in &self.required_proof_kinds {
            kind.validate()?;
        }
        Ok(())
    }
}
