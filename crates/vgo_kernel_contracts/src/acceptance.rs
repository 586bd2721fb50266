#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::allocation::Decision;
use crate::common::validate_hex;
use crate::ids::{AcceptanceId, ProofKind, SealHash, SignerId, WindowId};
use crate::{ContractViolation, SchemaVersion, UnixSeconds, Validate};

pub const ACCEPTANCE_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const ED25519_SIGNATURE_LEN: usize = 64;

/// One signed statement about a sealed window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    pub kind: ProofKind,
    pub signer_id: SignerId,
    pub issued_at: UnixSeconds,
    pub signature_hex: String,
    pub seal_hash: SealHash,
}

impl Attestation {
    pub fn v1(
        kind: ProofKind,
        signer_id: SignerId,
        issued_at: UnixSeconds,
        signature_hex: String,
        seal_hash: SealHash,
    ) -> Result<Self, ContractViolation> {
        let proof = Self {
            kind,
            signer_id,
            issued_at,
            signature_hex,
            seal_hash,
        };
        proof.validate()?;
        Ok(proof)
    }
}

impl Validate for Attestation {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.kind.validate()?;
        self.signer_id.validate()?;
        self.seal_hash.validate()?;
        validate_hex(
            "attestation.signature_hex",
            &self.signature_hex,
            ED25519_SIGNATURE_LEN,
        )?;
        if self.issued_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "attestation.issued_at",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProofCheck {
    Valid,
    SealMismatch,
    UnknownSigner,
    InvalidSignature,
    StaleProof,
    FutureDatedProof,
    DuplicateSigner,
    VerifierUnavailable,
}

impl ProofCheck {
    pub fn as_str(self) -> &'static str {
        match self {
            ProofCheck::Valid => "VALID",
            ProofCheck::SealMismatch => "SEAL_MISMATCH",
            ProofCheck::UnknownSigner => "UNKNOWN_SIGNER",
            ProofCheck::InvalidSignature => "INVALID_SIGNATURE",
            ProofCheck::StaleProof => "STALE_PROOF",
            ProofCheck::FutureDatedProof => "FUTURE_DATED_PROOF",
            ProofCheck::DuplicateSigner => "DUPLICATE_SIGNER",
            ProofCheck::VerifierUnavailable => "VERIFIER_UNAVAILABLE",
        }
    }

    /// Bundle-level reason a failing proof contributes, if any.
    pub fn blocking_reason(self) -> Option<AcceptanceReason> {
        match self {
            ProofCheck::Valid | ProofCheck::DuplicateSigner => None,
            ProofCheck::SealMismatch => Some(AcceptanceReason::SealMismatch),
            ProofCheck::UnknownSigner => Some(AcceptanceReason::UnknownSigner),
            ProofCheck::InvalidSignature => Some(AcceptanceReason::InvalidSignature),
            ProofCheck::StaleProof => Some(AcceptanceReason::StaleProof),
            ProofCheck::FutureDatedProof => Some(AcceptanceReason::FutureDatedProof),
            ProofCheck::VerifierUnavailable => Some(AcceptanceReason::VerifierUnavailable),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcceptanceReason {
    StaleProof,
    InsufficientQuorum,
    InvalidSignature,
    VerifierUnavailable,
    SealMismatch,
    UnknownSigner,
    FutureDatedProof,
    MissingRequiredProof,
}

impl AcceptanceReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AcceptanceReason::StaleProof => "STALE_PROOF",
            AcceptanceReason::InsufficientQuorum => "INSUFFICIENT_QUORUM",
            AcceptanceReason::InvalidSignature => "INVALID_SIGNATURE",
            AcceptanceReason::VerifierUnavailable => "VERIFIER_UNAVAILABLE",
            AcceptanceReason::SealMismatch => "SEAL_MISMATCH",
            AcceptanceReason::UnknownSigner => "UNKNOWN_SIGNER",
            AcceptanceReason::FutureDatedProof => "FUTURE_DATED_PROOF",
            AcceptanceReason::MissingRequiredProof => "MISSING_REQUIRED_PROOF",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcceptanceState {
    Unsealed,
    Sealed,
    Verifying,
    Allow,
    Hold,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofVerdict {
    pub signer_id: SignerId,
    pub kind: ProofKind,
    pub issued_at: UnixSeconds,
    pub check: ProofCheck,
}

/// Proofs gathered against exactly one seal hash, plus their last evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceBundle {
    pub seal_hash: SealHash,
    pub quorum: u8,
    pub freshness_s: u64,
    pub proofs: Vec<Attestation>,
    pub verdicts: Vec<ProofVerdict>,
    pub verified: bool,
    pub reason_code: Option<AcceptanceReason>,
}

impl AcceptanceBundle {
    pub fn empty_v1(seal_hash: SealHash, quorum: u8, freshness_s: u64) -> Self {
        Self {
            seal_hash,
            quorum,
            freshness_s,
            proofs: Vec::new(),
            verdicts: Vec::new(),
            verified: false,
            reason_code: None,
        }
    }
}

/// Final decision bound to one seal hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptanceRecord {
    pub schema_version: SchemaVersion,
    pub acceptance_id: AcceptanceId,
    pub window_id: WindowId,
    pub seal_hash: SealHash,
    pub decision: Decision,
    pub reason_code: Option<AcceptanceReason>,
    pub quorum: u8,
    pub freshness_s: u64,
    pub valid_proof_count: u16,
    pub bundle_digest: String,
    pub evaluated_at: UnixSeconds,
}

impl AcceptanceRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        acceptance_id: AcceptanceId,
        window_id: WindowId,
        seal_hash: SealHash,
        decision: Decision,
        reason_code: Option<AcceptanceReason>,
        quorum: u8,
        freshness_s: u64,
        valid_proof_count: u16,
        bundle_digest: String,
        evaluated_at: UnixSeconds,
    ) -> Result<Self, ContractViolation> {
        let record = Self {
            schema_version: ACCEPTANCE_CONTRACT_VERSION,
            acceptance_id,
            window_id,
            seal_hash,
            decision,
            reason_code,
            quorum,
            freshness_s,
            valid_proof_count,
            bundle_digest,
            evaluated_at,
        };
        record.validate()?;
        Ok(record)
    }
}

impl Validate for AcceptanceRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != ACCEPTANCE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "acceptance_record.schema_version",
                reason: "must match ACCEPTANCE_CONTRACT_VERSION",
            });
        }
        self.acceptance_id.validate()?;
        self.window_id.validate()?;
        self.seal_hash.validate()?;
        validate_hex("acceptance_record.bundle_digest", &self.bundle_digest, 32)?;
        match self.decision {
            Decision::Allow => {
                if self.reason_code.is_some() {
                    return Err(ContractViolation::InvalidValue {
                        field: "acceptance_record.reason_code",
                        reason: "must be absent when decision=ALLOW",
                    });
                }
                if self.valid_proof_count < u16::from(self.quorum) {
                    return Err(ContractViolation::InvalidValue {
                        field: "acceptance_record.valid_proof_count",
                        reason: "ALLOW requires valid_proof_count >= quorum",
                    });
                }
            }
            Decision::Hold => {
                if self.reason_code.is_none() {
                    return Err(ContractViolation::InvalidValue {
                        field: "acceptance_record.reason_code",
                        reason: "must be present when decision=HOLD",
                    });
                }
            }
        }
        Ok(())
    }
}
