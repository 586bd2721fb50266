#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use thiserror::Error;
use vgo_kernel_contracts::acceptance::{
    AcceptanceReason, Attestation, ProofCheck, ProofVerdict, ED25519_SIGNATURE_LEN,
};
use vgo_kernel_contracts::allocation::Decision;
use vgo_kernel_contracts::ids::{AcceptanceId, ProofKind, SealHash, SignerId};
use vgo_kernel_contracts::policy::PolicyManifest;
use vgo_kernel_contracts::{ContractViolation, UnixSeconds};

use crate::digest::sha256_tagged_hex;

const ATTESTATION_DOMAIN: &str = "vgo.attest.v1";
const BUNDLE_DIGEST_TAG: &[u8] = b"vgo.bundle.v1\n";
const ACCEPTANCE_ID_TAG: &[u8] = b"vgo.acceptance.v1\n";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("key registry unavailable: {0}")]
pub struct RegistryUnavailable(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyParseError {
    #[error("entry {0:?} is not signer_id=hex_public_key")]
    Malformed(String),
    #[error("invalid signer id: {0}")]
    Signer(ContractViolation),
    #[error("public key for {0} is not a 32-byte ed25519 key")]
    Key(String),
}

/// Resolves signer ids to Ed25519 public keys.
pub trait KeyRegistry {
    /// `Ok(None)` means the signer is not trusted.
    fn verifying_key(&self, signer_id: &SignerId) -> Result<Option<VerifyingKey>, RegistryUnavailable>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryKeyRegistry {
    keys: BTreeMap<SignerId, VerifyingKey>,
    unavailable: bool,
}

impl InMemoryKeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, signer_id: SignerId, key: VerifyingKey) {
        self.keys.insert(signer_id, key);
    }

    /// Parses `signer_a=<hex>,signer_b=<hex>`.
    pub fn from_pairs(pairs: &str) -> Result<Self, KeyParseError> {
        let mut registry = Self::new();
        for entry in pairs.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (signer, key_hex) = entry
                .split_once('=')
                .ok_or_else(|| KeyParseError::Malformed(entry.to_string()))?;
            let signer_id = SignerId::new(signer.trim()).map_err(KeyParseError::Signer)?;
            let key = verifying_key_from_hex(key_hex.trim())
                .ok_or_else(|| KeyParseError::Key(signer_id.to_string()))?;
            registry.insert(signer_id, key);
        }
        Ok(registry)
    }

    /// Simulates an outage of the backing key service.
    pub fn set_unavailable(&mut self, unavailable: bool) {
        self.unavailable = unavailable;
    }

    pub fn signer_ids(&self) -> impl Iterator<Item = &SignerId> {
        self.keys.keys()
    }
}

impl KeyRegistry for InMemoryKeyRegistry {
    fn verifying_key(&self, signer_id: &SignerId) -> Result<Option<VerifyingKey>, RegistryUnavailable> {
        if self.unavailable {
            return Err(RegistryUnavailable("in-memory registry disabled".to_string()));
        }
        Ok(self.keys.get(signer_id).copied())
    }
}

pub fn verifying_key_from_hex(key_hex: &str) -> Option<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(key_hex).ok()?.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

/// Bytes an attester signs.
pub fn attestation_message(
    kind: &ProofKind,
    signer_id: &SignerId,
    issued_at: UnixSeconds,
    seal_hash: &SealHash,
) -> Vec<u8> {
    format!(
        "{ATTESTATION_DOMAIN}|{}|{}|{}|{}",
        kind.as_str(),
        signer_id.as_str(),
        issued_at.0,
        seal_hash.as_str()
    )
    .into_bytes()
}

pub fn sign_attestation(
    signing_key: &SigningKey,
    kind: ProofKind,
    signer_id: SignerId,
    issued_at: UnixSeconds,
    seal_hash: SealHash,
) -> Result<Attestation, ContractViolation> {
    let message = attestation_message(&kind, &signer_id, issued_at, &seal_hash);
    let signature = signing_key.sign(&message);
    Attestation::v1(
        kind,
        signer_id,
        issued_at,
        hex::encode(signature.to_bytes()),
        seal_hash,
    )
}

fn canonical_proof_cmp(a: &Attestation, b: &Attestation) -> std::cmp::Ordering {
    a.signer_id
        .cmp(&b.signer_id)
        .then_with(|| a.kind.cmp(&b.kind))
        .then_with(|| a.issued_at.cmp(&b.issued_at))
        .then_with(|| a.signature_hex.cmp(&b.signature_hex))
}

/// Digest over the proofs in canonical order; submission order is irrelevant.
pub fn bundle_digest(proofs: &[Attestation]) -> String {
    let mut sorted = proofs.iter().collect::<Vec<_>>();
    sorted.sort_by(|a, b| canonical_proof_cmp(a, b));
    let lines = sorted
        .iter()
        .map(|p| {
            format!(
                "{}|{}|{}|{}|{}",
                p.kind.as_str(),
                p.signer_id.as_str(),
                p.issued_at.0,
                p.signature_hex,
                p.seal_hash.as_str()
            )
        })
        .collect::<Vec<_>>();
    let parts = lines.iter().map(|l| l.as_bytes()).collect::<Vec<_>>();
    sha256_tagged_hex(BUNDLE_DIGEST_TAG, &parts)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptanceConfig {
    pub max_future_skew_s: u64,
    pub max_proofs_per_bundle: usize,
}

impl AcceptanceConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_future_skew_s: 60,
            max_proofs_per_bundle: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptanceOutcome {
    pub decision: Decision,
    pub reason_code: Option<AcceptanceReason>,
    pub verdicts: Vec<ProofVerdict>,
    pub valid_proof_count: u16,
    pub bundle_digest: String,
    pub quorum: u8,
    pub freshness_s: u64,
}

impl AcceptanceOutcome {
    pub fn acceptance_id(&self, seal_hash: &SealHash) -> Result<AcceptanceId, ContractViolation> {
        let quorum = self.quorum.to_string();
        let freshness = self.freshness_s.to_string();
        let reason = self.reason_code.map(AcceptanceReason::as_str).unwrap_or("-");
        AcceptanceId::from_hex(sha256_tagged_hex(
            ACCEPTANCE_ID_TAG,
            &[
                seal_hash.as_str().as_bytes(),
                self.bundle_digest.as_bytes(),
                quorum.as_bytes(),
                freshness.as_bytes(),
                self.decision.as_str().as_bytes(),
                reason.as_bytes(),
            ],
        ))
    }
}

#[derive(Debug, Clone)]
pub struct AcceptanceRuntime {
    config: AcceptanceConfig,
}

impl AcceptanceRuntime {
    pub fn new(config: AcceptanceConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> AcceptanceConfig {
        self.config
    }

    /// Checks every proof against `seal_hash` and applies the quorum gate.
    ///
    /// Quorum and freshness are read from the sealed policy, never from the
    /// caller. A signer counts at most once.
    pub fn evaluate<K: KeyRegistry + ?Sized>(
        &self,
        seal_hash: &SealHash,
        policy: &PolicyManifest,
        proofs: &[Attestation],
        now: UnixSeconds,
        registry: &K,
    ) -> AcceptanceOutcome {
        let mut sorted = proofs.to_vec();
        sorted.sort_by(canonical_proof_cmp);

        let mut counted_signers: BTreeSet<SignerId> = BTreeSet::new();
        let mut valid_kinds: BTreeSet<ProofKind> = BTreeSet::new();
        let mut verdicts = Vec::with_capacity(sorted.len());
        for proof in &sorted {
            let check = self.check_proof(proof, seal_hash, policy.freshness_s, now, registry);
            if check == ProofCheck::Valid {
                valid_kinds.insert(proof.kind.clone());
            }
            // Kinds come from every valid proof; quorum counts each signer once.
            let check = if check == ProofCheck::Valid && counted_signers.contains(&proof.signer_id)
            {
                ProofCheck::DuplicateSigner
            } else {
                check
            };
            if check == ProofCheck::Valid {
                counted_signers.insert(proof.signer_id.clone());
            }
            verdicts.push(ProofVerdict {
                signer_id: proof.signer_id.clone(),
                kind: proof.kind.clone(),
                issued_at: proof.issued_at,
                check,
            });
        }

        let valid = counted_signers.len();
        let quorum = usize::from(policy.quorum);
        let required_met = policy.required_proof_kinds.is_subset(&valid_kinds);
        let reason_code = if valid >= quorum && required_met {
            None
        } else if valid >= quorum {
            Some(AcceptanceReason::MissingRequiredProof)
        } else if valid == 0 {
            Some(
                verdicts
                    .iter()
                    .find_map(|v| v.check.blocking_reason())
                    .unwrap_or(AcceptanceReason::InsufficientQuorum),
            )
        } else {
            Some(AcceptanceReason::InsufficientQuorum)
        };

        AcceptanceOutcome {
            decision: if reason_code.is_none() {
                Decision::Allow
            } else {
                Decision::Hold
            },
            reason_code,
            verdicts,
            valid_proof_count: u16::try_from(valid).unwrap_or(u16::MAX),
            bundle_digest: bundle_digest(proofs),
            quorum: policy.quorum,
            freshness_s: policy.freshness_s,
        }
    }

    fn check_proof<K: KeyRegistry + ?Sized>(
        &self,
        proof: &Attestation,
        seal_hash: &SealHash,
        freshness_s: u64,
        now: UnixSeconds,
        registry: &K,
    ) -> ProofCheck {
        if proof.seal_hash != *seal_hash {
            return ProofCheck::SealMismatch;
        }
        let key = match registry.verifying_key(&proof.signer_id) {
            Err(_) => return ProofCheck::VerifierUnavailable,
            Ok(None) => return ProofCheck::UnknownSigner,
            Ok(Some(key)) => key,
        };
        let signature = match hex::decode(&proof.signature_hex) {
            Ok(bytes) if bytes.len() == ED25519_SIGNATURE_LEN => {
                match Signature::from_slice(&bytes) {
                    Ok(sig) => sig,
                    Err(_) => return ProofCheck::InvalidSignature,
                }
            }
            _ => return ProofCheck::InvalidSignature,
        };
        let message = attestation_message(&proof.kind, &proof.signer_id, proof.issued_at, seal_hash);
        if key.verify_strict(&message, &signature).is_err() {
            return ProofCheck::InvalidSignature;
        }
        if proof.issued_at.0 > now.0.saturating_add(self.config.max_future_skew_s) {
            return ProofCheck::FutureDatedProof;
        }
        if now.0.saturating_sub(proof.issued_at.0) > freshness_s {
            return ProofCheck::StaleProof;
        }
        ProofCheck::Valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::policy_normal;

    const NOW: UnixSeconds = UnixSeconds(1_700_000_000);

    fn seal() -> SealHash {
        SealHash::from_hex("ab".repeat(32)).unwrap()
    }

    fn signer(seed: u8, id: &str, registry: &mut InMemoryKeyRegistry) -> (SigningKey, SignerId) {
        let key = SigningKey::from_bytes(&[seed; 32]);
        let signer_id = SignerId::new(id).unwrap();
        registry.insert(signer_id.clone(), key.verifying_key());
        (key, signer_id)
    }

    fn proof(key: &SigningKey, signer_id: &SignerId, issued_at: u64) -> Attestation {
        sign_attestation(
            key,
            ProofKind::book_reserves_ok(),
            signer_id.clone(),
            UnixSeconds(issued_at),
            seal(),
        )
        .unwrap()
    }

    #[test]
    fn at_accept_01_quorum_of_distinct_fresh_signers_allows() {
        let mut registry = InMemoryKeyRegistry::new();
        let (ka, a) = signer(1, "treasury", &mut registry);
        let (kb, b) = signer(2, "auditor", &mut registry);
        let (_, c) = signer(3, "ops", &mut registry);
        // Signed with the wrong key for `ops`.
        let forged = proof(&ka, &c, NOW.0 - 10);
        let rt = AcceptanceRuntime::new(AcceptanceConfig::mvp_v1());
        let out = rt.evaluate(
            &seal(),
            &policy_normal(),
            &[proof(&ka, &a, NOW.0 - 10), proof(&kb, &b, NOW.0 - 20), forged],
            NOW,
            &registry,
        );
        assert_eq!(out.decision, Decision::Allow);
        assert_eq!(out.reason_code, None);
        assert_eq!(out.valid_proof_count, 2);
        assert!(out
            .verdicts
            .iter()
            .any(|v| v.check == ProofCheck::InvalidSignature));
    }

    #[test]
    fn at_accept_02_one_valid_one_stale_is_insufficient_quorum() {
        let mut registry = InMemoryKeyRegistry::new();
        let (ka, a) = signer(1, "treasury", &mut registry);
        let (kb, b) = signer(2, "auditor", &mut registry);
        let rt = AcceptanceRuntime::new(AcceptanceConfig::mvp_v1());
        let out = rt.evaluate(
            &seal(),
            &policy_normal(),
            &[proof(&ka, &a, NOW.0 - 10), proof(&kb, &b, NOW.0 - 7_200)],
            NOW,
            &registry,
        );
        assert_eq!(out.decision, Decision::Hold);
        assert_eq!(out.reason_code, Some(AcceptanceReason::InsufficientQuorum));
        assert_eq!(out.valid_proof_count, 1);
    }

    #[test]
    fn at_accept_03_lone_stale_proof_reports_stale() {
        let mut registry = InMemoryKeyRegistry::new();
        let (ka, a) = signer(1, "treasury", &mut registry);
        let mut policy = policy_normal();
        policy.quorum = 1;
        let rt = AcceptanceRuntime::new(AcceptanceConfig::mvp_v1());
        let out = rt.evaluate(
            &seal(),
            &policy,
            &[proof(&ka, &a, NOW.0 - 7_200)],
            NOW,
            &registry,
        );
        assert_eq!(out.reason_code, Some(AcceptanceReason::StaleProof));
    }

    #[test]
    fn at_accept_04_same_signer_counts_once() {
        let mut registry = InMemoryKeyRegistry::new();
        let (ka, a) = signer(1, "treasury", &mut registry);
        let rt = AcceptanceRuntime::new(AcceptanceConfig::mvp_v1());
        let out = rt.evaluate(
            &seal(),
            &policy_normal(),
            &[proof(&ka, &a, NOW.0 - 10), proof(&ka, &a, NOW.0 - 5)],
            NOW,
            &registry,
        );
        assert_eq!(out.valid_proof_count, 1);
        assert_eq!(out.reason_code, Some(AcceptanceReason::InsufficientQuorum));
        assert!(out
            .verdicts
            .iter()
            .any(|v| v.check == ProofCheck::DuplicateSigner));
    }

    #[test]
    fn at_accept_05_wrong_seal_unknown_signer_and_outage() {
        let mut registry = InMemoryKeyRegistry::new();
        let (ka, a) = signer(1, "treasury", &mut registry);
        let rt = AcceptanceRuntime::new(AcceptanceConfig::mvp_v1());
        let mut policy = policy_normal();
        policy.quorum = 1;

        let other_seal = SealHash::from_hex("cd".repeat(32)).unwrap();
        let misbound = sign_attestation(
            &ka,
            ProofKind::book_reserves_ok(),
            a.clone(),
            UnixSeconds(NOW.0 - 1),
            other_seal,
        )
        .unwrap();
        let out = rt.evaluate(&seal(), &policy, &[misbound], NOW, &registry);
        assert_eq!(out.reason_code, Some(AcceptanceReason::SealMismatch));

        let stranger_key = SigningKey::from_bytes(&[9; 32]);
        let stranger = SignerId::new("stranger").unwrap();
        let out = rt.evaluate(
            &seal(),
            &policy,
            &[proof(&stranger_key, &stranger, NOW.0 - 1)],
            NOW,
            &registry,
        );
        assert_eq!(out.reason_code, Some(AcceptanceReason::UnknownSigner));

        registry.set_unavailable(true);
        let out = rt.evaluate(&seal(), &policy, &[proof(&ka, &a, NOW.0 - 1)], NOW, &registry);
        assert_eq!(out.reason_code, Some(AcceptanceReason::VerifierUnavailable));

        registry.set_unavailable(false);
        let out = rt.evaluate(&seal(), &policy, &[proof(&ka, &a, NOW.0 + 3_600)], NOW, &registry);
        assert_eq!(out.reason_code, Some(AcceptanceReason::FutureDatedProof));
    }

    #[test]
    fn at_accept_06_missing_required_kind_holds() {
        let mut registry = InMemoryKeyRegistry::new();
        let (ka, a) = signer(1, "treasury", &mut registry);
        let mut policy = policy_normal();
        policy.quorum = 1;
        let other_kind = sign_attestation(
            &ka,
            ProofKind::new("PAYROLL_REVIEWED").unwrap(),
            a,
            UnixSeconds(NOW.0 - 1),
            seal(),
        )
        .unwrap();
        let rt = AcceptanceRuntime::new(AcceptanceConfig::mvp_v1());
        let out = rt.evaluate(&seal(), &policy, &[other_kind], NOW, &registry);
        assert_eq!(out.reason_code, Some(AcceptanceReason::MissingRequiredProof));
    }

    #[test]
    fn at_accept_07_bundle_digest_and_acceptance_id_are_order_free() {
        let mut registry = InMemoryKeyRegistry::new();
        let (ka, a) = signer(1, "treasury", &mut registry);
        let (kb, b) = signer(2, "auditor", &mut registry);
        let pa = proof(&ka, &a, NOW.0 - 10);
        let pb = proof(&kb, &b, NOW.0 - 10);
        assert_eq!(
            bundle_digest(&[pa.clone(), pb.clone()]),
            bundle_digest(&[pb.clone(), pa.clone()])
        );
        let rt = AcceptanceRuntime::new(AcceptanceConfig::mvp_v1());
        let x = rt.evaluate(&seal(), &policy_normal(), &[pa.clone(), pb.clone()], NOW, &registry);
        let y = rt.evaluate(&seal(), &policy_normal(), &[pb, pa], NOW, &registry);
        assert_eq!(x.acceptance_id(&seal()).unwrap(), y.acceptance_id(&seal()).unwrap());
    }

    #[test]
    fn at_accept_08_registry_parses_signer_pairs() {
        let key = SigningKey::from_bytes(&[4; 32]);
        let pairs = format!(
            "treasury={}, auditor={}",
            hex::encode(key.verifying_key().to_bytes()),
            hex::encode(key.verifying_key().to_bytes())
        );
        let registry = InMemoryKeyRegistry::from_pairs(&pairs).unwrap();
        assert_eq!(registry.signer_ids().count(), 2);
        assert!(InMemoryKeyRegistry::from_pairs("treasury").is_err());
        assert!(InMemoryKeyRegistry::from_pairs("treasury=zz").is_err());
    }

    #[test]
    fn at_accept_09_required_kind_counts_behind_same_signer_earlier_kind() {
        let mut registry = InMemoryKeyRegistry::new();
        let (ka, a) = signer(1, "treasury", &mut registry);
        let (kb, b) = signer(2, "auditor", &mut registry);
        let audit = |key: &SigningKey, id: &SignerId| {
            sign_attestation(
                key,
                ProofKind::new("AUDIT_OK").unwrap(),
                id.clone(),
                UnixSeconds(NOW.0 - 5),
                seal(),
            )
            .unwrap()
        };
        let bundle = [audit(&ka, &a), proof(&ka, &a, NOW.0 - 5), audit(&kb, &b)];
        let rt = AcceptanceRuntime::new(AcceptanceConfig::mvp_v1());
        let out = rt.evaluate(&seal(), &policy_normal(), &bundle, NOW, &registry);
        assert_eq!(out.decision, Decision::Allow);
        assert_eq!(out.reason_code, None);
        assert_eq!(out.valid_proof_count, 2);
        assert!(out.verdicts.iter().any(|v| v.signer_id == a
            && v.kind == ProofKind::book_reserves_ok()
            && v.check == ProofCheck::DuplicateSigner));
    }
}
