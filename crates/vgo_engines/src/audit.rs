#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use vgo_kernel_contracts::acceptance::AcceptanceRecord;
use vgo_kernel_contracts::allocation::{Decision, WindowTotals};
use vgo_kernel_contracts::audit::{AuditDiff, AuditReport};
use vgo_kernel_contracts::event::EventRecord;
use vgo_kernel_contracts::export::ExportManifest;
use vgo_kernel_contracts::transcript::SealedTranscript;

use crate::digest::sha256_hex;
use crate::export::manifest_hash;
use crate::seal::{replay_digest, transcript_digest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditConfig {
    pub replay: bool,
}

impl AuditConfig {
    pub fn mvp_v1() -> Self {
        Self { replay: true }
    }
}

/// Everything an auditor is handed: the sealed transcript, the decision,
/// the manifest, and the artifact bytes as actually delivered.
#[derive(Debug, Clone, Copy)]
pub struct AuditInputs<'a> {
    pub sealed: &'a SealedTranscript,
    pub acceptance: &'a AcceptanceRecord,
    pub manifest: &'a ExportManifest,
    pub delivered: &'a BTreeMap<String, Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct AuditRuntime {
    config: AuditConfig,
}

impl AuditRuntime {
    pub fn new(config: AuditConfig) -> Self {
        Self { config }
    }

    /// Runs every check and reports all differences, not just the first.
    pub fn audit(&self, inputs: AuditInputs<'_>) -> AuditReport {
        let sealed = inputs.sealed;
        let mut diffs = Vec::new();

        check_bindings(&inputs, &mut diffs);
        check_totals(sealed, &mut diffs);
        check_artifacts(inputs.manifest, inputs.delivered, &mut diffs);

        let recomputed_manifest_hash = manifest_hash(
            &inputs.manifest.window_id,
            &inputs.manifest.seal_hash,
            &inputs.manifest.acceptance_id,
            &inputs.manifest.files,
        );
        if recomputed_manifest_hash != inputs.manifest.manifest_hash {
            diffs.push(AuditDiff::ManifestHashMismatch {
                expected: inputs.manifest.manifest_hash.clone(),
                actual: recomputed_manifest_hash,
            });
        }

        match transcript_digest(&sealed.transcript) {
            Ok(stored) if stored != sealed.seal_hash => {
                diffs.push(AuditDiff::TranscriptDigestMismatch {
                    seal_hash: sealed.seal_hash.to_string(),
                    stored_digest: stored.to_string(),
                });
            }
            Ok(_) => {}
            Err(e) => diffs.push(AuditDiff::ReplayFailed {
                detail: e.to_string(),
            }),
        }

        let mut replayed = None;
        if self.config.replay {
            match replay_digest(&sealed.transcript) {
                Ok(digest) => {
                    if digest != sealed.seal_hash {
                        diffs.push(AuditDiff::ReplayDigestMismatch {
                            seal_hash: sealed.seal_hash.to_string(),
                            replay_digest: digest.to_string(),
                        });
                    }
                    replayed = Some(digest);
                }
                Err(e) => diffs.push(AuditDiff::ReplayFailed {
                    detail: e.to_string(),
                }),
            }
        }

        AuditReport::from_diffs(
            sealed.window_id.clone(),
            sealed.seal_hash.clone(),
            diffs,
            replayed,
        )
    }
}

fn check_bindings(inputs: &AuditInputs<'_>, diffs: &mut Vec<AuditDiff>) {
    let sealed = inputs.sealed;
    if inputs.acceptance.seal_hash != sealed.seal_hash {
        diffs.push(AuditDiff::AcceptanceSealMismatch {
            acceptance_seal_hash: inputs.acceptance.seal_hash.to_string(),
            seal_hash: sealed.seal_hash.to_string(),
        });
    }
    let bindings = [
        (
            "window_id",
            inputs.manifest.window_id.as_str(),
            sealed.window_id.as_str(),
        ),
        (
            "seal_hash",
            inputs.manifest.seal_hash.as_str(),
            sealed.seal_hash.as_str(),
        ),
        (
            "acceptance_id",
            inputs.manifest.acceptance_id.as_str(),
            inputs.acceptance.acceptance_id.as_str(),
        ),
    ];
    for (field, manifest, expected) in bindings {
        if manifest != expected {
            diffs.push(AuditDiff::ManifestBindingMismatch {
                field: field.to_string(),
                manifest: manifest.to_string(),
                expected: expected.to_string(),
            });
        }
    }
}

fn included_amount(sealed: &SealedTranscript) -> i128 {
    let included = sealed
        .transcript
        .outputs
        .ordered_event_ids
        .iter()
        .collect::<BTreeSet<_>>();
    sealed
        .transcript
        .inputs
        .events
        .iter()
        .filter(|ev| included.contains(&ev.event_id))
        .map(|ev: &EventRecord| i128::from(ev.amount_minor))
        .sum()
}

/// Recomputes the totals row from the allocation set and the recorded
/// inputs.
fn check_totals(sealed: &SealedTranscript, diffs: &mut Vec<AuditDiff>) {
    let inputs = &sealed.transcript.inputs;
    let outputs = &sealed.transcript.outputs;
    let rows = &outputs.allocations;
    let final_total = rows
        .iter()
        .map(|r| i128::from(r.final_minor))
        .sum::<i128>();
    let carry_out_total = rows
        .iter()
        .map(|r| i128::from(r.carry_out_minor))
        .sum::<i128>();
    let allow_total = rows
        .iter()
        .filter(|r| r.decision == Decision::Allow)
        .map(|r| i128::from(r.final_minor))
        .sum::<i128>();
    let carry_in_total = inputs
        .carry_in
        .iter()
        .map(|c| i128::from(c.carry_minor))
        .sum::<i128>();
    let target = carry_in_total
        + included_amount(sealed)
        + i128::from(inputs.policy.bonus_pool_minor)
        + i128::from(inputs.pool_carry_in_minor);
    let pool_carry_out = target - final_total - carry_out_total;

    let recorded: &WindowTotals = &outputs.totals;
    let checks = [
        ("target_total_minor", recorded.target_total_minor, target),
        ("final_total_minor", recorded.final_total_minor, final_total),
        (
            "carry_out_total_minor",
            recorded.carry_out_total_minor,
            carry_out_total,
        ),
        (
            "pool_carry_out_minor",
            recorded.pool_carry_out_minor,
            pool_carry_out,
        ),
        ("allow_total_minor", recorded.allow_total_minor, allow_total),
        (
            "hold_total_minor",
            recorded.hold_total_minor,
            final_total - allow_total,
        ),
    ];
    for (field, recorded, recomputed) in checks {
        if i128::from(recorded) != recomputed {
            diffs.push(AuditDiff::TotalsMismatch {
                field: field.to_string(),
                recorded,
                recomputed: i64::try_from(recomputed).unwrap_or(i64::MAX),
            });
        }
    }
}

fn check_artifacts(
    manifest: &ExportManifest,
    delivered: &BTreeMap<String, Vec<u8>>,
    diffs: &mut Vec<AuditDiff>,
) {
    for entry in &manifest.files {
        match delivered.get(&entry.name) {
            None => diffs.push(AuditDiff::ArtifactMissing {
                name: entry.name.clone(),
            }),
            Some(bytes) => {
                let actual = sha256_hex(bytes);
                let actual_bytes = bytes.len() as u64;
                if actual != entry.sha256 || actual_bytes != entry.bytes {
                    diffs.push(AuditDiff::ArtifactHashMismatch {
                        name: entry.name.clone(),
                        expected_sha256: entry.sha256.clone(),
                        actual_sha256: actual,
                        expected_bytes: entry.bytes,
                        actual_bytes,
                    });
                }
            }
        }
    }
    for name in delivered.keys() {
        if !manifest.files.iter().any(|f| &f.name == name) {
            diffs.push(AuditDiff::UnexpectedArtifact { name: name.clone() });
        }
    }
}
