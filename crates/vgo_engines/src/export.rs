#![forbid(unsafe_code)]

use std::fmt::Write as _;

use serde::Serialize;
use thiserror::Error;
use vgo_kernel_contracts::acceptance::AcceptanceRecord;
use vgo_kernel_contracts::allocation::{AllocationRecord, Decision, WindowTotals};
use vgo_kernel_contracts::export::{
    ExportManifest, ManifestFile, ALLOCATIONS_FILE, EXPORT_CONTRACT_VERSION, LEDGER_ENTRIES_FILE,
    PAYMENT_INSTRUCTIONS_FILE,
};
use vgo_kernel_contracts::ids::{AcceptanceId, SealHash, WindowId};
use vgo_kernel_contracts::transcript::SealedTranscript;
use vgo_kernel_contracts::{ContractViolation, Validate};

use crate::digest::{sha256_hex, sha256_tagged_hex};

const MANIFEST_HASH_TAG: &[u8] = b"vgo.manifest.v1\n";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExportError {
    #[error("window is not accepted with decision ALLOW")]
    NotAccepted,
    #[error("acceptance seal {acceptance} does not match transcript seal {transcript}")]
    SealMismatch { acceptance: String, transcript: String },
    #[error("export encoding failed: {0}")]
    Encoding(String),
    #[error("manifest rejected: {0}")]
    Contract(ContractViolation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportConfig {
    /// Emit a JSON copy of the allocation set next to the CSVs.
    pub include_allocations_json: bool,
}

impl ExportConfig {
    pub fn mvp_v1() -> Self {
        Self {
            include_allocations_json: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportBundle {
    pub files: Vec<ArtifactFile>,
    pub manifest: ExportManifest,
}

#[derive(Serialize)]
struct AllocationsDocument<'a> {
    window_id: &'a WindowId,
    seal_hash: &'a SealHash,
    acceptance_id: &'a AcceptanceId,
    allocations: &'a [AllocationRecord],
    totals: &'a WindowTotals,
}

#[derive(Debug, Clone)]
pub struct ExportRuntime {
    config: ExportConfig,
}

impl ExportRuntime {
    pub fn new(config: ExportConfig) -> Self {
        Self { config }
    }

    /// Produces payment artifacts from the sealed allocation set only.
    pub fn materialize(
        &self,
        sealed: &SealedTranscript,
        acceptance: &AcceptanceRecord,
    ) -> Result<ExportBundle, ExportError> {
        if acceptance.decision != Decision::Allow {
            return Err(ExportError::NotAccepted);
        }
        if acceptance.seal_hash != sealed.seal_hash {
            return Err(ExportError::SealMismatch {
                acceptance: acceptance.seal_hash.to_string(),
                transcript: sealed.seal_hash.to_string(),
            });
        }
        let outputs = &sealed.transcript.outputs;
        let hold_rows = sealed.transcript.inputs.policy.hold_rows_in_ledger;

        let mut files = vec![
            ArtifactFile {
                name: PAYMENT_INSTRUCTIONS_FILE.to_string(),
                bytes: payment_instructions_csv(sealed, acceptance),
            },
            ArtifactFile {
                name: LEDGER_ENTRIES_FILE.to_string(),
                bytes: ledger_entries_csv(sealed, hold_rows),
            },
        ];
        if self.config.include_allocations_json {
            let doc = AllocationsDocument {
                window_id: &sealed.window_id,
                seal_hash: &sealed.seal_hash,
                acceptance_id: &acceptance.acceptance_id,
                allocations: &outputs.allocations,
                totals: &outputs.totals,
            };
            let mut bytes =
                serde_json::to_vec_pretty(&doc).map_err(|e| ExportError::Encoding(e.to_string()))?;
            bytes.push(b'\n');
            files.push(ArtifactFile {
                name: ALLOCATIONS_FILE.to_string(),
                bytes,
            });
        }
        files.sort_by(|a, b| a.name.cmp(&b.name));

        let entries = files
            .iter()
            .map(|f| manifest_entry(&f.name, &f.bytes))
            .collect::<Vec<_>>();
        let manifest_hash = manifest_hash(
            &sealed.window_id,
            &sealed.seal_hash,
            &acceptance.acceptance_id,
            &entries,
        );
        let manifest = ExportManifest {
            schema_version: EXPORT_CONTRACT_VERSION,
            window_id: sealed.window_id.clone(),
            seal_hash: sealed.seal_hash.clone(),
            acceptance_id: acceptance.acceptance_id.clone(),
            files: entries,
            manifest_hash,
        };
        manifest.validate().map_err(ExportError::Contract)?;
        Ok(ExportBundle { files, manifest })
    }
}

pub fn manifest_entry(name: &str, bytes: &[u8]) -> ManifestFile {
    ManifestFile {
        name: name.to_string(),
        bytes: bytes.len() as u64,
        sha256: sha256_hex(bytes),
    }
}

/// Hash over the manifest's bindings and file index.
pub fn manifest_hash(
    window_id: &WindowId,
    seal_hash: &SealHash,
    acceptance_id: &AcceptanceId,
    files: &[ManifestFile],
) -> String {
    let mut lines = vec![
        format!("window_id={}", window_id.as_str()),
        format!("seal_hash={}", seal_hash.as_str()),
        format!("acceptance_id={}", acceptance_id.as_str()),
    ];
    lines.extend(
        files
            .iter()
            .map(|f| format!("file={}\t{}\t{}", f.name, f.bytes, f.sha256)),
    );
    let parts = lines.iter().map(|l| l.as_bytes()).collect::<Vec<_>>();
    sha256_tagged_hex(MANIFEST_HASH_TAG, &parts)
}

fn payment_instructions_csv(sealed: &SealedTranscript, acceptance: &AcceptanceRecord) -> Vec<u8> {
    let mut out = String::from("window_id,seal_hash,acceptance_id,principal_id,amount_minor\n");
    for row in sealed
        .transcript
        .outputs
        .allocations
        .iter()
        .filter(|r| r.decision == Decision::Allow && r.final_minor > 0)
    {
        let _ = writeln!(
            out,
            "{},{},{},{},{}",
            sealed.window_id,
            sealed.seal_hash,
            acceptance.acceptance_id,
            row.principal_id,
            row.final_minor
        );
    }
    out.into_bytes()
}

fn ledger_entries_csv(sealed: &SealedTranscript, hold_rows: bool) -> Vec<u8> {
    let mut out = String::from(
        "window_id,principal_id,decision,carry_in_minor,base_minor,policy_adjustments,final_minor,carry_out_minor,reason_codes\n",
    );
    for row in sealed
        .transcript
        .outputs
        .allocations
        .iter()
        .filter(|r| r.decision == Decision::Allow || hold_rows)
    {
        let reasons = row
            .reason_codes
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{},{},{}",
            sealed.window_id,
            row.principal_id,
            row.decision.as_str(),
            row.carry_in_minor,
            row.base_minor,
            row.policy_adjustments,
            row.final_minor,
            row.carry_out_minor,
            reasons
        );
    }
    out.into_bytes()
}
