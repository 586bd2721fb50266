#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_hex;
use crate::ids::{AcceptanceId, SealHash, WindowId};
use crate::{ContractViolation, SchemaVersion, Validate};

pub const EXPORT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const PAYMENT_INSTRUCTIONS_FILE: &str = "payment_instructions.csv";
pub const LEDGER_ENTRIES_FILE: &str = "ledger_entries.csv";
pub const ALLOCATIONS_FILE: &str = "allocations.json";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub bytes: u64,
    pub sha256: String,
}

impl Validate for ManifestFile {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.name.is_empty()
            || self.name.len() > 128
            || self.name.contains('/')
            || self.name.contains('\\')
            || self.name.starts_with('.')
        {
            return Err(ContractViolation::InvalidValue {
                field: "manifest_file.name",
                reason: "must be a plain file name",
            });
        }
        validate_hex("manifest_file.sha256", &self.sha256, 32)
    }
}

/// Hash index of exported artifacts, bound to one seal and one acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub schema_version: SchemaVersion,
    pub window_id: WindowId,
    pub seal_hash: SealHash,
    pub acceptance_id: AcceptanceId,
    pub files: Vec<ManifestFile>,
    pub manifest_hash: String,
}

impl Validate for ExportManifest {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != EXPORT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "export_manifest.schema_version",
                reason: "must match EXPORT_CONTRACT_VERSION",
            });
        }
        self.window_id.validate()?;
        self.seal_hash.validate()?;
        self.acceptance_id.validate()?;
        if self.files.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "export_manifest.files",
                reason: "must be non-empty",
            });
        }
        if self.files.windows(2).any(|w| w[0].name >= w[1].name) {
            return Err(ContractViolation::InvalidValue {
                field: "export_manifest.files",
                reason: "must be sorted by name and unique",
            });
        }
        for file in &self.files {
            file.validate()?;
        }
        validate_hex("export_manifest.manifest_hash", &self.manifest_hash, 32)
    }
}
