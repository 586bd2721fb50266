#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::ids::{SealHash, WindowId};

/// One independent check that failed. Any diff fails the audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditDiff {
    AcceptanceSealMismatch {
        acceptance_seal_hash: String,
        seal_hash: String,
    },
    ManifestBindingMismatch {
        field: String,
        manifest: String,
        expected: String,
    },
    TotalsMismatch {
        field: String,
        recorded: i64,
        recomputed: i64,
    },
    ArtifactMissing {
        name: String,
    },
    ArtifactHashMismatch {
        name: String,
        expected_sha256: String,
        actual_sha256: String,
        expected_bytes: u64,
        actual_bytes: u64,
    },
    UnexpectedArtifact {
        name: String,
    },
    ManifestHashMismatch {
        expected: String,
        actual: String,
    },
    TranscriptDigestMismatch {
        seal_hash: String,
        stored_digest: String,
    },
    ReplayDigestMismatch {
        seal_hash: String,
        replay_digest: String,
    },
    ReplayFailed {
        detail: String,
    },
}

impl AuditDiff {
    pub fn code(&self) -> &'static str {
        match self {
            AuditDiff::AcceptanceSealMismatch { .. } => "ACCEPTANCE_SEAL_MISMATCH",
            AuditDiff::ManifestBindingMismatch { .. } => "MANIFEST_BINDING_MISMATCH",
            AuditDiff::TotalsMismatch { .. } => "TOTALS_MISMATCH",
            AuditDiff::ArtifactMissing { .. } => "ARTIFACT_MISSING",
            AuditDiff::ArtifactHashMismatch { .. } => "ARTIFACT_HASH_MISMATCH",
            AuditDiff::UnexpectedArtifact { .. } => "UNEXPECTED_ARTIFACT",
            AuditDiff::ManifestHashMismatch { .. } => "MANIFEST_HASH_MISMATCH",
            AuditDiff::TranscriptDigestMismatch { .. } => "TRANSCRIPT_DIGEST_MISMATCH",
            AuditDiff::ReplayDigestMismatch { .. } => "REPLAY_DIGEST_MISMATCH",
            AuditDiff::ReplayFailed { .. } => "REPLAY_FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub window_id: WindowId,
    pub seal_hash: SealHash,
    pub ok: bool,
    pub diffs: Vec<AuditDiff>,
    pub replay_digest: Option<SealHash>,
}

impl AuditReport {
    pub fn from_diffs(
        window_id: WindowId,
        seal_hash: SealHash,
        diffs: Vec<AuditDiff>,
        replay_digest: Option<SealHash>,
    ) -> Self {
        Self {
            window_id,
            seal_hash,
            ok: diffs.is_empty(),
            diffs,
            replay_digest,
        }
    }
}
