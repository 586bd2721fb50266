#![forbid(unsafe_code)]

//! Offline replay of a sealed transcript. Recomputes the window from the
//! recorded inputs alone and checks that both the stored body and the
//! rebuilt body hash to the recorded seal.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use vgo_engines::seal::{replay_digest, transcript_digest, SealError};
use vgo_kernel_contracts::ids::{SealHash, WindowId};
use vgo_kernel_contracts::transcript::SealedTranscript;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("transcript document is not valid json: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Seal(#[from] SealError),
}

/// Accepts either a bare sealed transcript or the `{sealed, digest}` view
/// served by the adapter.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TranscriptDocument {
    View { sealed: SealedTranscript },
    Sealed(SealedTranscript),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayCheck {
    pub window_id: WindowId,
    pub recorded: SealHash,
    pub body_digest: SealHash,
    pub replay_digest: SealHash,
    pub ok: bool,
}

pub fn parse_document(bytes: &[u8]) -> Result<SealedTranscript, ReplayError> {
    let sealed = match serde_json::from_slice::<TranscriptDocument>(bytes)? {
        TranscriptDocument::View { sealed } => sealed,
        TranscriptDocument::Sealed(sealed) => sealed,
    };
    Ok(sealed)
}

pub fn check_sealed(sealed: &SealedTranscript) -> Result<ReplayCheck, ReplayError> {
    let body_digest = transcript_digest(&sealed.transcript)?;
    let replayed = replay_digest(&sealed.transcript)?;
    let ok = body_digest == sealed.seal_hash
        && replayed == sealed.seal_hash
        && sealed.transcript.window_id == sealed.window_id;
    if ok {
        info!(window_id = %sealed.window_id, seal_hash = %sealed.seal_hash, "replay matches seal");
    } else {
        warn!(
            window_id = %sealed.window_id,
            recorded = %sealed.seal_hash,
            body_digest = %body_digest,
            replay_digest = %replayed,
            "replay diverges from seal"
        );
    }
    Ok(ReplayCheck {
        window_id: sealed.window_id.clone(),
        recorded: sealed.seal_hash.clone(),
        body_digest,
        replay_digest: replayed,
        ok,
    })
}

pub fn check_file(path: &Path) -> Result<ReplayCheck, ReplayError> {
    let bytes = fs::read(path).map_err(|source| ReplayError::Read {
        path: path.display().to_string(),
        source,
    })?;
    check_sealed(&parse_document(&bytes)?)
}
