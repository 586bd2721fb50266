#![forbid(unsafe_code)]

use thiserror::Error;
use vgo_kernel_contracts::ids::SealHash;
use vgo_kernel_contracts::transcript::{SealedTranscript, Transcript, TranscriptInputs};
use vgo_kernel_contracts::ContractViolation;

use crate::compute::{compute_window, InvariantViolation};
use crate::digest::sha256_hex;

/// Prefix of every byte string that is hashed into a seal.
pub const TRANSCRIPT_DOMAIN_TAG: &[u8] = b"vgo.transcript.v1\n";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SealError {
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
    #[error("transcript rejected: {0}")]
    Contract(ContractViolation),
    #[error("transcript encoding failed: {0}")]
    Encoding(String),
}

/// Domain tag followed by the transcript's JSON encoding.
///
/// Field order is fixed by the struct definitions, sets are `BTreeSet`, and
/// every vector is sorted on construction, so equal transcripts always
/// encode to equal bytes.
pub fn canonical_transcript_bytes(transcript: &Transcript) -> Result<Vec<u8>, SealError> {
    let body = serde_json::to_vec(transcript).map_err(|e| SealError::Encoding(e.to_string()))?;
    let mut out = Vec::with_capacity(TRANSCRIPT_DOMAIN_TAG.len() + body.len());
    out.extend_from_slice(TRANSCRIPT_DOMAIN_TAG);
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn transcript_digest(transcript: &Transcript) -> Result<SealHash, SealError> {
    let bytes = canonical_transcript_bytes(transcript)?;
    SealHash::from_hex(sha256_hex(&bytes)).map_err(SealError::Contract)
}

/// Computes the window and binds the result to its seal hash.
pub fn seal_window(inputs: TranscriptInputs) -> Result<SealedTranscript, SealError> {
    let outputs = compute_window(&inputs)?;
    let transcript = Transcript::v1(inputs, outputs).map_err(SealError::Contract)?;
    let seal_hash = transcript_digest(&transcript)?;
    Ok(SealedTranscript {
        seal_hash,
        window_id: transcript.window_id.clone(),
        policy_version: transcript.policy_version,
        transcript,
    })
}

/// Recomputes a transcript from its recorded inputs alone and returns the
/// digest of the rebuilt transcript. Equal to the seal hash on a faithful
/// replay.
pub fn replay_digest(transcript: &Transcript) -> Result<SealHash, SealError> {
    let rebuilt = seal_window(transcript.inputs.clone())?;
    Ok(rebuilt.seal_hash)
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    use super::*;
    use crate::test_support::{inputs_with, policy_normal, record};

    fn two_principal_events() -> Vec<vgo_kernel_contracts::event::EventRecord> {
        vec![record("ev_a1", "alice", 700, 12), record("ev_b1", "bob", 2_000, 31)]
    }

    #[test]
    fn at_seal_01_same_inputs_same_hash_under_any_arrival_order() {
        let events = two_principal_events();
        let first = seal_window(inputs_with(policy_normal(), events.clone())).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..16 {
            let mut shuffled = events.clone();
            shuffled.shuffle(&mut rng);
            let again = seal_window(inputs_with(policy_normal(), shuffled)).unwrap();
            assert_eq!(again.seal_hash, first.seal_hash);
        }
        assert_eq!(first.seal_hash.as_str().len(), 64);
    }

    #[test]
    fn at_seal_02_any_input_change_moves_the_hash() {
        let base = seal_window(inputs_with(policy_normal(), two_principal_events())).unwrap();

        let mut policy = policy_normal();
        policy.min_payout_minor = 1;
        let other_policy = seal_window(inputs_with(policy, two_principal_events())).unwrap();
        assert_ne!(base.seal_hash, other_policy.seal_hash);

        let mut events = two_principal_events();
        events.push(record("ev_c1", "carol", 1, 40));
        let more_events = seal_window(inputs_with(policy_normal(), events)).unwrap();
        assert_ne!(base.seal_hash, more_events.seal_hash);
    }

    #[test]
    fn at_seal_03_replay_reproduces_seal() {
        let sealed = seal_window(inputs_with(policy_normal(), two_principal_events())).unwrap();
        assert_eq!(replay_digest(&sealed.transcript).unwrap(), sealed.seal_hash);
        assert_eq!(transcript_digest(&sealed.transcript).unwrap(), sealed.seal_hash);

        let mut tampered = sealed.transcript.clone();
        tampered.outputs.allocations[0].final_minor += 1;
        tampered.outputs.allocations[0].carry_out_minor -= 1;
        assert_ne!(transcript_digest(&tampered).unwrap(), sealed.seal_hash);
        assert_eq!(replay_digest(&tampered).unwrap(), sealed.seal_hash);
    }

    #[test]
    fn at_seal_04_canonical_bytes_start_with_domain_tag() {
        let sealed = seal_window(inputs_with(policy_normal(), two_principal_events())).unwrap();
        let bytes = canonical_transcript_bytes(&sealed.transcript).unwrap();
        assert!(bytes.starts_with(TRANSCRIPT_DOMAIN_TAG));
    }
}
