#![forbid(unsafe_code)]

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::Serialize;
use vgo_engines::accept::sign_attestation;
use vgo_kernel_contracts::ids::{ProofKind, SealHash, SignerId};
use vgo_kernel_contracts::UnixSeconds;

/// Proof in the shape accepted by `POST /windows/{id}/proofs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WireProof {
    pub kind: String,
    pub signer_id: String,
    pub issued_at: u64,
    pub signature_b64: String,
    pub seal_hash: String,
}

pub fn parse_signing_key(secret_hex: &str) -> Result<SigningKey, String> {
    let bytes = hex::decode(secret_hex.trim())
        .map_err(|_| "signing key must be hex encoded".to_string())?;
    let seed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| "signing key must be 32 bytes".to_string())?;
    Ok(SigningKey::from_bytes(&seed))
}

/// Fresh key pair as `(signing_key_hex, verifying_key_hex)`.
pub fn generate_keypair() -> (String, String) {
    let key = SigningKey::generate(&mut OsRng);
    (
        hex::encode(key.to_bytes()),
        hex::encode(key.verifying_key().to_bytes()),
    )
}

pub fn public_key_hex(secret_hex: &str) -> Result<String, String> {
    let key = parse_signing_key(secret_hex)?;
    Ok(hex::encode(key.verifying_key().to_bytes()))
}

pub fn sign_proof(
    secret_hex: &str,
    signer_id: &str,
    seal_hash: &str,
    issued_at: u64,
    kind: Option<&str>,
) -> Result<WireProof, String> {
    let key = parse_signing_key(secret_hex)?;
    let kind = match kind {
        Some(kind) => ProofKind::new(kind).map_err(|e| e.to_string())?,
        None => ProofKind::book_reserves_ok(),
    };
    let signer_id = SignerId::new(signer_id).map_err(|e| e.to_string())?;
    let seal_hash = SealHash::from_hex(seal_hash).map_err(|e| e.to_string())?;
    let attestation = sign_attestation(&key, kind, signer_id, UnixSeconds(issued_at), seal_hash)
        .map_err(|e| e.to_string())?;
    let signature = hex::decode(&attestation.signature_hex).map_err(|e| e.to_string())?;
    Ok(WireProof {
        kind: attestation.kind.to_string(),
        signer_id: attestation.signer_id.to_string(),
        issued_at: attestation.issued_at.0,
        signature_b64: BASE64.encode(signature),
        seal_hash: attestation.seal_hash.to_string(),
    })
}

/// `pubkey` prints the verifying key; `sign-proof <signer_id> <seal_hash> <issued_at> [kind]`
/// prints one proof as JSON. The secret never appears in the output.
pub fn execute_attest_command(
    subcommand: &str,
    args: &[String],
    secret_hex: &str,
) -> Result<String, String> {
    match subcommand {
        "pubkey" => public_key_hex(secret_hex),
        "sign-proof" => {
            let [signer_id, seal_hash, issued_at, rest @ ..] = args else {
                return Err(
                    "usage: vgo sign-proof <signer_id> <seal_hash> <issued_at> [kind]".to_string(),
                );
            };
            let issued_at = issued_at
                .parse::<u64>()
                .map_err(|_| format!("issued_at must be unix seconds, got '{issued_at}'"))?;
            let proof = sign_proof(
                secret_hex,
                signer_id,
                seal_hash,
                issued_at,
                rest.first().map(String::as_str),
            )?;
            serde_json::to_string(&proof).map_err(|e| e.to_string())
        }
        _ => Err(format!(
            "unknown signing command: {subcommand}. expected one of: pubkey, sign-proof"
        )),
    }
}
