#![forbid(unsafe_code)]

use vgo_engines::accept::AcceptanceOutcome;
use vgo_engines::export::{ExportConfig, ExportRuntime};
use vgo_engines::seal::seal_window;
use vgo_kernel_contracts::acceptance::{AcceptanceReason, AcceptanceRecord, Attestation};
use vgo_kernel_contracts::allocation::Decision;
use vgo_kernel_contracts::event::{EventKind, EventRecord};
use vgo_kernel_contracts::fold::FoldDescriptor;
use vgo_kernel_contracts::ids::{EventId, PartitionId, PrincipalId, ProofKind, SignerId, TenantId};
use vgo_kernel_contracts::policy::{AcceptancePreset, PolicyManifest, PolicyVersion};
use vgo_kernel_contracts::transcript::{SealedTranscript, TranscriptInputs};
use vgo_kernel_contracts::window::{WindowKey, WindowRecord};
use vgo_kernel_contracts::{LogicalTime, UnixSeconds};
use vgo_storage::repo::{AcceptanceExportTablesRepo, TranscriptsTablesRepo, WindowsTablesRepo};
use vgo_storage::store::{SettleStore, StorageError};

fn key() -> WindowKey {
    WindowKey::v1(
        TenantId::new("tenant_a").unwrap(),
        PartitionId::new("p0002").unwrap(),
        1,
        1,
    )
    .unwrap()
}

fn policy() -> PolicyManifest {
    PolicyManifest::from_preset(PolicyVersion(1), AcceptancePreset::Normal).unwrap()
}

fn seeded_store() -> (SettleStore, SealedTranscript) {
    let k = key();
    let ev = EventRecord::v1(
        EventId::new("ev_1").unwrap(),
        k.tenant_id.clone(),
        PrincipalId::new("alice").unwrap(),
        EventKind::BaseEarning,
        1_250,
        LogicalTime(15),
        k.partition_id.clone(),
        1,
    )
    .unwrap();
    let sealed = seal_window(TranscriptInputs {
        key: k.clone(),
        opens_at: LogicalTime(0),
        watermark: LogicalTime(100),
        policy: policy(),
        fold: FoldDescriptor::canonical_v1(10).unwrap(),
        carry_in: Vec::new(),
        pool_carry_in_minor: 0,
        carry_source: None,
        events: vec![ev],
    })
    .unwrap();

    let mut s = SettleStore::new_in_memory();
    s.insert_window_row(
        WindowRecord::open_v1(k, LogicalTime(0), policy(), FoldDescriptor::canonical_v1(10).unwrap())
            .unwrap(),
    )
    .unwrap();
    s.put_transcript_row(sealed.clone()).unwrap();
    (s, sealed)
}

fn proof(sealed: &SealedTranscript, signer: &str) -> Attestation {
    Attestation::v1(
        ProofKind::book_reserves_ok(),
        SignerId::new(signer).unwrap(),
        UnixSeconds(1_700_000_000),
        "00".repeat(64),
        sealed.seal_hash.clone(),
    )
    .unwrap()
}

fn acceptance(sealed: &SealedTranscript, decision: Decision) -> AcceptanceRecord {
    let reason = match decision {
        Decision::Allow => None,
        Decision::Hold => Some(AcceptanceReason::InsufficientQuorum),
    };
    let outcome = AcceptanceOutcome {
        decision,
        reason_code: reason,
        verdicts: Vec::new(),
        valid_proof_count: 2,
        bundle_digest: "11".repeat(32),
        quorum: 2,
        freshness_s: 3_600,
    };
    AcceptanceRecord::v1(
        outcome.acceptance_id(&sealed.seal_hash).unwrap(),
        sealed.window_id.clone(),
        sealed.seal_hash.clone(),
        decision,
        reason,
        outcome.quorum,
        outcome.freshness_s,
        outcome.valid_proof_count,
        outcome.bundle_digest.clone(),
        UnixSeconds(1_700_000_100),
    )
    .unwrap()
}

#[test]
fn at_acceptance_export_db_01_proofs_bind_to_existing_seal_and_dedupe() {
    let (mut s, sealed) = seeded_store();
    let bundle = s
        .append_proof_rows(&sealed.seal_hash, 2, 3_600, vec![proof(&sealed, "ops")])
        .unwrap();
    assert_eq!(bundle.proofs.len(), 1);

    let bundle = s
        .append_proof_rows(
            &sealed.seal_hash,
            2,
            3_600,
            vec![proof(&sealed, "ops"), proof(&sealed, "risk")],
        )
        .unwrap();
    assert_eq!(bundle.proofs.len(), 2);
    assert!(!bundle.verified);

    let (mut other, _) = seeded_store();
    let foreign = vgo_kernel_contracts::ids::SealHash::from_hex("ee".repeat(32)).unwrap();
    assert!(matches!(
        other.append_proof_rows(&foreign, 2, 3_600, Vec::new()),
        Err(StorageError::ForeignKeyViolation { .. })
    ));
}

#[test]
fn at_acceptance_export_db_02_acceptance_current_and_ledger() {
    let (mut s, sealed) = seeded_store();
    s.put_acceptance_row(acceptance(&sealed, Decision::Hold)).unwrap();
    s.put_acceptance_row(acceptance(&sealed, Decision::Allow)).unwrap();

    assert_eq!(
        s.acceptance_row(&sealed.seal_hash).unwrap().decision,
        Decision::Allow
    );
    let decisions = s
        .acceptance_ledger()
        .iter()
        .map(|r| r.decision)
        .collect::<Vec<_>>();
    assert_eq!(decisions, vec![Decision::Hold, Decision::Allow]);
}

#[test]
fn at_acceptance_export_db_03_export_requires_matching_acceptance() {
    let (mut s, sealed) = seeded_store();
    let acc = acceptance(&sealed, Decision::Allow);
    let bundle = ExportRuntime::new(ExportConfig::mvp_v1())
        .materialize(&sealed, &acc)
        .unwrap();
    let files = bundle
        .files
        .iter()
        .map(|f| (f.name.clone(), f.bytes.clone()))
        .collect::<Vec<_>>();

    assert!(matches!(
        s.put_export_rows(bundle.manifest.clone(), files.clone()),
        Err(StorageError::ForeignKeyViolation { .. })
    ));

    s.put_acceptance_row(acc).unwrap();
    assert!(s.put_export_rows(bundle.manifest.clone(), files.clone()).unwrap());
    assert!(!s.put_export_rows(bundle.manifest.clone(), files).unwrap());
    assert_eq!(s.manifest_row(&sealed.seal_hash), Some(&bundle.manifest));
    assert_eq!(s.artifact_rows(&sealed.seal_hash).len(), bundle.files.len());
}

#[test]
fn at_acceptance_export_db_04_artifact_bytes_must_match_manifest() {
    let (mut s, sealed) = seeded_store();
    let acc = acceptance(&sealed, Decision::Allow);
    let bundle = ExportRuntime::new(ExportConfig::mvp_v1())
        .materialize(&sealed, &acc)
        .unwrap();
    s.put_acceptance_row(acc).unwrap();

    let mut files = bundle
        .files
        .iter()
        .map(|f| (f.name.clone(), f.bytes.clone()))
        .collect::<Vec<_>>();
    files[0].1.push(b'\n');
    assert!(matches!(
        s.put_export_rows(bundle.manifest, files),
        Err(StorageError::IntegrityViolation {
            table: "artifacts",
            ..
        })
    ));
    assert!(s.manifest_row(&sealed.seal_hash).is_none());
    assert!(s.artifact_rows(&sealed.seal_hash).is_empty());
}
