#![forbid(unsafe_code)]

use vgo_engines::seal::seal_window;
use vgo_kernel_contracts::event::{EventKind, EventRecord};
use vgo_kernel_contracts::fold::FoldDescriptor;
use vgo_kernel_contracts::ids::{EventId, PartitionId, PrincipalId, TenantId};
use vgo_kernel_contracts::policy::{AcceptancePreset, PolicyManifest, PolicyVersion};
use vgo_kernel_contracts::transcript::{SealedTranscript, TranscriptInputs};
use vgo_kernel_contracts::window::{WindowKey, WindowRecord};
use vgo_kernel_contracts::LogicalTime;
use vgo_storage::repo::{TranscriptsTablesRepo, WindowsTablesRepo};
use vgo_storage::store::{SettleStore, StorageError};

fn key() -> WindowKey {
    WindowKey::v1(
        TenantId::new("tenant_a").unwrap(),
        PartitionId::new("p0002").unwrap(),
        4,
        1,
    )
    .unwrap()
}

fn policy() -> PolicyManifest {
    PolicyManifest::from_preset(PolicyVersion(1), AcceptancePreset::Normal).unwrap()
}

fn sealed(amount: i64) -> SealedTranscript {
    let k = key();
    let ev = EventRecord::v1(
        EventId::new("ev_1").unwrap(),
        k.tenant_id.clone(),
        PrincipalId::new("alice").unwrap(),
        EventKind::BaseEarning,
        amount,
        LogicalTime(15),
        k.partition_id.clone(),
        1,
    )
    .unwrap();
    seal_window(TranscriptInputs {
        key: k,
        opens_at: LogicalTime(0),
        watermark: LogicalTime(100),
        policy: policy(),
        fold: FoldDescriptor::canonical_v1(10).unwrap(),
        carry_in: Vec::new(),
        pool_carry_in_minor: 0,
        carry_source: None,
        events: vec![ev],
    })
    .unwrap()
}

fn seeded_store() -> SettleStore {
    let mut s = SettleStore::new_in_memory();
    s.insert_window_row(
        WindowRecord::open_v1(
            key(),
            LogicalTime(0),
            policy(),
            FoldDescriptor::canonical_v1(10).unwrap(),
        )
        .unwrap(),
    )
    .unwrap();
    s
}

#[test]
fn at_transcripts_db_01_content_addressed_lookup() {
    let mut s = seeded_store();
    let t = sealed(500);
    assert!(s.put_transcript_row(t.clone()).unwrap());
    assert_eq!(s.transcript_row(&t.seal_hash), Some(&t));
}

#[test]
fn at_transcripts_db_02_identical_rewrite_is_noop() {
    let mut s = seeded_store();
    let t = sealed(500);
    assert!(s.put_transcript_row(t.clone()).unwrap());
    assert!(!s.put_transcript_row(t).unwrap());
}

#[test]
fn at_transcripts_db_03_different_body_under_same_hash_rejected() {
    let mut s = seeded_store();
    let t = sealed(500);
    s.put_transcript_row(t.clone()).unwrap();

    let mut forged = sealed(700);
    forged.seal_hash = t.seal_hash.clone();
    assert!(matches!(
        s.put_transcript_row(forged),
        Err(StorageError::WriteOnceViolation {
            table: "transcripts",
            ..
        })
    ));
    assert_eq!(s.transcript_row(&t.seal_hash), Some(&t));
    assert!(s.attempt_overwrite_transcript(&t.seal_hash).is_err());
}

#[test]
fn at_transcripts_db_04_unknown_window_rejected() {
    let mut s = SettleStore::new_in_memory();
    assert!(matches!(
        s.put_transcript_row(sealed(500)),
        Err(StorageError::ForeignKeyViolation { .. })
    ));
}
