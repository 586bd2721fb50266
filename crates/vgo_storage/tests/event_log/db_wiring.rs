#![forbid(unsafe_code)]

use vgo_kernel_contracts::event::{EventKind, EventRecord, IngestRecord};
use vgo_kernel_contracts::fold::FoldDescriptor;
use vgo_kernel_contracts::ids::{EventId, IdempotencyKey, PartitionId, PrincipalId, TenantId};
use vgo_kernel_contracts::policy::{AcceptancePreset, PolicyManifest, PolicyVersion};
use vgo_kernel_contracts::window::{WindowKey, WindowRecord};
use vgo_kernel_contracts::LogicalTime;
use vgo_storage::repo::{EventLogTablesRepo, WindowsTablesRepo};
use vgo_storage::store::{SettleStore, StorageError, WindowSlot};

fn tenant() -> TenantId {
    TenantId::new("tenant_a").unwrap()
}

fn partition() -> PartitionId {
    PartitionId::new("p0001").unwrap()
}

fn seeded_store() -> (SettleStore, WindowRecord) {
    let mut s = SettleStore::new_in_memory();
    let w = WindowRecord::open_v1(
        WindowKey::v1(tenant(), partition(), 1, 1).unwrap(),
        LogicalTime(0),
        PolicyManifest::from_preset(PolicyVersion(1), AcceptancePreset::Normal).unwrap(),
        FoldDescriptor::canonical_v1(10).unwrap(),
    )
    .unwrap();
    s.insert_window_row(w.clone()).unwrap();
    (s, w)
}

fn event(id: &str, amount: i64) -> EventRecord {
    EventRecord::v1(
        EventId::new(id).unwrap(),
        tenant(),
        PrincipalId::new("alice").unwrap(),
        EventKind::BaseEarning,
        amount,
        LogicalTime(5),
        partition(),
        0,
    )
    .unwrap()
}

fn ingest(w: &WindowRecord, key: &str, event_id: &str) -> IngestRecord {
    IngestRecord {
        tenant_id: tenant(),
        idempotency_key: IdempotencyKey::new(key).unwrap(),
        payload_digest: "ab".repeat(32),
        event_id: EventId::new(event_id).unwrap(),
        window_id: w.window_id.clone(),
    }
}

#[test]
fn at_event_log_db_01_append_and_read_back_sorted() {
    let (mut s, w) = seeded_store();
    s.append_event_row(ingest(&w, "idem_2", "ev_2"), event("ev_2", 20))
        .unwrap();
    s.append_event_row(ingest(&w, "idem_1", "ev_1"), event("ev_1", 10))
        .unwrap();

    let slot = WindowSlot::of(&w.key);
    let ids = s
        .slot_event_rows(&slot)
        .into_iter()
        .map(|e| e.event_id.as_str().to_string())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec!["ev_1", "ev_2"]);
    assert_eq!(
        s.event_slot_row(&EventId::new("ev_1").unwrap()),
        Some(&slot)
    );
}

#[test]
fn at_event_log_db_02_idempotency_key_is_single_use() {
    let (mut s, w) = seeded_store();
    s.append_event_row(ingest(&w, "idem_1", "ev_1"), event("ev_1", 10))
        .unwrap();
    assert!(matches!(
        s.append_event_row(ingest(&w, "idem_1", "ev_9"), event("ev_9", 10)),
        Err(StorageError::DuplicateKey {
            table: "ingest_index",
            ..
        })
    ));
    let first = s
        .ingest_row(&tenant(), &IdempotencyKey::new("idem_1").unwrap())
        .unwrap();
    assert_eq!(first.event_id.as_str(), "ev_1");
    assert!(s.event_slot_row(&EventId::new("ev_9").unwrap()).is_none());
}

#[test]
fn at_event_log_db_03_event_id_unique_across_keys() {
    let (mut s, w) = seeded_store();
    s.append_event_row(ingest(&w, "idem_1", "ev_1"), event("ev_1", 10))
        .unwrap();
    assert!(matches!(
        s.append_event_row(ingest(&w, "idem_2", "ev_1"), event("ev_1", 99)),
        Err(StorageError::DuplicateKey {
            table: "event_log",
            ..
        })
    ));
    assert!(s
        .ingest_row(&tenant(), &IdempotencyKey::new("idem_2").unwrap())
        .is_none());
}

#[test]
fn at_event_log_db_04_unknown_window_is_foreign_key_violation() {
    let mut s = SettleStore::new_in_memory();
    let (_, w) = seeded_store();
    assert!(matches!(
        s.append_event_row(ingest(&w, "idem_1", "ev_1"), event("ev_1", 10)),
        Err(StorageError::ForeignKeyViolation { .. })
    ));
}

#[test]
fn at_event_log_db_05_events_are_append_only() {
    let (mut s, w) = seeded_store();
    s.append_event_row(ingest(&w, "idem_1", "ev_1"), event("ev_1", 10))
        .unwrap();
    assert_eq!(
        s.attempt_overwrite_event(&EventId::new("ev_1").unwrap()),
        Err(StorageError::AppendOnlyViolation { table: "event_log" })
    );
}
