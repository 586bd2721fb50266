#![forbid(unsafe_code)]

use vgo_kernel_contracts::fold::FoldDescriptor;
use vgo_kernel_contracts::ids::{PartitionId, TenantId};
use vgo_kernel_contracts::policy::{AcceptancePreset, PolicyManifest, PolicyVersion};
use vgo_kernel_contracts::window::{WindowKey, WindowRecord, WindowStatus};
use vgo_kernel_contracts::LogicalTime;
use vgo_storage::repo::WindowsTablesRepo;
use vgo_storage::store::{SettleStore, StorageError, WindowSlot};

fn tenant(id: &str) -> TenantId {
    TenantId::new(id).unwrap()
}

fn partition(id: &str) -> PartitionId {
    PartitionId::new(id).unwrap()
}

fn window(tenant_id: &str, seq: u64, version: u32) -> WindowRecord {
    WindowRecord::open_v1(
        WindowKey::v1(tenant(tenant_id), partition("p0003"), seq, version).unwrap(),
        LogicalTime(100 * seq),
        PolicyManifest::from_preset(PolicyVersion(1), AcceptancePreset::Normal).unwrap(),
        FoldDescriptor::canonical_v1(10).unwrap(),
    )
    .unwrap()
}

#[test]
fn at_windows_db_01_insert_then_duplicate_rejected() {
    let mut s = SettleStore::new_in_memory();
    let w = window("tenant_a", 1, 1);
    assert_eq!(s.insert_window_row(w.clone()).unwrap(), 1);
    assert_eq!(s.window_row_by_id(&w.window_id).unwrap().record, w);

    assert!(matches!(
        s.insert_window_row(w),
        Err(StorageError::DuplicateKey {
            table: "windows",
            ..
        })
    ));
}

#[test]
fn at_windows_db_02_update_is_compare_and_swap() {
    let mut s = SettleStore::new_in_memory();
    let w = window("tenant_a", 1, 1);
    s.insert_window_row(w.clone()).unwrap();

    let mut advanced = w.clone();
    advanced.watermark = LogicalTime(150);
    assert_eq!(s.update_window_row(advanced.clone(), 1).unwrap(), 2);

    let mut racing = w;
    racing.status = WindowStatus::Closed;
    assert!(matches!(
        s.update_window_row(racing, 1),
        Err(StorageError::StaleRevision {
            expected: 1,
            found: 2,
            ..
        })
    ));
    assert_eq!(s.window_row_by_id(&advanced.window_id).unwrap().record, advanced);
}

#[test]
fn at_windows_db_03_illegal_transition_rejected() {
    let mut s = SettleStore::new_in_memory();
    let w = window("tenant_a", 1, 1);
    s.insert_window_row(w.clone()).unwrap();

    let mut invalid = w.clone();
    invalid.status = WindowStatus::Invalid;
    invalid.invalid_reason = Some("ACCUMULATOR_OVERFLOW".to_string());
    s.update_window_row(invalid.clone(), 1).unwrap();

    let mut reopened = invalid;
    reopened.status = WindowStatus::Open;
    assert!(matches!(
        s.update_window_row(reopened, 2),
        Err(StorageError::IllegalTransition {
            from: "INVALID",
            to: "OPEN",
            ..
        })
    ));
}

#[test]
fn at_windows_db_04_watermark_never_regresses() {
    let mut s = SettleStore::new_in_memory();
    let w = window("tenant_a", 2, 1);
    s.insert_window_row(w.clone()).unwrap();

    let mut ahead = w.clone();
    ahead.watermark = LogicalTime(260);
    s.update_window_row(ahead.clone(), 1).unwrap();

    let mut behind = ahead;
    behind.watermark = LogicalTime(230);
    assert!(matches!(
        s.update_window_row(behind, 2),
        Err(StorageError::IntegrityViolation { .. })
    ));
}

#[test]
fn at_windows_db_05_open_window_lookup_is_tenant_scoped() {
    let mut s = SettleStore::new_in_memory();
    let a1 = window("tenant_a", 1, 1);
    let b1 = window("tenant_b", 1, 1);
    s.insert_window_row(a1.clone()).unwrap();
    s.insert_window_row(b1.clone()).unwrap();

    let mut closed = a1.clone();
    closed.status = WindowStatus::Closed;
    s.update_window_row(closed, 1).unwrap();

    assert!(s
        .open_window_row_for(&tenant("tenant_a"), &partition("p0003"))
        .is_none());
    assert_eq!(
        s.open_window_row_for(&tenant("tenant_b"), &partition("p0003"))
            .unwrap()
            .window_id,
        b1.window_id
    );

    let a2 = window("tenant_a", 2, 1);
    s.insert_window_row(a2.clone()).unwrap();
    assert_eq!(
        s.open_window_row_for(&tenant("tenant_a"), &partition("p0003"))
            .unwrap()
            .window_id,
        a2.window_id
    );
}

#[test]
fn at_windows_db_06_versions_share_one_slot() {
    let mut s = SettleStore::new_in_memory();
    let v1 = window("tenant_a", 1, 1);
    let mut v2 = window("tenant_a", 1, 2);
    v2.status = WindowStatus::Closed;
    s.insert_window_row(v1.clone()).unwrap();
    s.insert_window_row(v2.clone()).unwrap();

    let slot = WindowSlot::of(&v1.key);
    let versions = s
        .window_versions_for_slot(&slot)
        .into_iter()
        .map(|w| w.key.version)
        .collect::<Vec<_>>();
    assert_eq!(versions, vec![1, 2]);
    assert_eq!(s.latest_window_for_slot(&slot).unwrap().window_id, v2.window_id);
}
