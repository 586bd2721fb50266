#![forbid(unsafe_code)]

use vgo_kernel_contracts::audit::{AuditDiff, AuditReport};
use vgo_kernel_contracts::ids::{PartitionId, SealHash, TenantId, WindowId};
use vgo_kernel_contracts::MonotonicTimeNs;
use vgo_storage::repo::OpsJournalTablesRepo;
use vgo_storage::store::{OpsAction, SettleStore, StorageError};

fn window_id(seq: u64) -> WindowId {
    WindowId::derive(
        &TenantId::new("tenant_a").unwrap(),
        &PartitionId::new("p0000").unwrap(),
        seq,
        1,
    )
}

#[test]
fn at_ops_journal_db_01_rows_are_sequenced_in_order() {
    let mut s = SettleStore::new_in_memory();
    let a = s.append_ops_row(
        MonotonicTimeNs(10),
        window_id(1),
        OpsAction::WindowOpened,
        "opens_at=0".to_string(),
    );
    let b = s.append_ops_row(
        MonotonicTimeNs(20),
        window_id(1),
        OpsAction::WindowClosed,
        "watermark=100".to_string(),
    );
    assert_eq!((a, b), (1, 2));
    let actions = s
        .ops_rows()
        .iter()
        .map(|r| r.action.as_str())
        .collect::<Vec<_>>();
    assert_eq!(actions, vec!["WINDOW_OPENED", "WINDOW_CLOSED"]);
}

#[test]
fn at_ops_journal_db_02_append_only_enforced() {
    let mut s = SettleStore::new_in_memory();
    let seq = s.append_ops_row(
        MonotonicTimeNs(10),
        window_id(1),
        OpsAction::WindowSealed,
        String::new(),
    );
    assert_eq!(
        s.attempt_overwrite_ops_row(seq),
        Err(StorageError::AppendOnlyViolation {
            table: "ops_journal"
        })
    );
    assert_eq!(s.ops_rows().len(), 1);
}

#[test]
fn at_ops_journal_db_03_alerts_and_audit_reports_accumulate() {
    let mut s = SettleStore::new_in_memory();
    s.raise_alert_row(
        MonotonicTimeNs(5),
        window_id(2),
        "ACCUMULATOR_OVERFLOW".to_string(),
        "stage=principal_net".to_string(),
    );
    assert_eq!(s.alert_rows_all().len(), 1);
    assert_eq!(s.alert_rows_all()[0].code, "ACCUMULATOR_OVERFLOW");

    let seal = SealHash::from_hex("ab".repeat(32)).unwrap();
    s.append_audit_report_row(AuditReport::from_diffs(
        window_id(2),
        seal.clone(),
        vec![AuditDiff::ArtifactMissing {
            name: "ledger_entries.csv".to_string(),
        }],
        Some(seal),
    ));
    assert_eq!(s.audit_report_rows_all().len(), 1);
    assert!(!s.audit_report_rows_all()[0].ok);
}
