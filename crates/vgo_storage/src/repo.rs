#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use vgo_kernel_contracts::acceptance::{
    AcceptanceBundle, AcceptanceReason, AcceptanceRecord, Attestation, ProofVerdict,
};
use vgo_kernel_contracts::audit::AuditReport;
use vgo_kernel_contracts::event::{EventRecord, IngestRecord};
use vgo_kernel_contracts::export::ExportManifest;
use vgo_kernel_contracts::ids::{EventId, IdempotencyKey, PartitionId, SealHash, TenantId, WindowId};
use vgo_kernel_contracts::transcript::SealedTranscript;
use vgo_kernel_contracts::window::WindowRecord;
use vgo_kernel_contracts::MonotonicTimeNs;

use crate::store::{
    OperatorAlert, OpsAction, OpsJournalRow, SettleStore, StorageError, WindowRow, WindowSlot,
};

/// Typed repository interface for window metadata (`windows` + slot index).
pub trait WindowsTablesRepo {
    fn insert_window_row(&mut self, record: WindowRecord) -> Result<u64, StorageError>;
    fn update_window_row(
        &mut self,
        record: WindowRecord,
        expected_revision: u64,
    ) -> Result<u64, StorageError>;
    fn window_row_by_id(&self, window_id: &WindowId) -> Option<&WindowRow>;
    fn window_versions_for_slot(&self, slot: &WindowSlot) -> Vec<&WindowRecord>;
    fn latest_window_for_slot(&self, slot: &WindowSlot) -> Option<&WindowRecord>;
    fn open_window_row_for(
        &self,
        tenant_id: &TenantId,
        partition_id: &PartitionId,
    ) -> Option<&WindowRecord>;
}

/// Typed repository interface for the append-only event buffers and the
/// ingest idempotency index.
pub trait EventLogTablesRepo {
    fn append_event_row(
        &mut self,
        ingest: IngestRecord,
        record: EventRecord,
    ) -> Result<(), StorageError>;
    fn ingest_row(
        &self,
        tenant_id: &TenantId,
        idempotency_key: &IdempotencyKey,
    ) -> Option<&IngestRecord>;
    fn event_slot_row(&self, event_id: &EventId) -> Option<&WindowSlot>;
    fn slot_event_rows(&self, slot: &WindowSlot) -> Vec<EventRecord>;
}

/// Typed repository interface for the write-once transcript store.
pub trait TranscriptsTablesRepo {
    fn put_transcript_row(&mut self, sealed: SealedTranscript) -> Result<bool, StorageError>;
    fn transcript_row(&self, seal_hash: &SealHash) -> Option<&SealedTranscript>;
}

/// Typed repository interface for proofs, acceptance and export artifacts.
pub trait AcceptanceExportTablesRepo {
    fn append_proof_rows(
        &mut self,
        seal_hash: &SealHash,
        quorum: u8,
        freshness_s: u64,
        proofs: Vec<Attestation>,
    ) -> Result<AcceptanceBundle, StorageError>;
    fn record_bundle_evaluation_row(
        &mut self,
        seal_hash: &SealHash,
        verdicts: Vec<ProofVerdict>,
        verified: bool,
        reason_code: Option<AcceptanceReason>,
    ) -> Result<(), StorageError>;
    fn proof_bundle_row(&self, seal_hash: &SealHash) -> Option<&AcceptanceBundle>;
    fn put_acceptance_row(&mut self, record: AcceptanceRecord) -> Result<(), StorageError>;
    fn acceptance_row(&self, seal_hash: &SealHash) -> Option<&AcceptanceRecord>;
    fn acceptance_ledger(&self) -> &[AcceptanceRecord];
    fn put_export_rows(
        &mut self,
        manifest: ExportManifest,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<bool, StorageError>;
    fn manifest_row(&self, seal_hash: &SealHash) -> Option<&ExportManifest>;
    fn artifact_rows(&self, seal_hash: &SealHash) -> BTreeMap<String, Vec<u8>>;
}

/// Typed repository interface for the ops journal, alerts and audit reports.
pub trait OpsJournalTablesRepo {
    fn append_ops_row(
        &mut self,
        at: MonotonicTimeNs,
        window_id: WindowId,
        action: OpsAction,
        detail: String,
    ) -> u64;
    fn ops_rows(&self) -> &[OpsJournalRow];
    fn raise_alert_row(
        &mut self,
        at: MonotonicTimeNs,
        window_id: WindowId,
        code: String,
        detail: String,
    ) -> u64;
    fn alert_rows_all(&self) -> &[OperatorAlert];
    fn append_audit_report_row(&mut self, report: AuditReport);
    fn audit_report_rows_all(&self) -> &[AuditReport];
}

impl WindowsTablesRepo for SettleStore {
    fn insert_window_row(&mut self, record: WindowRecord) -> Result<u64, StorageError> {
        self.insert_window(record)
    }

    fn update_window_row(
        &mut self,
        record: WindowRecord,
        expected_revision: u64,
    ) -> Result<u64, StorageError> {
        self.update_window(record, expected_revision)
    }

    fn window_row_by_id(&self, window_id: &WindowId) -> Option<&WindowRow> {
        self.window_row(window_id)
    }

    fn window_versions_for_slot(&self, slot: &WindowSlot) -> Vec<&WindowRecord> {
        self.slot_versions(slot)
    }

    fn latest_window_for_slot(&self, slot: &WindowSlot) -> Option<&WindowRecord> {
        self.latest_version(slot)
    }

    fn open_window_row_for(
        &self,
        tenant_id: &TenantId,
        partition_id: &PartitionId,
    ) -> Option<&WindowRecord> {
        self.open_window_for(tenant_id, partition_id)
    }
}

impl EventLogTablesRepo for SettleStore {
    fn append_event_row(
        &mut self,
        ingest: IngestRecord,
        record: EventRecord,
    ) -> Result<(), StorageError> {
        self.append_event(ingest, record)
    }

    fn ingest_row(
        &self,
        tenant_id: &TenantId,
        idempotency_key: &IdempotencyKey,
    ) -> Option<&IngestRecord> {
        self.ingest_record(tenant_id, idempotency_key)
    }

    fn event_slot_row(&self, event_id: &EventId) -> Option<&WindowSlot> {
        self.event_slot(event_id)
    }

    fn slot_event_rows(&self, slot: &WindowSlot) -> Vec<EventRecord> {
        self.slot_events(slot)
    }
}

impl TranscriptsTablesRepo for SettleStore {
    fn put_transcript_row(&mut self, sealed: SealedTranscript) -> Result<bool, StorageError> {
        self.put_transcript(sealed)
    }

    fn transcript_row(&self, seal_hash: &SealHash) -> Option<&SealedTranscript> {
        self.transcript(seal_hash)
    }
}

impl AcceptanceExportTablesRepo for SettleStore {
    fn append_proof_rows(
        &mut self,
        seal_hash: &SealHash,
        quorum: u8,
        freshness_s: u64,
        proofs: Vec<Attestation>,
    ) -> Result<AcceptanceBundle, StorageError> {
        self.append_proofs(seal_hash, quorum, freshness_s, proofs)
            .cloned()
    }

    fn record_bundle_evaluation_row(
        &mut self,
        seal_hash: &SealHash,
        verdicts: Vec<ProofVerdict>,
        verified: bool,
        reason_code: Option<AcceptanceReason>,
    ) -> Result<(), StorageError> {
        self.record_bundle_evaluation(seal_hash, verdicts, verified, reason_code)
    }

    fn proof_bundle_row(&self, seal_hash: &SealHash) -> Option<&AcceptanceBundle> {
        self.proof_bundle(seal_hash)
    }

    fn put_acceptance_row(&mut self, record: AcceptanceRecord) -> Result<(), StorageError> {
        self.put_acceptance(record)
    }

    fn acceptance_row(&self, seal_hash: &SealHash) -> Option<&AcceptanceRecord> {
        self.acceptance_for(seal_hash)
    }

    fn acceptance_ledger(&self) -> &[AcceptanceRecord] {
        self.acceptance_ledger_rows()
    }

    fn put_export_rows(
        &mut self,
        manifest: ExportManifest,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<bool, StorageError> {
        self.put_export(manifest, files)
    }

    fn manifest_row(&self, seal_hash: &SealHash) -> Option<&ExportManifest> {
        self.manifest_for(seal_hash)
    }

    fn artifact_rows(&self, seal_hash: &SealHash) -> BTreeMap<String, Vec<u8>> {
        self.artifacts_for(seal_hash)
    }
}

impl OpsJournalTablesRepo for SettleStore {
    fn append_ops_row(
        &mut self,
        at: MonotonicTimeNs,
        window_id: WindowId,
        action: OpsAction,
        detail: String,
    ) -> u64 {
        self.append_ops(at, window_id, action, detail)
    }

    fn ops_rows(&self) -> &[OpsJournalRow] {
        self.ops_journal_rows()
    }

    fn raise_alert_row(
        &mut self,
        at: MonotonicTimeNs,
        window_id: WindowId,
        code: String,
        detail: String,
    ) -> u64 {
        self.raise_alert(at, window_id, code, detail)
    }

    fn alert_rows_all(&self) -> &[OperatorAlert] {
        self.alert_rows()
    }

    fn append_audit_report_row(&mut self, report: AuditReport) {
        self.append_audit_report(report)
    }

    fn audit_report_rows_all(&self) -> &[AuditReport] {
        self.audit_report_rows()
    }
}
