#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};
use thiserror::Error;
use vgo_kernel_contracts::acceptance::{
    AcceptanceBundle, AcceptanceReason, AcceptanceRecord, Attestation, ProofVerdict,
};
use vgo_kernel_contracts::audit::AuditReport;
use vgo_kernel_contracts::event::{EventRecord, IngestRecord};
use vgo_kernel_contracts::export::ExportManifest;
use vgo_kernel_contracts::ids::{EventId, IdempotencyKey, PartitionId, SealHash, TenantId, WindowId};
use vgo_kernel_contracts::transcript::SealedTranscript;
use vgo_kernel_contracts::window::{
    is_allowed_window_transition, WindowKey, WindowRecord, WindowStatus,
};
use vgo_kernel_contracts::{ContractViolation, MonotonicTimeNs, Validate};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("foreign key violation on {table}: {key}")]
    ForeignKeyViolation { table: &'static str, key: String },
    #[error("duplicate key on {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("append-only violation on {table}")]
    AppendOnlyViolation { table: &'static str },
    #[error("write-once violation on {table}: {key}")]
    WriteOnceViolation { table: &'static str, key: String },
    #[error("stale revision on {table} for {key}: expected {expected}, found {found}")]
    StaleRevision {
        table: &'static str,
        key: String,
        expected: u64,
        found: u64,
    },
    #[error("illegal status transition for {key}: {from} -> {to}")]
    IllegalTransition {
        key: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("integrity violation on {table}: {key}")]
    IntegrityViolation { table: &'static str, key: String },
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
}

/// One settlement cycle of a (tenant, partition). Every correction version
/// of the cycle shares the slot and its event buffer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowSlot {
    pub tenant_id: TenantId,
    pub partition_id: PartitionId,
    pub window_seq: u64,
}

impl WindowSlot {
    pub fn of(key: &WindowKey) -> Self {
        Self {
            tenant_id: key.tenant_id.clone(),
            partition_id: key.partition_id.clone(),
            window_seq: key.window_seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRow {
    pub record: WindowRecord,
    /// Bumped on every update; commits compare it to detect lost races.
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpsAction {
    WindowOpened,
    EventIngested,
    LeaseClaimed,
    LeaseRenewed,
    LeaseReleased,
    WatermarkAdvanced,
    WindowClosed,
    WindowSealed,
    ProofsSubmitted,
    AcceptanceEvaluated,
    WindowExported,
    AuditCompleted,
    WindowInvalidated,
    WindowSuperseded,
}

impl OpsAction {
    pub fn as_str(self) -> &'static str {
        match self {
            OpsAction::WindowOpened => "WINDOW_OPENED",
            OpsAction::EventIngested => "EVENT_INGESTED",
            OpsAction::LeaseClaimed => "LEASE_CLAIMED",
            OpsAction::LeaseRenewed => "LEASE_RENEWED",
            OpsAction::LeaseReleased => "LEASE_RELEASED",
            OpsAction::WatermarkAdvanced => "WATERMARK_ADVANCED",
            OpsAction::WindowClosed => "WINDOW_CLOSED",
            OpsAction::WindowSealed => "WINDOW_SEALED",
            OpsAction::ProofsSubmitted => "PROOFS_SUBMITTED",
            OpsAction::AcceptanceEvaluated => "ACCEPTANCE_EVALUATED",
            OpsAction::WindowExported => "WINDOW_EXPORTED",
            OpsAction::AuditCompleted => "AUDIT_COMPLETED",
            OpsAction::WindowInvalidated => "WINDOW_INVALIDATED",
            OpsAction::WindowSuperseded => "WINDOW_SUPERSEDED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsJournalRow {
    pub seq: u64,
    pub at: MonotonicTimeNs,
    pub window_id: WindowId,
    pub action: OpsAction,
    pub detail: String,
}

/// Raised for invariant violations and audit mismatches. Never cleared by
/// the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorAlert {
    pub seq: u64,
    pub at: MonotonicTimeNs,
    pub window_id: WindowId,
    pub code: String,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct SettleStore {
    windows: BTreeMap<WindowId, WindowRow>,
    // (tenant, partition, seq) -> version -> window_id
    window_slots: BTreeMap<WindowSlot, BTreeMap<u32, WindowId>>,

    // Append-only event buffers, one per slot.
    event_log: BTreeMap<WindowSlot, BTreeMap<EventId, EventRecord>>,
    // Global event_id uniqueness: event_id -> owning slot.
    event_slots: BTreeMap<EventId, WindowSlot>,
    // Ingest idempotency: (tenant, idempotency_key) -> first recorded result.
    ingest_index: BTreeMap<(TenantId, IdempotencyKey), IngestRecord>,

    // Write-once, content-addressed.
    transcripts: BTreeMap<SealHash, SealedTranscript>,

    proof_bundles: BTreeMap<SealHash, AcceptanceBundle>,
    acceptance_current: BTreeMap<SealHash, AcceptanceRecord>,
    acceptance_ledger: Vec<AcceptanceRecord>,

    manifests: BTreeMap<SealHash, ExportManifest>,
    artifacts: BTreeMap<(SealHash, String), Vec<u8>>,

    audit_reports: Vec<AuditReport>,
    ops_journal: Vec<OpsJournalRow>,
    alerts: Vec<OperatorAlert>,
}

impl SettleStore {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    // ---- windows ----

    pub fn insert_window(&mut self, record: WindowRecord) -> Result<u64, StorageError> {
        record.validate()?;
        if self.windows.contains_key(&record.window_id) {
            return Err(StorageError::DuplicateKey {
                table: "windows",
                key: record.window_id.to_string(),
            });
        }
        let slot = WindowSlot::of(&record.key);
        self.window_slots
            .entry(slot)
            .or_default()
            .insert(record.key.version, record.window_id.clone());
        self.windows.insert(
            record.window_id.clone(),
            WindowRow {
                record,
                revision: 1,
            },
        );
        Ok(1)
    }

    pub fn window_row(&self, window_id: &WindowId) -> Option<&WindowRow> {
        self.windows.get(window_id)
    }

    pub fn window(&self, window_id: &WindowId) -> Option<&WindowRecord> {
        self.windows.get(window_id).map(|row| &row.record)
    }

    /// Compare-and-swap on the row revision. The key is immutable and the
    /// status may only move along allowed transitions.
    pub fn update_window(
        &mut self,
        record: WindowRecord,
        expected_revision: u64,
    ) -> Result<u64, StorageError> {
        record.validate()?;
        let row = self
            .windows
            .get_mut(&record.window_id)
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: "windows",
                key: record.window_id.to_string(),
            })?;
        if row.revision != expected_revision {
            return Err(StorageError::StaleRevision {
                table: "windows",
                key: record.window_id.to_string(),
                expected: expected_revision,
                found: row.revision,
            });
        }
        if row.record.key != record.key {
            return Err(StorageError::IntegrityViolation {
                table: "windows",
                key: record.window_id.to_string(),
            });
        }
        if !is_allowed_window_transition(row.record.status, record.status) {
            return Err(StorageError::IllegalTransition {
                key: record.window_id.to_string(),
                from: row.record.status.as_str(),
                to: record.status.as_str(),
            });
        }
        if row.record.watermark > record.watermark {
            return Err(StorageError::IntegrityViolation {
                table: "windows.watermark",
                key: record.window_id.to_string(),
            });
        }
        row.record = record;
        row.revision = row.revision.saturating_add(1);
        Ok(row.revision)
    }

    /// All versions of one cycle, lowest version first.
    pub fn slot_versions(&self, slot: &WindowSlot) -> Vec<&WindowRecord> {
        self.window_slots
            .get(slot)
            .map(|versions| {
                versions
                    .values()
                    .filter_map(|id| self.window(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn latest_version(&self, slot: &WindowSlot) -> Option<&WindowRecord> {
        self.window_slots
            .get(slot)
            .and_then(|versions| versions.values().next_back())
            .and_then(|id| self.window(id))
    }

    /// The OPEN window accepting events for a (tenant, partition), if any.
    pub fn open_window_for(
        &self,
        tenant_id: &TenantId,
        partition_id: &PartitionId,
    ) -> Option<&WindowRecord> {
        self.window_slots
            .iter()
            .rev()
            .filter(|(slot, _)| slot.tenant_id == *tenant_id && slot.partition_id == *partition_id)
            .flat_map(|(_, versions)| versions.values().rev())
            .filter_map(|id| self.window(id))
            .find(|w| w.status == WindowStatus::Open)
    }

    pub fn has_any_window(&self, tenant_id: &TenantId, partition_id: &PartitionId) -> bool {
        self.window_slots
            .keys()
            .any(|slot| slot.tenant_id == *tenant_id && slot.partition_id == *partition_id)
    }

    // ---- event log ----

    /// Appends an event and its idempotency row together, or neither.
    pub fn append_event(
        &mut self,
        ingest: IngestRecord,
        record: EventRecord,
    ) -> Result<(), StorageError> {
        record.validate()?;
        ingest.tenant_id.validate()?;
        ingest.idempotency_key.validate()?;
        let window = self
            .window(&ingest.window_id)
            .ok_or_else(|| StorageError::ForeignKeyViolation {
                table: "windows",
                key: ingest.window_id.to_string(),
            })?;
        let slot = WindowSlot::of(&window.key);
        if record.tenant_id != slot.tenant_id
            || record.partition_id != slot.partition_id
            || ingest.event_id != record.event_id
            || ingest.tenant_id != record.tenant_id
        {
            return Err(StorageError::IntegrityViolation {
                table: "event_log",
                key: record.event_id.to_string(),
            });
        }
        let idem = (ingest.tenant_id.clone(), ingest.idempotency_key.clone());
        if self.ingest_index.contains_key(&idem) {
            return Err(StorageError::DuplicateKey {
                table: "ingest_index",
                key: ingest.idempotency_key.to_string(),
            });
        }
        if self.event_slots.contains_key(&record.event_id) {
            return Err(StorageError::DuplicateKey {
                table: "event_log",
                key: record.event_id.to_string(),
            });
        }
        self.event_slots.insert(record.event_id.clone(), slot.clone());
        self.ingest_index.insert(idem, ingest);
        self.event_log
            .entry(slot)
            .or_default()
            .insert(record.event_id.clone(), record);
        Ok(())
    }

    pub fn ingest_record(
        &self,
        tenant_id: &TenantId,
        idempotency_key: &IdempotencyKey,
    ) -> Option<&IngestRecord> {
        self.ingest_index
            .get(&(tenant_id.clone(), idempotency_key.clone()))
    }

    pub fn event_slot(&self, event_id: &EventId) -> Option<&WindowSlot> {
        self.event_slots.get(event_id)
    }

    /// Buffered events of a slot, sorted by `event_id`.
    pub fn slot_events(&self, slot: &WindowSlot) -> Vec<EventRecord> {
        self.event_log
            .get(slot)
            .map(|events| events.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn attempt_overwrite_event(&mut self, _event_id: &EventId) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation { table: "event_log" })
    }

    // ---- transcripts ----

    /// Returns `false` when the identical transcript was already stored.
    pub fn put_transcript(&mut self, sealed: SealedTranscript) -> Result<bool, StorageError> {
        sealed.seal_hash.validate()?;
        if self.window(&sealed.window_id).is_none() {
            return Err(StorageError::ForeignKeyViolation {
                table: "windows",
                key: sealed.window_id.to_string(),
            });
        }
        match self.transcripts.get(&sealed.seal_hash) {
            Some(existing) if *existing == sealed => Ok(false),
            Some(_) => Err(StorageError::WriteOnceViolation {
                table: "transcripts",
                key: sealed.seal_hash.to_string(),
            }),
            None => {
                self.transcripts.insert(sealed.seal_hash.clone(), sealed);
                Ok(true)
            }
        }
    }

    pub fn transcript(&self, seal_hash: &SealHash) -> Option<&SealedTranscript> {
        self.transcripts.get(seal_hash)
    }

    pub fn attempt_overwrite_transcript(&mut self, seal_hash: &SealHash) -> Result<(), StorageError> {
        Err(StorageError::WriteOnceViolation {
            table: "transcripts",
            key: seal_hash.to_string(),
        })
    }

    // ---- proof bundles ----

    /// Adds proofs to the bundle bound to `seal_hash`. Exact duplicates are
    /// dropped. Any new proof clears the previous evaluation.
    pub fn append_proofs(
        &mut self,
        seal_hash: &SealHash,
        quorum: u8,
        freshness_s: u64,
        proofs: Vec<Attestation>,
    ) -> Result<&AcceptanceBundle, StorageError> {
        if !self.transcripts.contains_key(seal_hash) {
            return Err(StorageError::ForeignKeyViolation {
                table: "transcripts",
                key: seal_hash.to_string(),
            });
        }
        for proof in &proofs {
            proof.validate()?;
        }
        let bundle = self
            .proof_bundles
            .entry(seal_hash.clone())
            .or_insert_with(|| AcceptanceBundle::empty_v1(seal_hash.clone(), quorum, freshness_s));
        let mut changed = false;
        for proof in proofs {
            if !bundle.proofs.contains(&proof) {
                bundle.proofs.push(proof);
                changed = true;
            }
        }
        if changed {
            bundle.verdicts.clear();
            bundle.verified = false;
            bundle.reason_code = None;
        }
        Ok(bundle)
    }

    pub fn record_bundle_evaluation(
        &mut self,
        seal_hash: &SealHash,
        verdicts: Vec<ProofVerdict>,
        verified: bool,
        reason_code: Option<AcceptanceReason>,
    ) -> Result<(), StorageError> {
        let bundle = self.proof_bundles.get_mut(seal_hash).ok_or_else(|| {
            StorageError::ForeignKeyViolation {
                table: "proof_bundles",
                key: seal_hash.to_string(),
            }
        })?;
        bundle.verdicts = verdicts;
        bundle.verified = verified;
        bundle.reason_code = reason_code;
        Ok(())
    }

    pub fn proof_bundle(&self, seal_hash: &SealHash) -> Option<&AcceptanceBundle> {
        self.proof_bundles.get(seal_hash)
    }

    // ---- acceptance ----

    pub fn put_acceptance(&mut self, record: AcceptanceRecord) -> Result<(), StorageError> {
        record.validate()?;
        if !self.transcripts.contains_key(&record.seal_hash) {
            return Err(StorageError::ForeignKeyViolation {
                table: "transcripts",
                key: record.seal_hash.to_string(),
            });
        }
        self.acceptance_current
            .insert(record.seal_hash.clone(), record.clone());
        self.acceptance_ledger.push(record);
        Ok(())
    }

    pub fn acceptance_for(&self, seal_hash: &SealHash) -> Option<&AcceptanceRecord> {
        self.acceptance_current.get(seal_hash)
    }

    pub fn acceptance_ledger_rows(&self) -> &[AcceptanceRecord] {
        &self.acceptance_ledger
    }

    // ---- export ----

    /// Stores a manifest with its artifact bytes. Bytes must hash to the
    /// manifest entries. Returns `false` on an identical retry.
    pub fn put_export(
        &mut self,
        manifest: ExportManifest,
        files: Vec<(String, Vec<u8>)>,
    ) -> Result<bool, StorageError> {
        manifest.validate()?;
        match self.acceptance_current.get(&manifest.seal_hash) {
            Some(acc) if acc.acceptance_id == manifest.acceptance_id => {}
            _ => {
                return Err(StorageError::ForeignKeyViolation {
                    table: "acceptance",
                    key: manifest.acceptance_id.to_string(),
                })
            }
        }
        if let Some(existing) = self.manifests.get(&manifest.seal_hash) {
            if *existing == manifest {
                return Ok(false);
            }
            return Err(StorageError::WriteOnceViolation {
                table: "manifests",
                key: manifest.seal_hash.to_string(),
            });
        }
        if files.len() != manifest.files.len() {
            return Err(StorageError::IntegrityViolation {
                table: "artifacts",
                key: manifest.seal_hash.to_string(),
            });
        }
        for (name, bytes) in &files {
            let entry = manifest.files.iter().find(|f| f.name == *name);
            let ok = entry
                .map(|f| f.bytes == bytes.len() as u64 && f.sha256 == sha256_hex(bytes))
                .unwrap_or(false);
            if !ok {
                return Err(StorageError::IntegrityViolation {
                    table: "artifacts",
                    key: name.clone(),
                });
            }
        }
        for (name, bytes) in files {
            self.artifacts
                .insert((manifest.seal_hash.clone(), name), bytes);
        }
        self.manifests.insert(manifest.seal_hash.clone(), manifest);
        Ok(true)
    }

    pub fn manifest_for(&self, seal_hash: &SealHash) -> Option<&ExportManifest> {
        self.manifests.get(seal_hash)
    }

    pub fn artifacts_for(&self, seal_hash: &SealHash) -> BTreeMap<String, Vec<u8>> {
        self.artifacts
            .iter()
            .filter(|((seal, _), _)| seal == seal_hash)
            .map(|((_, name), bytes)| (name.clone(), bytes.clone()))
            .collect()
    }

    // ---- audit, journal, alerts ----

    pub fn append_audit_report(&mut self, report: AuditReport) {
        self.audit_reports.push(report);
    }

    pub fn audit_report_rows(&self) -> &[AuditReport] {
        &self.audit_reports
    }

    pub fn append_ops(
        &mut self,
        at: MonotonicTimeNs,
        window_id: WindowId,
        action: OpsAction,
        detail: impl Into<String>,
    ) -> u64 {
        let seq = self.ops_journal.len() as u64 + 1;
        self.ops_journal.push(OpsJournalRow {
            seq,
            at,
            window_id,
            action,
            detail: detail.into(),
        });
        seq
    }

    pub fn ops_journal_rows(&self) -> &[OpsJournalRow] {
        &self.ops_journal
    }

    pub fn attempt_overwrite_ops_row(&mut self, _seq: u64) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: "ops_journal",
        })
    }

    pub fn raise_alert(
        &mut self,
        at: MonotonicTimeNs,
        window_id: WindowId,
        code: impl Into<String>,
        detail: impl Into<String>,
    ) -> u64 {
        let seq = self.alerts.len() as u64 + 1;
        self.alerts.push(OperatorAlert {
            seq,
            at,
            window_id,
            code: code.into(),
            detail: detail.into(),
        });
        seq
    }

    pub fn alert_rows(&self) -> &[OperatorAlert] {
        &self.alerts
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
