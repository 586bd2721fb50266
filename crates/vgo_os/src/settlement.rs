#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::{error, info, warn};
use vgo_engines::accept::{AcceptanceRuntime, KeyRegistry};
use vgo_engines::audit::{AuditInputs, AuditRuntime};
use vgo_engines::carry::carry_forward;
use vgo_engines::export::{ExportError, ExportRuntime};
use vgo_engines::intake::{payload_digest, reason_codes as intake_codes, IntakeRefuse, IntakeRuntime};
use vgo_engines::lease::{
    holds_lease, reason_codes as lease_codes, LeaseDecision, LeaseRequest, LeaseRuntime,
};
use vgo_engines::seal::{replay_digest, seal_window, transcript_digest, SealError};
use vgo_kernel_contracts::acceptance::{AcceptanceBundle, AcceptanceRecord, Attestation};
use vgo_kernel_contracts::allocation::Decision;
use vgo_kernel_contracts::audit::{AuditDiff, AuditReport};
use vgo_kernel_contracts::event::{IngestReceipt, IngestRecord, RawEvent};
use vgo_kernel_contracts::export::ExportManifest;
use vgo_kernel_contracts::fold::FoldDescriptor;
use vgo_kernel_contracts::ids::{
    IdempotencyKey, PartitionId, PrincipalId, SealHash, TenantId, WindowId, WriterId,
};
use vgo_kernel_contracts::policy::PolicyManifest;
use vgo_kernel_contracts::transcript::{SealedTranscript, TranscriptInputs};
use vgo_kernel_contracts::window::{LeaseOperation, WindowKey, WindowRecord, WindowStatus, WriterLease};
use vgo_kernel_contracts::{LogicalTime, MonotonicTimeNs, ReasonCodeId, UnixSeconds, Validate};
use vgo_storage::store::{OperatorAlert, OpsAction, OpsJournalRow, SettleStore, WindowRow, WindowSlot};

use crate::config::EngineConfig;
use crate::error::SettleError;

/// Both clocks the service reads. Lease expiry runs on `mono`, attestation
/// freshness on `wall`. Neither ever reaches a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Now {
    pub mono: MonotonicTimeNs,
    pub wall: UnixSeconds,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterCredentials {
    pub writer_id: WriterId,
    pub lease_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenWindowRequest {
    pub tenant_id: TenantId,
    pub partition_id: PartitionId,
    pub opens_at: LogicalTime,
    pub bucket_width_ticks: u64,
    pub policy: PolicyManifest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRequest {
    pub idempotency_key: String,
    pub event: RawEvent,
    /// Explicit target. Without one the event goes to the open window of
    /// the partition its principal shards to.
    pub window_id: Option<WindowId>,
    pub writer: Option<WriterCredentials>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaseGrant {
    pub window_id: WindowId,
    pub writer_id: WriterId,
    pub lease_token: String,
    pub expires_at: MonotonicTimeNs,
    pub takeover: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloseOutcome {
    pub closed: WindowRecord,
    pub next: WindowRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SealOutcome {
    pub window_id: WindowId,
    pub seal_hash: SealHash,
    pub already_sealed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptView {
    pub sealed: SealedTranscript,
    /// Digest recomputed from the stored transcript body.
    pub digest: SealHash,
}

/// Window lifecycle orchestration over one in-memory store.
///
/// Every public call takes the store lock for its reads and its commit.
/// Sealing and authorization run their pure computation outside the lock
/// and commit only if the window row is unchanged.
pub struct SettlementService<K> {
    store: Mutex<SettleStore>,
    registry: K,
    config: EngineConfig,
    intake: IntakeRuntime,
    lease: LeaseRuntime,
    acceptance: AcceptanceRuntime,
    export: ExportRuntime,
    audit: AuditRuntime,
}

impl<K: KeyRegistry> SettlementService<K> {
    pub fn new(config: EngineConfig, registry: K) -> Self {
        Self::with_store(config, registry, SettleStore::new_in_memory())
    }

    pub fn with_store(config: EngineConfig, registry: K, store: SettleStore) -> Self {
        Self {
            store: Mutex::new(store),
            registry,
            config,
            intake: IntakeRuntime::new(config.intake),
            lease: LeaseRuntime::new(config.lease),
            acceptance: AcceptanceRuntime::new(config.acceptance),
            export: ExportRuntime::new(config.export),
            audit: AuditRuntime::new(config.audit),
        }
    }

    pub fn config(&self) -> EngineConfig {
        self.config
    }

    pub fn registry(&self) -> &K {
        &self.registry
    }

    fn store(&self) -> MutexGuard<'_, SettleStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- windows ----

    /// Opens seq 1 of a (tenant, partition). Later windows come from `close`.
    pub fn open_window(
        &self,
        req: OpenWindowRequest,
        now: Now,
    ) -> Result<WindowRecord, SettleError> {
        let shard = self.intake.shard();
        if !shard.contains(&req.partition_id) {
            return Err(SettleError::PartitionMismatch {
                message: format!(
                    "{} is not a partition of shard v{} over {} partitions",
                    req.partition_id, shard.version, shard.partition_count
                ),
            });
        }
        let fold = FoldDescriptor::canonical_v1(req.bucket_width_ticks)?;
        let key = WindowKey::v1(req.tenant_id, req.partition_id, 1, 1)?;
        let record = WindowRecord::open_v1(key, req.opens_at, req.policy, fold)?;

        let mut store = self.store();
        if store.has_any_window(&record.key.tenant_id, &record.key.partition_id) {
            return Err(SettleError::WindowExists {
                window_id: record.window_id,
            });
        }
        store.insert_window(record.clone())?;
        store.append_ops(
            now.mono,
            record.window_id.clone(),
            OpsAction::WindowOpened,
            format!("opens_at={}", record.opens_at.0),
        );
        info!(window_id = %record.window_id, opens_at = record.opens_at.0, "window opened");
        Ok(record)
    }

    pub fn window(&self, window_id: &WindowId) -> Result<WindowRecord, SettleError> {
        load_window(&self.store(), window_id).map(|row| row.record)
    }

    pub fn ops_journal(&self, window_id: &WindowId) -> Vec<OpsJournalRow> {
        self.store()
            .ops_journal_rows()
            .iter()
            .filter(|row| row.window_id == *window_id)
            .cloned()
            .collect()
    }

    pub fn alerts(&self) -> Vec<OperatorAlert> {
        self.store().alert_rows().to_vec()
    }

    // ---- intake ----

    /// Exactly-once ingestion keyed by (tenant, idempotency key).
    pub fn ingest(&self, req: IngestRequest, now: Now) -> Result<IngestReceipt, SettleError> {
        let tenant_id = TenantId::new(req.event.tenant_id.clone())?;
        let idempotency_key = IdempotencyKey::new(req.idempotency_key.clone())?;
        let digest = payload_digest(&req.event);

        let mut store = self.store();
        if let Some(prior) = store.ingest_record(&tenant_id, &idempotency_key) {
            if prior.payload_digest != digest {
                warn!(
                    tenant_id = %tenant_id,
                    idempotency_key = %idempotency_key,
                    "idempotency key reused with a different payload"
                );
                return Err(SettleError::IdempotencyKeyReused {
                    key: idempotency_key.to_string(),
                });
            }
            return Ok(IngestReceipt {
                event_id: prior.event_id.clone(),
                window_id: prior.window_id.clone(),
                accepted: true,
                replayed: true,
            });
        }

        let window = match &req.window_id {
            Some(window_id) => load_window(&store, window_id)?.record,
            None => {
                let principal_id = PrincipalId::new(req.event.principal_id.clone())?;
                let partition_id = self.intake.shard().partition_for(&principal_id)?;
                store
                    .open_window_for(&tenant_id, &partition_id)
                    .cloned()
                    .ok_or_else(|| SettleError::NotFound {
                        what: "open window",
                        id: format!("{tenant_id}/{partition_id}"),
                    })?
            }
        };
        if window.status != WindowStatus::Open {
            let next_window = store
                .open_window_for(&window.key.tenant_id, &window.key.partition_id)
                .map(|w| w.window_id.clone());
            warn!(
                window_id = %window.window_id,
                event_id = %req.event.event_id,
                "event targets a closed window"
            );
            return Err(SettleError::WindowClosed {
                window_id: window.window_id,
                next_window,
            });
        }
        check_writer(&window, req.writer.as_ref(), now.mono)?;

        let record = self
            .intake
            .normalize(&req.event, &window)
            .map_err(intake_refusal)?;
        if store.event_slot(&record.event_id).is_some() {
            return Err(SettleError::DuplicateEventId {
                event_id: record.event_id.to_string(),
            });
        }
        let ingest = IngestRecord {
            tenant_id,
            idempotency_key,
            payload_digest: digest,
            event_id: record.event_id.clone(),
            window_id: window.window_id.clone(),
        };
        let event_id = record.event_id.clone();
        store.append_event(ingest, record)?;
        store.append_ops(
            now.mono,
            window.window_id.clone(),
            OpsAction::EventIngested,
            event_id.to_string(),
        );
        info!(window_id = %window.window_id, event_id = %event_id, "event ingested");
        Ok(IngestReceipt {
            event_id,
            window_id: window.window_id,
            accepted: true,
            replayed: false,
        })
    }

    // ---- leases ----

    pub fn claim(
        &self,
        window_id: &WindowId,
        writer_id: &WriterId,
        ttl_ms: u32,
        now: Now,
    ) -> Result<LeaseGrant, SettleError> {
        let (lease, takeover) =
            self.apply_lease(window_id, writer_id, LeaseOperation::Claim, ttl_ms, None, now)?;
        lease_grant(window_id, lease, takeover)
    }

    pub fn renew(
        &self,
        window_id: &WindowId,
        writer_id: &WriterId,
        lease_token: &str,
        ttl_ms: u32,
        now: Now,
    ) -> Result<LeaseGrant, SettleError> {
        let (lease, _) = self.apply_lease(
            window_id,
            writer_id,
            LeaseOperation::Renew,
            ttl_ms,
            Some(lease_token),
            now,
        )?;
        lease_grant(window_id, lease, false)
    }

    pub fn release(
        &self,
        window_id: &WindowId,
        writer_id: &WriterId,
        lease_token: &str,
        now: Now,
    ) -> Result<(), SettleError> {
        self.apply_lease(
            window_id,
            writer_id,
            LeaseOperation::Release,
            self.config.lease.min_ttl_ms,
            Some(lease_token),
            now,
        )
        .map(|_| ())
    }

    fn apply_lease(
        &self,
        window_id: &WindowId,
        writer_id: &WriterId,
        operation: LeaseOperation,
        ttl_ms: u32,
        presented_token: Option<&str>,
        now: Now,
    ) -> Result<(Option<WriterLease>, bool), SettleError> {
        let mut store = self.store();
        let row = load_window(&store, window_id)?;
        if !matches!(row.record.status, WindowStatus::Open | WindowStatus::Closed) {
            return Err(invalid_state(&row.record, lease_operation_name(operation)));
        }
        let decision = self.lease.decide(&LeaseRequest {
            window_id,
            writer_id,
            operation,
            requested_ttl_ms: ttl_ms,
            now: now.mono,
            presented_token,
            active: row.record.writer_lease.as_ref(),
        });
        match decision {
            LeaseDecision::Denied {
                reason_code,
                held_by,
                held_until,
            } => {
                warn!(
                    window_id = %window_id,
                    writer_id = %writer_id,
                    reason_code = reason_code.0,
                    "lease request denied"
                );
                Err(self.lease_denied(window_id, ttl_ms, reason_code, held_by, held_until))
            }
            LeaseDecision::Granted {
                lease, takeover, ..
            } => {
                let mut record = row.record;
                record.writer_lease = lease.clone();
                store.update_window(record, row.revision)?;
                let action = match operation {
                    LeaseOperation::Claim => OpsAction::LeaseClaimed,
                    LeaseOperation::Renew => OpsAction::LeaseRenewed,
                    LeaseOperation::Release => OpsAction::LeaseReleased,
                };
                store.append_ops(
                    now.mono,
                    window_id.clone(),
                    action,
                    format!("writer={writer_id} takeover={takeover}"),
                );
                info!(
                    window_id = %window_id,
                    writer_id = %writer_id,
                    operation = lease_operation_name(operation),
                    takeover,
                    "lease updated"
                );
                Ok((lease, takeover))
            }
        }
    }

    fn lease_denied(
        &self,
        window_id: &WindowId,
        ttl_ms: u32,
        reason_code: ReasonCodeId,
        held_by: Option<WriterId>,
        held_until: Option<MonotonicTimeNs>,
    ) -> SettleError {
        let window_id = window_id.clone();
        match reason_code {
            lease_codes::LEASE_HELD_BY_OTHER => SettleError::LeaseHeldByOther {
                window_id,
                held_by,
                held_until,
            },
            lease_codes::LEASE_TOKEN_INVALID => SettleError::LeaseTokenInvalid { window_id },
            lease_codes::LEASE_NOT_FOUND => SettleError::LeaseNotFound { window_id },
            lease_codes::LEASE_EXPIRED => SettleError::LeaseExpired { window_id },
            _ => SettleError::LeaseTtlOutOfBounds {
                requested_ms: ttl_ms,
                min_ms: self.config.lease.min_ttl_ms,
                max_ms: self.config.lease.max_ttl_ms,
            },
        }
    }

    // ---- watermark / close ----

    pub fn advance_watermark(
        &self,
        window_id: &WindowId,
        to: LogicalTime,
        writer: Option<&WriterCredentials>,
        now: Now,
    ) -> Result<WindowRecord, SettleError> {
        let mut store = self.store();
        let row = load_window(&store, window_id)?;
        if row.record.status != WindowStatus::Open {
            let next_window = store
                .open_window_for(&row.record.key.tenant_id, &row.record.key.partition_id)
                .map(|w| w.window_id.clone());
            return Err(SettleError::WindowClosed {
                window_id: window_id.clone(),
                next_window,
            });
        }
        check_writer(&row.record, writer, now.mono)?;
        if to < row.record.watermark {
            warn!(
                window_id = %window_id,
                current = row.record.watermark.0,
                requested = to.0,
                "watermark regression rejected"
            );
            return Err(SettleError::StaleWatermark {
                current: row.record.watermark,
                requested: to,
            });
        }
        if to == row.record.watermark {
            return Ok(row.record);
        }
        let mut record = row.record;
        record.watermark = to;
        store.update_window(record.clone(), row.revision)?;
        store.append_ops(
            now.mono,
            window_id.clone(),
            OpsAction::WatermarkAdvanced,
            format!("watermark={}", to.0),
        );
        info!(window_id = %window_id, watermark = to.0, "watermark advanced");
        Ok(record)
    }

    /// OPEN -> CLOSED, and opens the next cycle at the closing watermark.
    ///
    /// Rejected while someone else holds a live lease. The caller's own
    /// lease is released by the close.
    pub fn close(
        &self,
        window_id: &WindowId,
        writer: Option<&WriterCredentials>,
        now: Now,
    ) -> Result<CloseOutcome, SettleError> {
        let mut store = self.store();
        let row = load_window(&store, window_id)?;
        let successor_key = row.record.key.successor();
        match row.record.status {
            WindowStatus::Open => {}
            WindowStatus::Closed => {
                if let Some(next) = store
                    .latest_version(&WindowSlot::of(&successor_key))
                    .cloned()
                {
                    return Ok(CloseOutcome {
                        closed: row.record,
                        next,
                    });
                }
                return Err(invalid_state(&row.record, "close"));
            }
            _ => return Err(invalid_state(&row.record, "close")),
        }
        if let Some(lease) = row.record.live_lease(now.mono) {
            let own = writer
                .map(|w| holds_lease(lease, &w.writer_id, &w.lease_token))
                .unwrap_or(false);
            if !own {
                warn!(window_id = %window_id, held_by = %lease.writer_id, "close blocked by live lease");
                return Err(SettleError::WindowBusy {
                    window_id: window_id.clone(),
                    held_by: lease.writer_id.clone(),
                });
            }
        }

        let mut closed = row.record;
        closed.status = WindowStatus::Closed;
        closed.writer_lease = None;
        let next = WindowRecord::open_v1(
            successor_key,
            closed.watermark,
            closed.policy.clone(),
            closed.fold.clone(),
        )?;
        store.update_window(closed.clone(), row.revision)?;
        store.insert_window(next.clone())?;
        store.append_ops(
            now.mono,
            closed.window_id.clone(),
            OpsAction::WindowClosed,
            format!("watermark={}", closed.watermark.0),
        );
        store.append_ops(
            now.mono,
            next.window_id.clone(),
            OpsAction::WindowOpened,
            format!("opens_at={}", next.opens_at.0),
        );
        info!(
            window_id = %closed.window_id,
            next_window_id = %next.window_id,
            watermark = closed.watermark.0,
            "window closed"
        );
        Ok(CloseOutcome { closed, next })
    }

    // ---- seal ----

    /// Freezes the window into a transcript. Resealing a sealed window
    /// returns the stored hash.
    pub fn seal(&self, window_id: &WindowId, now: Now) -> Result<SealOutcome, SettleError> {
        let (revision, inputs) = {
            let store = self.store();
            let row = load_window(&store, window_id)?;
            if let (true, Some(seal_hash)) = (row.record.status.is_sealed(), &row.record.seal_hash) {
                return Ok(SealOutcome {
                    window_id: window_id.clone(),
                    seal_hash: seal_hash.clone(),
                    already_sealed: true,
                });
            }
            if row.record.status != WindowStatus::Closed {
                return Err(invalid_state(&row.record, "seal"));
            }
            let inputs = frozen_inputs(&store, &row.record)?;
            (row.revision, inputs)
        };

        let sealed = match seal_window(inputs) {
            Ok(sealed) => sealed,
            Err(err) => return Err(self.mark_invalid(window_id, revision, &err, now)),
        };

        let mut store = self.store();
        let row = load_window(&store, window_id)?;
        if row.revision != revision {
            warn!(window_id = %window_id, "window changed during seal; result discarded");
            return Err(SettleError::StaleCommit {
                window_id: window_id.clone(),
            });
        }
        let seal_hash = sealed.seal_hash.clone();
        let event_count = sealed.transcript.inputs.events.len();
        store.put_transcript(sealed)?;
        let mut record = row.record;
        record.status = WindowStatus::Sealed;
        record.seal_hash = Some(seal_hash.clone());
        record.writer_lease = None;
        store.update_window(record, row.revision)?;
        store.append_ops(
            now.mono,
            window_id.clone(),
            OpsAction::WindowSealed,
            seal_hash.to_string(),
        );
        info!(window_id = %window_id, seal_hash = %seal_hash, events = event_count, "window sealed");
        Ok(SealOutcome {
            window_id: window_id.clone(),
            seal_hash,
            already_sealed: false,
        })
    }

    fn mark_invalid(
        &self,
        window_id: &WindowId,
        revision: u64,
        err: &SealError,
        now: Now,
    ) -> SettleError {
        let failure = SettleError::invariant(window_id, err);
        error!(
            window_id = %window_id,
            code = failure.code(),
            detail = %err,
            "invariant violated; marking window INVALID"
        );
        let mut store = self.store();
        store.raise_alert(now.mono, window_id.clone(), failure.code(), err.to_string());
        if let Some(row) = store.window_row(window_id).cloned() {
            if row.revision == revision {
                let mut record = row.record;
                record.status = WindowStatus::Invalid;
                record.invalid_reason = Some(failure.code().to_string());
                record.writer_lease = None;
                match store.update_window(record, row.revision) {
                    Ok(_) => {
                        store.append_ops(
                            now.mono,
                            window_id.clone(),
                            OpsAction::WindowInvalidated,
                            failure.code(),
                        );
                    }
                    Err(e) => {
                        error!(window_id = %window_id, error = %e, "could not mark window INVALID");
                    }
                }
            }
        }
        failure
    }

    pub fn transcript(&self, window_id: &WindowId) -> Result<TranscriptView, SettleError> {
        let sealed = {
            let store = self.store();
            let row = load_window(&store, window_id)?;
            let seal_hash = sealed_hash(&row.record, "read transcript")?;
            stored_transcript(&store, &seal_hash)?
        };
        let digest = transcript_digest(&sealed.transcript)
            .map_err(|e| SettleError::invariant(window_id, &e))?;
        Ok(TranscriptView { sealed, digest })
    }

    // ---- acceptance ----

    /// Adds proofs to the bundle of the window's current seal and
    /// re-evaluates it.
    pub fn submit_proofs(
        &self,
        window_id: &WindowId,
        proofs: Vec<Attestation>,
        now: Now,
    ) -> Result<AcceptanceBundle, SettleError> {
        let mut store = self.store();
        let row = load_window(&store, window_id)?;
        let seal_hash = sealed_hash(&row.record, "submit proofs")?;
        let policy = stored_transcript(&store, &seal_hash)?
            .transcript
            .inputs
            .policy;
        let held = store
            .proof_bundle(&seal_hash)
            .map(|b| b.proofs.len())
            .unwrap_or(0);
        if held.saturating_add(proofs.len()) > self.config.acceptance.max_proofs_per_bundle {
            return Err(SettleError::InputRejected {
                code: "TOO_MANY_PROOFS",
                message: format!(
                    "bundle holds {held}, limit is {}",
                    self.config.acceptance.max_proofs_per_bundle
                ),
            });
        }
        let submitted = proofs.len();
        let bundle = store
            .append_proofs(&seal_hash, policy.quorum, policy.freshness_s, proofs)?
            .clone();
        let outcome =
            self.acceptance
                .evaluate(&seal_hash, &policy, &bundle.proofs, now.wall, &self.registry);
        store.record_bundle_evaluation(
            &seal_hash,
            outcome.verdicts,
            outcome.decision == Decision::Allow,
            outcome.reason_code,
        )?;
        store.append_ops(
            now.mono,
            window_id.clone(),
            OpsAction::ProofsSubmitted,
            format!("submitted={submitted} valid={}", outcome.valid_proof_count),
        );
        info!(
            window_id = %window_id,
            submitted,
            valid = outcome.valid_proof_count,
            "proofs recorded"
        );
        store
            .proof_bundle(&seal_hash)
            .cloned()
            .ok_or_else(|| not_found("proof bundle", &seal_hash))
    }

    /// Binds ALLOW or HOLD to the window's current seal. ALLOW is final for
    /// that seal; HOLD may be re-evaluated as proofs arrive.
    pub fn authorize(
        &self,
        window_id: &WindowId,
        now: Now,
    ) -> Result<AcceptanceRecord, SettleError> {
        let (row, sealed, proofs) = {
            let store = self.store();
            let row = load_window(&store, window_id)?;
            let seal_hash = sealed_hash(&row.record, "authorize")?;
            if let Some(existing) = store.acceptance_for(&seal_hash) {
                if existing.decision == Decision::Allow {
                    return Ok(existing.clone());
                }
            }
            let sealed = stored_transcript(&store, &seal_hash)?;
            let proofs = store
                .proof_bundle(&seal_hash)
                .map(|b| b.proofs.clone())
                .unwrap_or_default();
            (row, sealed, proofs)
        };

        let seal_hash = sealed.seal_hash.clone();
        let outcome = self.acceptance.evaluate(
            &seal_hash,
            &sealed.transcript.inputs.policy,
            &proofs,
            now.wall,
            &self.registry,
        );
        let record = AcceptanceRecord::v1(
            outcome.acceptance_id(&seal_hash)?,
            window_id.clone(),
            seal_hash.clone(),
            outcome.decision,
            outcome.reason_code,
            outcome.quorum,
            outcome.freshness_s,
            outcome.valid_proof_count,
            outcome.bundle_digest.clone(),
            now.wall,
        )?;

        let mut store = self.store();
        let current = load_window(&store, window_id)?;
        let held_now = store
            .proof_bundle(&seal_hash)
            .map(|b| b.proofs.len())
            .unwrap_or(0);
        if current.revision != row.revision || held_now != proofs.len() {
            warn!(window_id = %window_id, "window or bundle changed during authorization");
            return Err(SettleError::StaleCommit {
                window_id: window_id.clone(),
            });
        }
        store.put_acceptance(record.clone())?;
        if store.proof_bundle(&seal_hash).is_some() {
            store.record_bundle_evaluation(
                &seal_hash,
                outcome.verdicts,
                outcome.decision == Decision::Allow,
                outcome.reason_code,
            )?;
        }
        if record.decision == Decision::Allow {
            let mut accepted = current.record;
            accepted.status = WindowStatus::Accepted;
            store.update_window(accepted, current.revision)?;
        }
        let reason = record.reason_code.map(|r| r.as_str()).unwrap_or("-");
        store.append_ops(
            now.mono,
            window_id.clone(),
            OpsAction::AcceptanceEvaluated,
            format!("decision={} reason={reason}", record.decision.as_str()),
        );
        match record.decision {
            Decision::Allow => info!(
                window_id = %window_id,
                acceptance_id = %record.acceptance_id,
                valid = record.valid_proof_count,
                "window accepted"
            ),
            Decision::Hold => warn!(
                window_id = %window_id,
                reason,
                valid = record.valid_proof_count,
                "window held"
            ),
        }
        Ok(record)
    }

    // ---- export / audit ----

    pub fn export(&self, window_id: &WindowId, now: Now) -> Result<ExportManifest, SettleError> {
        let mut store = self.store();
        let row = load_window(&store, window_id)?;
        let seal_hash = sealed_hash(&row.record, "export")?;
        match row.record.status {
            WindowStatus::Exported => {
                return store
                    .manifest_for(&seal_hash)
                    .cloned()
                    .ok_or_else(|| not_found("manifest", &seal_hash));
            }
            WindowStatus::Accepted => {}
            _ => return Err(invalid_state(&row.record, "export")),
        }
        let sealed = stored_transcript(&store, &seal_hash)?;
        let acceptance = store
            .acceptance_for(&seal_hash)
            .cloned()
            .ok_or_else(|| not_found("acceptance", &seal_hash))?;
        let bundle = self
            .export
            .materialize(&sealed, &acceptance)
            .map_err(|e| export_failure(&row.record, e))?;
        let files = bundle
            .files
            .into_iter()
            .map(|f| (f.name, f.bytes))
            .collect::<Vec<_>>();
        store.put_export(bundle.manifest.clone(), files)?;
        let mut record = row.record;
        record.status = WindowStatus::Exported;
        store.update_window(record, row.revision)?;
        store.append_ops(
            now.mono,
            window_id.clone(),
            OpsAction::WindowExported,
            bundle.manifest.manifest_hash.clone(),
        );
        info!(
            window_id = %window_id,
            manifest_hash = %bundle.manifest.manifest_hash,
            files = bundle.manifest.files.len(),
            "window exported"
        );
        Ok(bundle.manifest)
    }

    pub fn artifacts(&self, window_id: &WindowId) -> Result<BTreeMap<String, Vec<u8>>, SettleError> {
        let store = self.store();
        let row = load_window(&store, window_id)?;
        let seal_hash = sealed_hash(&row.record, "read artifacts")?;
        Ok(store.artifacts_for(&seal_hash))
    }

    /// Replays the window from its frozen inputs. Exported windows are also
    /// checked against their manifest and stored artifacts.
    pub fn replay(&self, window_id: &WindowId, now: Now) -> Result<AuditReport, SettleError> {
        self.run_audit(window_id, None, now)
    }

    /// Audits artifact bytes as a recipient received them.
    pub fn audit_delivered(
        &self,
        window_id: &WindowId,
        delivered: BTreeMap<String, Vec<u8>>,
        now: Now,
    ) -> Result<AuditReport, SettleError> {
        self.run_audit(window_id, Some(delivered), now)
    }

    fn run_audit(
        &self,
        window_id: &WindowId,
        delivered: Option<BTreeMap<String, Vec<u8>>>,
        now: Now,
    ) -> Result<AuditReport, SettleError> {
        let (record, sealed, acceptance, manifest, stored) = {
            let store = self.store();
            let row = load_window(&store, window_id)?;
            let seal_hash = sealed_hash(&row.record, "replay")?;
            let sealed = stored_transcript(&store, &seal_hash)?;
            (
                row.record,
                sealed,
                store.acceptance_for(&seal_hash).cloned(),
                store.manifest_for(&seal_hash).cloned(),
                store.artifacts_for(&seal_hash),
            )
        };
        let report = match (&acceptance, &manifest) {
            (Some(acceptance), Some(manifest)) => {
                let delivered = delivered.unwrap_or(stored);
                self.audit.audit(AuditInputs {
                    sealed: &sealed,
                    acceptance,
                    manifest,
                    delivered: &delivered,
                })
            }
            _ if delivered.is_some() => return Err(invalid_state(&record, "audit delivery")),
            _ => replay_only(&sealed),
        };

        let mut store = self.store();
        store.append_audit_report(report.clone());
        store.append_ops(
            now.mono,
            window_id.clone(),
            OpsAction::AuditCompleted,
            format!("ok={}", report.ok),
        );
        if report.ok {
            info!(window_id = %window_id, seal_hash = %report.seal_hash, "audit passed");
            return Ok(report);
        }
        let codes = report
            .diffs
            .iter()
            .map(AuditDiff::code)
            .collect::<Vec<_>>()
            .join(",");
        error!(window_id = %window_id, diffs = %codes, "audit mismatch");
        store.raise_alert(now.mono, window_id.clone(), "AUDIT_MISMATCH", codes);
        Err(SettleError::AuditMismatch {
            window_id: window_id.clone(),
            report: Box::new(report),
        })
    }

    // ---- correction ----

    /// Replaces a window with `version + 1` over the same buffered events,
    /// optionally under a corrected policy. The new version starts CLOSED.
    pub fn supersede(
        &self,
        window_id: &WindowId,
        policy: Option<PolicyManifest>,
        now: Now,
    ) -> Result<WindowRecord, SettleError> {
        let mut store = self.store();
        let row = load_window(&store, window_id)?;
        match row.record.status {
            WindowStatus::Superseded => {
                return row
                    .record
                    .superseded_by
                    .as_ref()
                    .and_then(|id| store.window(id))
                    .cloned()
                    .ok_or_else(|| not_found("superseding window", window_id));
            }
            WindowStatus::Open => return Err(invalid_state(&row.record, "supersede")),
            _ => {}
        }
        let successor = WindowSlot::of(&row.record.key.successor());
        if store
            .latest_version(&successor)
            .map(|w| w.status.is_sealed())
            .unwrap_or(false)
        {
            return Err(SettleError::SuccessorSealed {
                window_id: window_id.clone(),
            });
        }
        if let Some(policy) = &policy {
            policy.validate()?;
        }

        let mut next = row.record.clone();
        next.key = row.record.key.next_version();
        next.window_id = next.key.window_id();
        next.status = WindowStatus::Closed;
        next.writer_lease = None;
        next.seal_hash = None;
        next.invalid_reason = None;
        next.superseded_by = None;
        if let Some(policy) = policy {
            next.policy = policy;
        }
        next.validate()?;

        let mut old = row.record;
        old.status = WindowStatus::Superseded;
        old.superseded_by = Some(next.window_id.clone());
        old.writer_lease = None;

        store.insert_window(next.clone())?;
        store.update_window(old, row.revision)?;
        store.append_ops(
            now.mono,
            window_id.clone(),
            OpsAction::WindowSuperseded,
            format!("superseded_by={}", next.window_id),
        );
        store.append_ops(
            now.mono,
            next.window_id.clone(),
            OpsAction::WindowOpened,
            format!("version={} status=CLOSED", next.key.version),
        );
        info!(
            window_id = %window_id,
            superseded_by = %next.window_id,
            policy_version = next.policy.policy_version.0,
            "window superseded"
        );
        Ok(next)
    }
}

fn load_window(store: &SettleStore, window_id: &WindowId) -> Result<WindowRow, SettleError> {
    store
        .window_row(window_id)
        .cloned()
        .ok_or_else(|| not_found("window", window_id))
}

fn stored_transcript(
    store: &SettleStore,
    seal_hash: &SealHash,
) -> Result<SealedTranscript, SettleError> {
    store
        .transcript(seal_hash)
        .cloned()
        .ok_or_else(|| not_found("transcript", seal_hash))
}

fn not_found(what: &'static str, id: impl ToString) -> SettleError {
    SettleError::NotFound {
        what,
        id: id.to_string(),
    }
}

fn invalid_state(window: &WindowRecord, operation: &'static str) -> SettleError {
    SettleError::InvalidState {
        window_id: window.window_id.clone(),
        status: window.status.as_str(),
        operation,
    }
}

fn sealed_hash(window: &WindowRecord, operation: &'static str) -> Result<SealHash, SettleError> {
    match (&window.seal_hash, window.status.is_sealed()) {
        (Some(seal_hash), true) => Ok(seal_hash.clone()),
        _ => Err(invalid_state(window, operation)),
    }
}

/// A live lease admits only its holder.
fn check_writer(
    window: &WindowRecord,
    writer: Option<&WriterCredentials>,
    now: MonotonicTimeNs,
) -> Result<(), SettleError> {
    let Some(lease) = window.live_lease(now) else {
        return Ok(());
    };
    match writer {
        Some(w) if holds_lease(lease, &w.writer_id, &w.lease_token) => Ok(()),
        _ => Err(SettleError::LeaseHeldByOther {
            window_id: window.window_id.clone(),
            held_by: Some(lease.writer_id.clone()),
            held_until: Some(lease.expires_at),
        }),
    }
}

/// Inputs for sealing `window`: its slot's buffered events plus carry from
/// the latest sealed version of the previous cycle.
fn frozen_inputs(
    store: &SettleStore,
    window: &WindowRecord,
) -> Result<TranscriptInputs, SettleError> {
    let (carry_in, pool_carry_in_minor, carry_source) =
        match window.key.predecessor_seq().filter(|seq| *seq > 0) {
            None => (Vec::new(), 0, None),
            Some(seq) => {
                let slot = WindowSlot {
                    tenant_id: window.key.tenant_id.clone(),
                    partition_id: window.key.partition_id.clone(),
                    window_seq: seq,
                };
                let predecessor = store
                    .latest_version(&slot)
                    .ok_or_else(|| not_found("predecessor window", seq))?;
                let sealed = predecessor
                    .seal_hash
                    .as_ref()
                    .filter(|_| predecessor.status.is_sealed())
                    .and_then(|seal_hash| store.transcript(seal_hash));
                let Some(sealed) = sealed else {
                    return Err(SettleError::PredecessorNotSealed {
                        window_id: window.window_id.clone(),
                        predecessor: predecessor.window_id.clone(),
                    });
                };
                (
                    carry_forward(&sealed.transcript.outputs.allocations),
                    sealed.transcript.outputs.totals.pool_carry_out_minor,
                    Some(sealed.seal_hash.clone()),
                )
            }
        };
    Ok(TranscriptInputs {
        key: window.key.clone(),
        opens_at: window.opens_at,
        watermark: window.watermark,
        policy: window.policy.clone(),
        fold: window.fold.clone(),
        carry_in,
        pool_carry_in_minor,
        carry_source,
        events: store.slot_events(&WindowSlot::of(&window.key)),
    })
}

fn replay_only(sealed: &SealedTranscript) -> AuditReport {
    let mut diffs = Vec::new();
    match transcript_digest(&sealed.transcript) {
        Ok(digest) if digest != sealed.seal_hash => diffs.push(AuditDiff::TranscriptDigestMismatch {
            seal_hash: sealed.seal_hash.to_string(),
            stored_digest: digest.to_string(),
        }),
        Ok(_) => {}
        Err(e) => diffs.push(AuditDiff::ReplayFailed {
            detail: e.to_string(),
        }),
    }
    let replayed = match replay_digest(&sealed.transcript) {
        Ok(digest) => {
            if digest != sealed.seal_hash {
                diffs.push(AuditDiff::ReplayDigestMismatch {
                    seal_hash: sealed.seal_hash.to_string(),
                    replay_digest: digest.to_string(),
                });
            }
            Some(digest)
        }
        Err(e) => {
            diffs.push(AuditDiff::ReplayFailed {
                detail: e.to_string(),
            });
            None
        }
    };
    AuditReport::from_diffs(
        sealed.window_id.clone(),
        sealed.seal_hash.clone(),
        diffs,
        replayed,
    )
}

fn intake_refusal(refuse: IntakeRefuse) -> SettleError {
    let code = match refuse.reason_code {
        intake_codes::INTAKE_PARTITION_MISMATCH => {
            return SettleError::PartitionMismatch {
                message: refuse.message,
            }
        }
        intake_codes::INTAKE_UNKNOWN_KIND => "UNKNOWN_KIND",
        intake_codes::INTAKE_AMOUNT_SIGN_INVALID => "AMOUNT_SIGN_INVALID",
        intake_codes::INTAKE_TENANT_MISMATCH => "TENANT_MISMATCH",
        _ => "SCHEMA_INVALID",
    };
    SettleError::InputRejected {
        code,
        message: refuse.message,
    }
}

fn export_failure(window: &WindowRecord, err: ExportError) -> SettleError {
    match err {
        ExportError::NotAccepted => invalid_state(window, "export"),
        ExportError::SealMismatch { .. } => SettleError::Invariant {
            window_id: window.window_id.clone(),
            code: "ACCEPTANCE_SEAL_MISMATCH",
            detail: err.to_string(),
        },
        ExportError::Encoding(_) | ExportError::Contract(_) => SettleError::Invariant {
            window_id: window.window_id.clone(),
            code: "EXPORT_ENCODING",
            detail: err.to_string(),
        },
    }
}

fn lease_grant(
    window_id: &WindowId,
    lease: Option<WriterLease>,
    takeover: bool,
) -> Result<LeaseGrant, SettleError> {
    let lease = lease.ok_or_else(|| SettleError::LeaseNotFound {
        window_id: window_id.clone(),
    })?;
    Ok(LeaseGrant {
        window_id: window_id.clone(),
        writer_id: lease.writer_id,
        lease_token: lease.lease_token,
        expires_at: lease.expires_at,
        takeover,
    })
}

fn lease_operation_name(operation: LeaseOperation) -> &'static str {
    match operation {
        LeaseOperation::Claim => "claim",
        LeaseOperation::Renew => "renew",
        LeaseOperation::Release => "release",
    }
}
