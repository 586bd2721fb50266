#![forbid(unsafe_code)]

use std::env;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use vgo_engines::accept::InMemoryKeyRegistry;
use vgo_kernel_contracts::acceptance::{Attestation, ProofVerdict};
use vgo_kernel_contracts::audit::AuditDiff;
use vgo_kernel_contracts::event::RawEvent;
use vgo_kernel_contracts::export::ExportManifest;
use vgo_kernel_contracts::ids::{PartitionId, ProofKind, SealHash, SignerId, TenantId, WindowId, WriterId};
use vgo_kernel_contracts::policy::{AcceptancePreset, PolicyManifest, PolicyVersion};
use vgo_kernel_contracts::window::WindowRecord;
use vgo_kernel_contracts::{LogicalTime, MonotonicTimeNs, UnixSeconds};
use vgo_os::config::EngineConfig;
use vgo_os::error::{ErrorClass, SettleError};
use vgo_os::settlement::{
    IngestRequest, LeaseGrant, Now, OpenWindowRequest, SealOutcome, SettlementService,
    TranscriptView, WriterCredentials,
};

pub const ENV_HTTP_BIND: &str = "VGO_HTTP_BIND";
pub const ENV_TRUSTED_SIGNERS: &str = "VGO_TRUSTED_SIGNERS";
pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_LEASE_TTL_MS: u32 = 30_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenWindowAdapterRequest {
    pub tenant_id: String,
    pub partition_id: String,
    pub opens_at: u64,
    pub bucket_width_ticks: u64,
    /// `strict`, `normal` or `lenient`; ignored when `policy` is present.
    pub preset: Option<String>,
    pub policy_version: Option<u32>,
    pub policy: Option<PolicyManifest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestAdapterRequest {
    pub idempotency_key: String,
    #[serde(flatten)]
    pub event: RawEvent,
    pub window_id: Option<String>,
    pub writer_id: Option<String>,
    pub lease_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestAdapterResponse {
    pub accepted: bool,
    pub replayed: bool,
    pub event_id: String,
    pub window_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseAdapterRequest {
    pub writer_id: String,
    pub lease_token: Option<String>,
    pub ttl_ms: Option<u32>,
}

/// Body of close and watermark calls. Writer fields are required only while
/// a lease is live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterAdapterRequest {
    pub watermark: Option<u64>,
    pub writer_id: Option<String>,
    pub lease_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofAdapterItem {
    pub kind: String,
    pub signer_id: String,
    pub issued_at: u64,
    pub signature_b64: String,
    pub seal_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofsAdapterRequest {
    pub proofs: Vec<ProofAdapterItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleAdapterResponse {
    pub seal_hash: String,
    pub verified: bool,
    pub reason_code: Option<String>,
    pub proof_count: usize,
    pub verdicts: Vec<ProofVerdict>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeAdapterResponse {
    pub decision: String,
    pub reason_code: Option<String>,
    pub acceptance_id: String,
    pub seal_hash: String,
    pub valid_proof_count: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayAdapterResponse {
    pub ok: bool,
    pub diffs: Vec<AuditDiff>,
    pub replay_digest: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupersedeAdapterRequest {
    pub preset: Option<String>,
    pub policy_version: Option<u32>,
    pub policy: Option<PolicyManifest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResponse {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterHealthResponse {
    pub status: String,
    pub outcome: String,
    pub partition_count: u32,
    pub trusted_signers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterErrorResponse {
    pub status: String,
    pub code: String,
    pub class: String,
    pub retriable: bool,
    pub message: String,
    pub next_window: Option<String>,
    pub held_by: Option<String>,
    /// Populated for audit mismatches.
    pub diffs: Vec<AuditDiff>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterFailure {
    pub http_status: u16,
    pub body: AdapterErrorResponse,
}

impl AdapterFailure {
    fn bad_request(code: &str, message: impl Into<String>) -> Self {
        Self {
            http_status: 400,
            body: AdapterErrorResponse {
                status: "error".to_string(),
                code: code.to_string(),
                class: ErrorClass::Input.as_str().to_string(),
                retriable: false,
                message: message.into(),
                next_window: None,
                held_by: None,
                diffs: Vec::new(),
            },
        }
    }
}

impl From<SettleError> for AdapterFailure {
    fn from(err: SettleError) -> Self {
        let next_window = match &err {
            SettleError::WindowClosed { next_window, .. } => {
                next_window.as_ref().map(|w| w.to_string())
            }
            _ => None,
        };
        let held_by = match &err {
            SettleError::WindowBusy { held_by, .. } => Some(held_by.to_string()),
            SettleError::LeaseHeldByOther { held_by, .. } => held_by.as_ref().map(|w| w.to_string()),
            _ => None,
        };
        let diffs = match &err {
            SettleError::AuditMismatch { report, .. } => report.diffs.clone(),
            _ => Vec::new(),
        };
        Self {
            http_status: http_status(&err),
            body: AdapterErrorResponse {
                status: "error".to_string(),
                code: err.code().to_string(),
                class: err.class().as_str().to_string(),
                retriable: err.is_retriable(),
                message: err.to_string(),
                next_window,
                held_by,
                diffs,
            },
        }
    }
}

/// Input errors map to 400/404/409, concurrency errors to 409/423, and
/// invariant or audit failures to 500.
pub fn http_status(err: &SettleError) -> u16 {
    match err.class() {
        ErrorClass::Input => match err {
            SettleError::NotFound { .. } => 404,
            SettleError::IdempotencyKeyReused { .. }
            | SettleError::DuplicateEventId { .. }
            | SettleError::WindowExists { .. }
            | SettleError::SuccessorSealed { .. }
            | SettleError::InvalidState { .. } => 409,
            _ => 400,
        },
        ErrorClass::Concurrency => match err {
            SettleError::WindowBusy { .. } | SettleError::LeaseHeldByOther { .. } => 423,
            _ => 409,
        },
        ErrorClass::Invariant | ErrorClass::Audit => 500,
    }
}

pub struct AdapterRuntime {
    service: SettlementService<InMemoryKeyRegistry>,
    epoch: Instant,
}

impl AdapterRuntime {
    pub fn new(config: EngineConfig, registry: InMemoryKeyRegistry) -> Self {
        Self {
            service: SettlementService::new(config, registry),
            epoch: Instant::now(),
        }
    }

    pub fn default_from_env() -> Result<Self, String> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = EngineConfig::from_lookup(&lookup).map_err(|e| e.to_string())?;
        let registry = match lookup(ENV_TRUSTED_SIGNERS) {
            Some(raw) => InMemoryKeyRegistry::from_pairs(&raw)
                .map_err(|e| format!("{ENV_TRUSTED_SIGNERS}: {e}"))?,
            None => InMemoryKeyRegistry::new(),
        };
        Ok(Self::new(config, registry))
    }

    pub fn service(&self) -> &SettlementService<InMemoryKeyRegistry> {
        &self.service
    }

    /// Lease clock from the process-local monotonic epoch, freshness clock
    /// from the system wall clock.
    pub fn clock_now(&self) -> Now {
        let mono = u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX);
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Now {
            mono: MonotonicTimeNs(mono.max(1)),
            wall: UnixSeconds(wall),
        }
    }

    pub fn health_report(&self) -> AdapterHealthResponse {
        AdapterHealthResponse {
            status: "ok".to_string(),
            outcome: "HEALTHY".to_string(),
            partition_count: self.service.config().intake.partition_count,
            trusted_signers: self.service.registry().signer_ids().count(),
        }
    }

    pub fn open_window(
        &self,
        req: OpenWindowAdapterRequest,
        now: Now,
    ) -> Result<WindowRecord, AdapterFailure> {
        let policy = match requested_policy(req.preset.as_deref(), req.policy_version, req.policy)? {
            Some(policy) => policy,
            None => preset_policy(AcceptancePreset::Normal, req.policy_version)?,
        };
        let request = OpenWindowRequest {
            tenant_id: TenantId::new(req.tenant_id).map_err(SettleError::from)?,
            partition_id: PartitionId::new(req.partition_id).map_err(SettleError::from)?,
            opens_at: LogicalTime(req.opens_at),
            bucket_width_ticks: req.bucket_width_ticks,
            policy,
        };
        Ok(self.service.open_window(request, now)?)
    }

    pub fn window(&self, window_id: &str) -> Result<WindowRecord, AdapterFailure> {
        Ok(self.service.window(&parse_window_id(window_id)?)?)
    }

    pub fn ingest(
        &self,
        req: IngestAdapterRequest,
        now: Now,
    ) -> Result<IngestAdapterResponse, AdapterFailure> {
        let window_id = req.window_id.as_deref().map(parse_window_id).transpose()?;
        let writer = credentials(req.writer_id, req.lease_token)?;
        let receipt = self.service.ingest(
            IngestRequest {
                idempotency_key: req.idempotency_key,
                event: req.event,
                window_id,
                writer,
            },
            now,
        )?;
        Ok(IngestAdapterResponse {
            accepted: receipt.accepted,
            replayed: receipt.replayed,
            event_id: receipt.event_id.to_string(),
            window_id: receipt.window_id.to_string(),
        })
    }

    pub fn claim(
        &self,
        window_id: &str,
        req: LeaseAdapterRequest,
        now: Now,
    ) -> Result<LeaseGrant, AdapterFailure> {
        let window_id = parse_window_id(window_id)?;
        let writer_id = WriterId::new(req.writer_id).map_err(SettleError::from)?;
        let ttl_ms = req.ttl_ms.unwrap_or(DEFAULT_LEASE_TTL_MS);
        Ok(self.service.claim(&window_id, &writer_id, ttl_ms, now)?)
    }

    pub fn renew(
        &self,
        window_id: &str,
        req: LeaseAdapterRequest,
        now: Now,
    ) -> Result<LeaseGrant, AdapterFailure> {
        let window_id = parse_window_id(window_id)?;
        let writer_id = WriterId::new(req.writer_id).map_err(SettleError::from)?;
        let ttl_ms = req.ttl_ms.unwrap_or(DEFAULT_LEASE_TTL_MS);
        let token = req.lease_token.unwrap_or_default();
        Ok(self
            .service
            .renew(&window_id, &writer_id, &token, ttl_ms, now)?)
    }

    pub fn release(
        &self,
        window_id: &str,
        req: LeaseAdapterRequest,
        now: Now,
    ) -> Result<AckResponse, AdapterFailure> {
        let window_id = parse_window_id(window_id)?;
        let writer_id = WriterId::new(req.writer_id).map_err(SettleError::from)?;
        let token = req.lease_token.unwrap_or_default();
        self.service.release(&window_id, &writer_id, &token, now)?;
        Ok(AckResponse {
            status: "ok".to_string(),
        })
    }

    pub fn advance_watermark(
        &self,
        window_id: &str,
        req: WriterAdapterRequest,
        now: Now,
    ) -> Result<WindowRecord, AdapterFailure> {
        let window_id = parse_window_id(window_id)?;
        let Some(watermark) = req.watermark else {
            return Err(AdapterFailure::bad_request(
                "SCHEMA_INVALID",
                "watermark is required",
            ));
        };
        let writer = credentials(req.writer_id, req.lease_token)?;
        Ok(self.service.advance_watermark(
            &window_id,
            LogicalTime(watermark),
            writer.as_ref(),
            now,
        )?)
    }

    /// Returns the closed window and its successor.
    pub fn close(
        &self,
        window_id: &str,
        req: WriterAdapterRequest,
        now: Now,
    ) -> Result<[WindowRecord; 2], AdapterFailure> {
        let window_id = parse_window_id(window_id)?;
        let writer = credentials(req.writer_id, req.lease_token)?;
        let outcome = self.service.close(&window_id, writer.as_ref(), now)?;
        Ok([outcome.closed, outcome.next])
    }

    pub fn seal(&self, window_id: &str, now: Now) -> Result<SealOutcome, AdapterFailure> {
        Ok(self.service.seal(&parse_window_id(window_id)?, now)?)
    }

    pub fn submit_proofs(
        &self,
        window_id: &str,
        req: ProofsAdapterRequest,
        now: Now,
    ) -> Result<BundleAdapterResponse, AdapterFailure> {
        let window_id = parse_window_id(window_id)?;
        let proofs = req
            .proofs
            .into_iter()
            .map(attestation_from_wire)
            .collect::<Result<Vec<_>, _>>()?;
        let bundle = self.service.submit_proofs(&window_id, proofs, now)?;
        Ok(BundleAdapterResponse {
            seal_hash: bundle.seal_hash.to_string(),
            verified: bundle.verified,
            reason_code: bundle.reason_code.map(|r| r.as_str().to_string()),
            proof_count: bundle.proofs.len(),
            verdicts: bundle.verdicts,
        })
    }

    pub fn authorize(
        &self,
        window_id: &str,
        now: Now,
    ) -> Result<AuthorizeAdapterResponse, AdapterFailure> {
        let record = self.service.authorize(&parse_window_id(window_id)?, now)?;
        Ok(AuthorizeAdapterResponse {
            decision: record.decision.as_str().to_string(),
            reason_code: record.reason_code.map(|r| r.as_str().to_string()),
            acceptance_id: record.acceptance_id.to_string(),
            seal_hash: record.seal_hash.to_string(),
            valid_proof_count: record.valid_proof_count,
        })
    }

    pub fn transcript(&self, window_id: &str) -> Result<TranscriptView, AdapterFailure> {
        Ok(self.service.transcript(&parse_window_id(window_id)?)?)
    }

    pub fn export(&self, window_id: &str, now: Now) -> Result<ExportManifest, AdapterFailure> {
        Ok(self.service.export(&parse_window_id(window_id)?, now)?)
    }

    /// A failed replay comes back as a 500 whose body carries the diffs.
    pub fn replay(
        &self,
        window_id: &str,
        now: Now,
    ) -> Result<ReplayAdapterResponse, AdapterFailure> {
        let report = self.service.replay(&parse_window_id(window_id)?, now)?;
        Ok(ReplayAdapterResponse {
            ok: report.ok,
            diffs: report.diffs,
            replay_digest: report.replay_digest.map(|d| d.to_string()),
        })
    }

    pub fn supersede(
        &self,
        window_id: &str,
        req: SupersedeAdapterRequest,
        now: Now,
    ) -> Result<WindowRecord, AdapterFailure> {
        let window_id = parse_window_id(window_id)?;
        let policy = requested_policy(req.preset.as_deref(), req.policy_version, req.policy)?;
        Ok(self.service.supersede(&window_id, policy, now)?)
    }
}

fn parse_window_id(raw: &str) -> Result<WindowId, AdapterFailure> {
    WindowId::parse(raw).map_err(|e| AdapterFailure::from(SettleError::from(e)))
}

fn credentials(
    writer_id: Option<String>,
    lease_token: Option<String>,
) -> Result<Option<WriterCredentials>, AdapterFailure> {
    let Some(writer_id) = writer_id else {
        return Ok(None);
    };
    Ok(Some(WriterCredentials {
        writer_id: WriterId::new(writer_id).map_err(SettleError::from)?,
        lease_token: lease_token.unwrap_or_default(),
    }))
}

fn preset_policy(
    preset: AcceptancePreset,
    policy_version: Option<u32>,
) -> Result<PolicyManifest, AdapterFailure> {
    let version = PolicyVersion(policy_version.unwrap_or(1));
    Ok(PolicyManifest::from_preset(version, preset).map_err(SettleError::from)?)
}

/// An explicit manifest wins over a preset name. `None` when neither is given.
fn requested_policy(
    preset: Option<&str>,
    policy_version: Option<u32>,
    policy: Option<PolicyManifest>,
) -> Result<Option<PolicyManifest>, AdapterFailure> {
    if let Some(policy) = policy {
        return Ok(Some(policy));
    }
    match preset {
        None if policy_version.is_none() => Ok(None),
        None => preset_policy(AcceptancePreset::Normal, policy_version).map(Some),
        Some(raw) => {
            let preset = AcceptancePreset::parse(raw).ok_or_else(|| {
                AdapterFailure::bad_request("UNKNOWN_PRESET", format!("unknown preset {raw:?}"))
            })?;
            preset_policy(preset, policy_version).map(Some)
        }
    }
}

fn attestation_from_wire(item: ProofAdapterItem) -> Result<Attestation, AdapterFailure> {
    let signature = BASE64.decode(item.signature_b64.trim()).map_err(|e| {
        AdapterFailure::bad_request("SIGNATURE_ENCODING", format!("signature_b64: {e}"))
    })?;
    let attestation = Attestation::v1(
        ProofKind::new(item.kind).map_err(SettleError::from)?,
        SignerId::new(item.signer_id).map_err(SettleError::from)?,
        UnixSeconds(item.issued_at),
        hex::encode(signature),
        SealHash::from_hex(item.seal_hash).map_err(SettleError::from)?,
    )
    .map_err(SettleError::from)?;
    Ok(attestation)
}
