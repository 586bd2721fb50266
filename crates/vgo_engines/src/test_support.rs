#![forbid(unsafe_code)]

use vgo_kernel_contracts::acceptance::{AcceptanceReason, AcceptanceRecord};
use vgo_kernel_contracts::allocation::Decision;
use vgo_kernel_contracts::event::{EventKind, EventRecord, RawEvent};
use vgo_kernel_contracts::fold::FoldDescriptor;
use vgo_kernel_contracts::ids::{EventId, PartitionId, PrincipalId, TenantId};
use vgo_kernel_contracts::policy::{AcceptancePreset, PolicyManifest, PolicyVersion};
use vgo_kernel_contracts::transcript::{SealedTranscript, TranscriptInputs};
use vgo_kernel_contracts::window::{WindowKey, WindowRecord};
use vgo_kernel_contracts::{LogicalTime, UnixSeconds};

use crate::accept::AcceptanceOutcome;
use crate::intake::ShardFunction;

pub const BUCKET_WIDTH: u64 = 10;

pub fn tenant() -> TenantId {
    TenantId::new("tenant_a").unwrap()
}

pub fn partition() -> PartitionId {
    PartitionId::new("p0000").unwrap()
}

pub fn policy_normal() -> PolicyManifest {
    PolicyManifest::from_preset(PolicyVersion(1), AcceptancePreset::Normal).unwrap()
}

pub fn record_kind(
    event_id: &str,
    principal: &str,
    kind: EventKind,
    amount_minor: i64,
    occurred_at: u64,
) -> EventRecord {
    EventRecord::v1(
        EventId::new(event_id).unwrap(),
        tenant(),
        PrincipalId::new(principal).unwrap(),
        kind,
        amount_minor,
        LogicalTime(occurred_at),
        partition(),
        occurred_at / BUCKET_WIDTH,
    )
    .unwrap()
}

pub fn record(event_id: &str, principal: &str, amount_minor: i64, occurred_at: u64) -> EventRecord {
    record_kind(
        event_id,
        principal,
        EventKind::BaseEarning,
        amount_minor,
        occurred_at,
    )
}

/// Window `p0000` seq 1 covering `[0, 1000)`.
pub fn inputs_with(policy: PolicyManifest, mut events: Vec<EventRecord>) -> TranscriptInputs {
    events.sort_by(|a, b| a.event_id.cmp(&b.event_id));
    TranscriptInputs {
        key: WindowKey::v1(tenant(), partition(), 1, 1).unwrap(),
        opens_at: LogicalTime(0),
        watermark: LogicalTime(1_000),
        policy,
        fold: FoldDescriptor::canonical_v1(BUCKET_WIDTH).unwrap(),
        carry_in: Vec::new(),
        pool_carry_in_minor: 0,
        carry_source: None,
        events,
    }
}

pub fn raw_event(
    event_id: &str,
    principal: &str,
    kind: &str,
    amount_minor: i64,
    occurred_at: u64,
) -> RawEvent {
    RawEvent {
        event_id: event_id.to_string(),
        tenant_id: tenant().as_str().to_string(),
        principal_id: principal.to_string(),
        kind: kind.to_string(),
        amount_minor,
        occurred_at,
    }
}

/// Open window on whichever partition `principal` shards to.
pub fn open_window_for(shard: &ShardFunction, principal: &str, opens_at: u64) -> WindowRecord {
    let partition_id = shard
        .partition_for(&PrincipalId::new(principal).unwrap())
        .unwrap();
    WindowRecord::open_v1(
        WindowKey::v1(tenant(), partition_id, 1, 1).unwrap(),
        LogicalTime(opens_at),
        policy_normal(),
        FoldDescriptor::canonical_v1(BUCKET_WIDTH).unwrap(),
    )
    .unwrap()
}

/// Acceptance row for `sealed` without running signature checks.
pub fn accepted(sealed: &SealedTranscript, decision: Decision) -> AcceptanceRecord {
    let reason = match decision {
        Decision::Allow => None,
        Decision::Hold => Some(AcceptanceReason::InsufficientQuorum),
    };
    let outcome = AcceptanceOutcome {
        decision,
        reason_code: reason,
        verdicts: Vec::new(),
        valid_proof_count: 2,
        bundle_digest: "00".repeat(32),
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
        UnixSeconds(1_700_000_000),
    )
    .unwrap()
}
