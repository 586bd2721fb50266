#![forbid(unsafe_code)]

use thiserror::Error;
use vgo_engines::compute::InvariantViolation;
use vgo_engines::seal::SealError;
use vgo_kernel_contracts::audit::AuditReport;
use vgo_kernel_contracts::ids::{WindowId, WriterId};
use vgo_kernel_contracts::{ContractViolation, LogicalTime, MonotonicTimeNs};
use vgo_storage::store::StorageError;

/// Error taxonomy. Input and concurrency errors may be retried with
/// backoff; invariant violations and audit mismatches never are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Input,
    Concurrency,
    Invariant,
    Audit,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Input => "INPUT",
            ErrorClass::Concurrency => "CONCURRENCY",
            ErrorClass::Invariant => "INVARIANT",
            ErrorClass::Audit => "AUDIT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettleError {
    #[error("request rejected ({code}): {message}")]
    InputRejected { code: &'static str, message: String },
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },
    #[error("idempotency key {key} was already used for a different payload")]
    IdempotencyKeyReused { key: String },
    #[error("event {event_id} was already ingested under another key")]
    DuplicateEventId { event_id: String },
    #[error("partition mismatch: {message}")]
    PartitionMismatch { message: String },
    #[error("window {window_id} is {status}; {operation} not allowed")]
    InvalidState {
        window_id: WindowId,
        status: &'static str,
        operation: &'static str,
    },
    #[error("window {window_id} already exists")]
    WindowExists { window_id: WindowId },
    #[error("successor of {window_id} is already sealed")]
    SuccessorSealed { window_id: WindowId },
    #[error("lease ttl {requested_ms}ms outside {min_ms}..={max_ms}")]
    LeaseTtlOutOfBounds {
        requested_ms: u32,
        min_ms: u32,
        max_ms: u32,
    },

    #[error("window {window_id} is closed")]
    WindowClosed {
        window_id: WindowId,
        next_window: Option<WindowId>,
    },
    #[error("window {window_id} has a live lease held by {held_by}")]
    WindowBusy {
        window_id: WindowId,
        held_by: WriterId,
    },
    #[error("lease on {window_id} held by {held_by:?}")]
    LeaseHeldByOther {
        window_id: WindowId,
        held_by: Option<WriterId>,
        held_until: Option<MonotonicTimeNs>,
    },
    #[error("lease token rejected for {window_id}")]
    LeaseTokenInvalid { window_id: WindowId },
    #[error("no lease held on {window_id}")]
    LeaseNotFound { window_id: WindowId },
    #[error("lease on {window_id} expired")]
    LeaseExpired { window_id: WindowId },
    #[error("watermark {requested:?} is behind {current:?}")]
    StaleWatermark {
        current: LogicalTime,
        requested: LogicalTime,
    },
    #[error("window {window_id} changed while it was being computed")]
    StaleCommit { window_id: WindowId },
    #[error("predecessor {predecessor} of {window_id} is not sealed")]
    PredecessorNotSealed {
        window_id: WindowId,
        predecessor: WindowId,
    },

    #[error("invariant violated in {window_id} ({code}): {detail}")]
    Invariant {
        window_id: WindowId,
        code: &'static str,
        detail: String,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("audit of {window_id} failed with {} differences", .report.diffs.len())]
    AuditMismatch {
        window_id: WindowId,
        report: Box<AuditReport>,
    },
}

impl SettleError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SettleError::InputRejected { .. }
            | SettleError::Contract(_)
            | SettleError::NotFound { .. }
            | SettleError::IdempotencyKeyReused { .. }
            | SettleError::DuplicateEventId { .. }
            | SettleError::PartitionMismatch { .. }
            | SettleError::InvalidState { .. }
            | SettleError::WindowExists { .. }
            | SettleError::SuccessorSealed { .. }
            | SettleError::LeaseTtlOutOfBounds { .. } => ErrorClass::Input,
            SettleError::WindowClosed { .. }
            | SettleError::WindowBusy { .. }
            | SettleError::LeaseHeldByOther { .. }
            | SettleError::LeaseTokenInvalid { .. }
            | SettleError::LeaseNotFound { .. }
            | SettleError::LeaseExpired { .. }
            | SettleError::StaleWatermark { .. }
            | SettleError::StaleCommit { .. }
            | SettleError::PredecessorNotSealed { .. } => ErrorClass::Concurrency,
            SettleError::Invariant { .. } | SettleError::Storage(_) => ErrorClass::Invariant,
            SettleError::AuditMismatch { .. } => ErrorClass::Audit,
        }
    }

    /// Concurrency class except `STALE_WATERMARK`.
    pub fn is_retriable(&self) -> bool {
        self.class() == ErrorClass::Concurrency && !matches!(self, SettleError::StaleWatermark { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            SettleError::InputRejected { code, .. } => *code,
            SettleError::Contract(_) => "SCHEMA_INVALID",
            SettleError::NotFound { .. } => "NOT_FOUND",
            SettleError::IdempotencyKeyReused { .. } => "IDEMPOTENCY_KEY_REUSED",
            SettleError::DuplicateEventId { .. } => "DUPLICATE_EVENT_ID",
            SettleError::PartitionMismatch { .. } => "PARTITION_MISMATCH",
            SettleError::InvalidState { .. } => "INVALID_WINDOW_STATE",
            SettleError::WindowExists { .. } => "WINDOW_EXISTS",
            SettleError::SuccessorSealed { .. } => "SUCCESSOR_SEALED",
            SettleError::LeaseTtlOutOfBounds { .. } => "LEASE_TTL_OUT_OF_BOUNDS",
            SettleError::WindowClosed { .. } => "WINDOW_CLOSED",
            SettleError::WindowBusy { .. } => "WINDOW_BUSY",
            SettleError::LeaseHeldByOther { .. } => "LEASE_HELD_BY_OTHER",
            SettleError::LeaseTokenInvalid { .. } => "LEASE_TOKEN_INVALID",
            SettleError::LeaseNotFound { .. } => "LEASE_NOT_FOUND",
            SettleError::LeaseExpired { .. } => "LEASE_EXPIRED",
            SettleError::StaleWatermark { .. } => "STALE_WATERMARK",
            SettleError::StaleCommit { .. } => "STALE_COMMIT",
            SettleError::PredecessorNotSealed { .. } => "PREDECESSOR_NOT_SEALED",
            SettleError::Invariant { code, .. } => *code,
            SettleError::Storage(_) => "STORAGE_INTEGRITY",
            SettleError::AuditMismatch { .. } => "AUDIT_MISMATCH",
        }
    }

    pub(crate) fn invariant(window_id: &WindowId, err: &SealError) -> Self {
        let code = match err {
            SealError::Invariant(v) => invariant_code(v),
            SealError::Contract(_) => "TRANSCRIPT_CONTRACT",
            SealError::Encoding(_) => "TRANSCRIPT_ENCODING",
        };
        SettleError::Invariant {
            window_id: window_id.clone(),
            code,
            detail: err.to_string(),
        }
    }
}

pub fn invariant_code(v: &InvariantViolation) -> &'static str {
    match v {
        InvariantViolation::InputContract(_) => "INPUT_CONTRACT",
        InvariantViolation::AccumulatorOverflow { .. } => "ACCUMULATOR_OVERFLOW",
        InvariantViolation::AmountOutOfRange { .. } => "AMOUNT_OUT_OF_RANGE",
        InvariantViolation::ConservationBroken { .. } => "CONSERVATION_BROKEN",
        InvariantViolation::OutputContract(_) => "OUTPUT_CONTRACT",
    }
}
