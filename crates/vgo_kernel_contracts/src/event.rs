#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::ids::{EventId, IdempotencyKey, PartitionId, PrincipalId, TenantId, WindowId};
use crate::{ContractViolation, LogicalTime, SchemaVersion, Validate};

pub const EVENT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    BaseEarning,
    Refund,
    Adjustment,
    Bonus,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::BaseEarning => "BASE_EARNING",
            EventKind::Refund => "REFUND",
            EventKind::Adjustment => "ADJUSTMENT",
            EventKind::Bonus => "BONUS",
        }
    }

    pub fn parse(v: &str) -> Option<Self> {
        match v {
            "BASE_EARNING" => Some(EventKind::BaseEarning),
            "REFUND" => Some(EventKind::Refund),
            "ADJUSTMENT" => Some(EventKind::Adjustment),
            "BONUS" => Some(EventKind::Bonus),
            _ => None,
        }
    }

    /// Sign rule every amount of this kind must satisfy.
    pub fn amount_allowed(self, amount_minor: i64) -> bool {
        match self {
            EventKind::BaseEarning | EventKind::Bonus => amount_minor > 0,
            EventKind::Refund => amount_minor < 0,
            EventKind::Adjustment => amount_minor != 0,
        }
    }
}

/// Event as submitted at the boundary, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub event_id: String,
    pub tenant_id: String,
    pub principal_id: String,
    pub kind: String,
    pub amount_minor: i64,
    pub occurred_at: u64,
}

/// Canonical, immutable event. Created by intake and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub schema_version: SchemaVersion,
    pub event_id: EventId,
    pub tenant_id: TenantId,
    pub principal_id: PrincipalId,
    pub kind: EventKind,
    pub amount_minor: i64,
    pub occurred_at: LogicalTime,
    pub partition_id: PartitionId,
    pub bucket_id: u64,
}

impl EventRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        event_id: EventId,
        tenant_id: TenantId,
        principal_id: PrincipalId,
        kind: EventKind,
        amount_minor: i64,
        occurred_at: LogicalTime,
        partition_id: PartitionId,
        bucket_id: u64,
    ) -> Result<Self, ContractViolation> {
        let record = Self {
            schema_version: EVENT_CONTRACT_VERSION,
            event_id,
            tenant_id,
            principal_id,
            kind,
            amount_minor,
            occurred_at,
            partition_id,
            bucket_id,
        };
        record.validate()?;
        Ok(record)
    }
}

impl Validate for EventRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != EVENT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "event_record.schema_version",
                reason: "must match EVENT_CONTRACT_VERSION",
            });
        }
        self.event_id.validate()?;
        self.tenant_id.validate()?;
        self.principal_id.validate()?;
        self.partition_id.validate()?;
        if !self.kind.amount_allowed(self.amount_minor) {
            return Err(ContractViolation::InvalidValue {
                field: "event_record.amount_minor",
                reason: "sign does not match event kind",
            });
        }
        if self.amount_minor == i64::MIN {
            return Err(ContractViolation::InvalidValue {
                field: "event_record.amount_minor",
                reason: "must not be i64::MIN",
            });
        }
        Ok(())
    }
}

/// First-write record kept under an idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestRecord {
    pub tenant_id: TenantId,
    pub idempotency_key: IdempotencyKey,
    pub payload_digest: String,
    pub event_id: EventId,
    pub window_id: WindowId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReceipt {
    pub event_id: EventId,
    pub window_id: WindowId,
    pub accepted: bool,
    pub replayed: bool,
}
