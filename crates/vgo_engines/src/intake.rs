#![forbid(unsafe_code)]

use thiserror::Error;
use vgo_kernel_contracts::event::{EventKind, EventRecord, RawEvent};
use vgo_kernel_contracts::ids::{EventId, PartitionId, PrincipalId, TenantId};
use vgo_kernel_contracts::window::WindowRecord;
use vgo_kernel_contracts::{ContractViolation, LogicalTime, ReasonCodeId};

use crate::digest::{fnv1a64, sha256_tagged_hex};

pub mod reason_codes {
    use vgo_kernel_contracts::ReasonCodeId;

    pub const INTAKE_SCHEMA_INVALID: ReasonCodeId = ReasonCodeId(0x494E_0010);
    pub const INTAKE_UNKNOWN_KIND: ReasonCodeId = ReasonCodeId(0x494E_0011);
    pub const INTAKE_AMOUNT_SIGN_INVALID: ReasonCodeId = ReasonCodeId(0x494E_0012);
    pub const INTAKE_TENANT_MISMATCH: ReasonCodeId = ReasonCodeId(0x494E_0013);
    pub const INTAKE_PARTITION_MISMATCH: ReasonCodeId = ReasonCodeId(0x494E_0014);
}

const SHARD_DOMAIN_TAG: &str = "vgo.shard.v1|";
const PAYLOAD_DOMAIN_TAG: &[u8] = b"vgo.payload.v1\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntakeConfig {
    pub partition_count: u32,
    pub shard_version: u32,
}

impl IntakeConfig {
    pub fn mvp_v1() -> Self {
        Self {
            partition_count: 16,
            shard_version: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("intake refused ({reason_code:?}): {message}")]
pub struct IntakeRefuse {
    pub reason_code: ReasonCodeId,
    pub message: String,
}

impl IntakeRefuse {
    fn new(reason_code: ReasonCodeId, message: impl Into<String>) -> Self {
        Self {
            reason_code,
            message: message.into(),
        }
    }

    fn schema(v: ContractViolation) -> Self {
        Self::new(reason_codes::INTAKE_SCHEMA_INVALID, v.to_string())
    }
}

/// Versioned principal-to-partition map. Partition ids are `p` plus four
/// zero-padded digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardFunction {
    pub version: u32,
    pub partition_count: u32,
}

impl ShardFunction {
    pub fn partition_index(&self, principal_id: &PrincipalId) -> u32 {
        let key = format!("{SHARD_DOMAIN_TAG}{}", principal_id.as_str());
        let count = u64::from(self.partition_count.max(1));
        (fnv1a64(key.as_bytes()) % count) as u32
    }

    pub fn partition_for(&self, principal_id: &PrincipalId) -> Result<PartitionId, ContractViolation> {
        partition_id_for_index(self.partition_index(principal_id))
    }

    /// True when `partition_id` names a partition this function can produce.
    pub fn contains(&self, partition_id: &PartitionId) -> bool {
        partition_id
            .as_str()
            .strip_prefix('p')
            .filter(|digits| digits.len() == 4)
            .and_then(|digits| digits.parse::<u32>().ok())
            .map(|idx| idx < self.partition_count)
            .unwrap_or(false)
    }
}

pub fn partition_id_for_index(index: u32) -> Result<PartitionId, ContractViolation> {
    PartitionId::new(format!("p{index:04}"))
}

#[derive(Debug, Clone)]
pub struct IntakeRuntime {
    config: IntakeConfig,
}

impl IntakeRuntime {
    pub fn new(config: IntakeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> IntakeConfig {
        self.config
    }

    pub fn shard(&self) -> ShardFunction {
        ShardFunction {
            version: self.config.shard_version,
            partition_count: self.config.partition_count,
        }
    }

    /// Turns a boundary event into a canonical record owned by `window`.
    pub fn normalize(
        &self,
        raw: &RawEvent,
        window: &WindowRecord,
    ) -> Result<EventRecord, IntakeRefuse> {
        let event_id = EventId::new(raw.event_id.clone()).map_err(IntakeRefuse::schema)?;
        let tenant_id = TenantId::new(raw.tenant_id.clone()).map_err(IntakeRefuse::schema)?;
        let principal_id =
            PrincipalId::new(raw.principal_id.clone()).map_err(IntakeRefuse::schema)?;
        if tenant_id != window.key.tenant_id {
            return Err(IntakeRefuse::new(
                reason_codes::INTAKE_TENANT_MISMATCH,
                "event tenant does not own the target window",
            ));
        }
        let Some(kind) = EventKind::parse(&raw.kind) else {
            return Err(IntakeRefuse::new(
                reason_codes::INTAKE_UNKNOWN_KIND,
                format!("unknown event kind {:?}", raw.kind),
            ));
        };
        if raw.amount_minor == i64::MIN || !kind.amount_allowed(raw.amount_minor) {
            return Err(IntakeRefuse::new(
                reason_codes::INTAKE_AMOUNT_SIGN_INVALID,
                format!("amount_minor sign does not match {}", kind.as_str()),
            ));
        }
        let partition_id = self
            .shard()
            .partition_for(&principal_id)
            .map_err(IntakeRefuse::schema)?;
        if partition_id != window.key.partition_id {
            return Err(IntakeRefuse::new(
                reason_codes::INTAKE_PARTITION_MISMATCH,
                format!(
                    "principal shards to {} but window is {}",
                    partition_id, window.key.partition_id
                ),
            ));
        }
        let bucket_id = window.fold.bucket_of(raw.occurred_at);
        EventRecord::v1(
            event_id,
            tenant_id,
            principal_id,
            kind,
            raw.amount_minor,
            LogicalTime(raw.occurred_at),
            partition_id,
            bucket_id,
        )
        .map_err(IntakeRefuse::schema)
    }
}

/// Digest of the submitted payload, compared on idempotent retries.
pub fn payload_digest(raw: &RawEvent) -> String {
    let amount = raw.amount_minor.to_string();
    let occurred_at = raw.occurred_at.to_string();
    sha256_tagged_hex(
        PAYLOAD_DOMAIN_TAG,
        &[
            raw.event_id.as_bytes(),
            raw.tenant_id.as_bytes(),
            raw.principal_id.as_bytes(),
            raw.kind.as_bytes(),
            amount.as_bytes(),
            occurred_at.as_bytes(),
        ],
    )
}
