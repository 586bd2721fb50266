#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_token;
use crate::fold::FoldDescriptor;
use crate::ids::{PartitionId, SealHash, TenantId, WindowId, WriterId};
use crate::policy::PolicyManifest;
use crate::{ContractViolation, LogicalTime, MonotonicTimeNs, SchemaVersion, Validate};

pub const WINDOW_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowStatus {
    Open,
    Closed,
    Sealed,
    Accepted,
    Exported,
    Invalid,
    Superseded,
}

impl WindowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WindowStatus::Open => "OPEN",
            WindowStatus::Closed => "CLOSED",
            WindowStatus::Sealed => "SEALED",
            WindowStatus::Accepted => "ACCEPTED",
            WindowStatus::Exported => "EXPORTED",
            WindowStatus::Invalid => "INVALID",
            WindowStatus::Superseded => "SUPERSEDED",
        }
    }

    pub fn is_sealed(self) -> bool {
        matches!(
            self,
            WindowStatus::Sealed | WindowStatus::Accepted | WindowStatus::Exported
        )
    }
}

pub fn is_allowed_window_transition(from: WindowStatus, to: WindowStatus) -> bool {
    use WindowStatus::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Open, Closed)
            | (Closed, Sealed)
            | (Sealed, Accepted)
            | (Accepted, Exported)
            | (Open | Closed | Sealed | Accepted, Invalid)
            | (Open | Closed | Sealed | Accepted | Exported | Invalid, Superseded)
    )
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WindowKey {
    pub tenant_id: TenantId,
    pub partition_id: PartitionId,
    pub window_seq: u64,
    pub version: u32,
}

impl WindowKey {
    pub fn v1(
        tenant_id: TenantId,
        partition_id: PartitionId,
        window_seq: u64,
        version: u32,
    ) -> Result<Self, ContractViolation> {
        let key = Self {
            tenant_id,
            partition_id,
            window_seq,
            version,
        };
        key.validate()?;
        Ok(key)
    }

    pub fn window_id(&self) -> WindowId {
        WindowId::derive(
            &self.tenant_id,
            &self.partition_id,
            self.window_seq,
            self.version,
        )
    }

    /// Next settlement cycle for the same (tenant, partition).
    pub fn successor(&self) -> WindowKey {
        WindowKey {
            tenant_id: self.tenant_id.clone(),
            partition_id: self.partition_id.clone(),
            window_seq: self.window_seq.saturating_add(1),
            version: 1,
        }
    }

    /// Same cycle, next correction version.
    pub fn next_version(&self) -> WindowKey {
        WindowKey {
            version: self.version.saturating_add(1),
            ..self.clone()
        }
    }

    pub fn predecessor_seq(&self) -> Option<u64> {
        self.window_seq.checked_sub(1)
    }
}

impl Validate for WindowKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.tenant_id.validate()?;
        self.partition_id.validate()?;
        if self.version == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "window_key.version",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaseOperation {
    Claim,
    Renew,
    Release,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterLease {
    pub writer_id: WriterId,
    pub lease_token: String,
    pub expires_at: MonotonicTimeNs,
}

impl WriterLease {
    pub fn v1(
        writer_id: WriterId,
        lease_token: String,
        expires_at: MonotonicTimeNs,
    ) -> Result<Self, ContractViolation> {
        let lease = Self {
            writer_id,
            lease_token,
            expires_at,
        };
        lease.validate()?;
        Ok(lease)
    }

    pub fn is_live(&self, now: MonotonicTimeNs) -> bool {
        self.expires_at > now
    }
}

impl Validate for WriterLease {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.writer_id.validate()?;
        validate_token("writer_lease.lease_token", &self.lease_token, 192)?;
        if self.expires_at.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "writer_lease.expires_at",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Window metadata row. One row per (tenant, partition, seq, version).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRecord {
    pub schema_version: SchemaVersion,
    pub window_id: WindowId,
    pub key: WindowKey,
    pub status: WindowStatus,
    pub opens_at: LogicalTime,
    pub watermark: LogicalTime,
    pub writer_lease: Option<WriterLease>,
    pub policy: PolicyManifest,
    pub fold: FoldDescriptor,
    pub seal_hash: Option<SealHash>,
    pub invalid_reason: Option<String>,
    pub superseded_by: Option<WindowId>,
}

impl WindowRecord {
    pub fn open_v1(
        key: WindowKey,
        opens_at: LogicalTime,
        policy: PolicyManifest,
        fold: FoldDescriptor,
    ) -> Result<Self, ContractViolation> {
        let record = Self {
            schema_version: WINDOW_CONTRACT_VERSION,
            window_id: key.window_id(),
            key,
            status: WindowStatus::Open,
            opens_at,
            watermark: opens_at,
            writer_lease: None,
            policy,
            fold,
            seal_hash: None,
            invalid_reason: None,
            superseded_by: None,
        };
        record.validate()?;
        Ok(record)
    }

    pub fn live_lease(&self, now: MonotonicTimeNs) -> Option<&WriterLease> {
        self.writer_lease.as_ref().filter(|l| l.is_live(now))
    }
}

impl Validate for WindowRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != WINDOW_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "window_record.schema_version",
                reason: "must match WINDOW_CONTRACT_VERSION",
            });
        }
        self.key.validate()?;
        if self.window_id != self.key.window_id() {
            return Err(ContractViolation::InvalidValue {
                field: "window_record.window_id",
                reason: "must be derived from window_record.key",
            });
        }
        if self.watermark < self.opens_at {
            return Err(ContractViolation::InvalidValue {
                field: "window_record.watermark",
                reason: "must be >= opens_at",
            });
        }
        if let Some(lease) = &self.writer_lease {
            lease.validate()?;
        }
        self.policy.validate()?;
        self.fold.validate()?;
        if self.status.is_sealed() && self.seal_hash.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "window_record.seal_hash",
                reason: "must be present once sealed",
            });
        }
        if matches!(self.status, WindowStatus::Open | WindowStatus::Closed)
            && self.seal_hash.is_some()
        {
            return Err(ContractViolation::InvalidValue {
                field: "window_record.seal_hash",
                reason: "must be absent before sealing",
            });
        }
        if (self.status == WindowStatus::Superseded) != self.superseded_by.is_some() {
            return Err(ContractViolation::InvalidValue {
                field: "window_record.superseded_by",
                reason: "must be present exactly when status=SUPERSEDED",
            });
        }
        if self.status == WindowStatus::Invalid && self.invalid_reason.is_none() {
            return Err(ContractViolation::InvalidValue {
                field: "window_record.invalid_reason",
                reason: "must be present when status=INVALID",
            });
        }
        Ok(())
    }
}
