#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, Validate};

pub const FOLD_DESCRIPTOR_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SortKey {
    BucketId,
    PartitionId,
    EventId,
}

/// Explicit, versioned processing order. Persisted inside every transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldDescriptor {
    pub version: u32,
    pub keys: Vec<SortKey>,
    pub bucket_width_ticks: u64,
}

impl FoldDescriptor {
    pub fn canonical_v1(bucket_width_ticks: u64) -> Result<Self, ContractViolation> {
        let fold = Self {
            version: FOLD_DESCRIPTOR_VERSION,
            keys: vec![SortKey::BucketId, SortKey::PartitionId, SortKey::EventId],
            bucket_width_ticks,
        };
        fold.validate()?;
        Ok(fold)
    }

    pub fn bucket_of(&self, occurred_at: u64) -> u64 {
        occurred_at / self.bucket_width_ticks.max(1)
    }
}

impl Validate for FoldDescriptor {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.version != FOLD_DESCRIPTOR_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "fold_descriptor.version",
                reason: "unsupported fold descriptor version",
            });
        }
        if self.keys != [SortKey::BucketId, SortKey::PartitionId, SortKey::EventId] {
            return Err(ContractViolation::InvalidValue {
                field: "fold_descriptor.keys",
                reason: "v1 keys must be BUCKET_ID, PARTITION_ID, EVENT_ID",
            });
        }
        if self.bucket_width_ticks == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "fold_descriptor.bucket_width_ticks",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}
