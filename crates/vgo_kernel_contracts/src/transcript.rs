#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::allocation::{AllocationRecord, CarryEntry, WindowTotals};
use crate::event::EventRecord;
use crate::fold::FoldDescriptor;
use crate::ids::{EventId, SealHash, WindowId};
use crate::policy::{PolicyManifest, PolicyVersion};
use crate::window::WindowKey;
use crate::{ContractViolation, LogicalTime, SchemaVersion, Validate};

pub const TRANSCRIPT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExclusionReason {
    OutOfWindow,
}

impl ExclusionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ExclusionReason::OutOfWindow => "OUT_OF_WINDOW",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExcludedEvent {
    pub event_id: EventId,
    pub reason: ExclusionReason,
}

/// Everything a replay needs. Events are stored sorted by `event_id`;
/// processing order is re-derived from `fold`, never from storage order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptInputs {
    pub key: WindowKey,
    pub opens_at: LogicalTime,
    pub watermark: LogicalTime,
    pub policy: PolicyManifest,
    pub fold: FoldDescriptor,
    pub carry_in: Vec<CarryEntry>,
    pub pool_carry_in_minor: i64,
    pub carry_source: Option<SealHash>,
    pub events: Vec<EventRecord>,
}

impl Validate for TranscriptInputs {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.key.validate()?;
        self.policy.validate()?;
        self.fold.validate()?;
        if self.watermark < self.opens_at {
            return Err(ContractViolation::InvalidValue {
                field: "transcript_inputs.watermark",
                reason: "must be >= opens_at",
            });
        }
        if self
            .carry_in
            .windows(2)
            .any(|w| w[0].principal_id >= w[1].principal_id)
        {
            return Err(ContractViolation::InvalidValue {
                field: "transcript_inputs.carry_in",
                reason: "must be sorted by principal_id and unique",
            });
        }
        if self.pool_carry_in_minor < 0 {
            return Err(ContractViolation::InvalidValue {
                field: "transcript_inputs.pool_carry_in_minor",
                reason: "must be >= 0",
            });
        }
        if self.events.windows(2).any(|w| w[0].event_id >= w[1].event_id) {
            return Err(ContractViolation::InvalidValue {
                field: "transcript_inputs.events",
                reason: "must be sorted by event_id and unique",
            });
        }
        for ev in &self.events {
            ev.validate()?;
            if ev.tenant_id != self.key.tenant_id || ev.partition_id != self.key.partition_id {
                return Err(ContractViolation::InvalidValue {
                    field: "transcript_inputs.events",
                    reason: "events must belong to the window's tenant and partition",
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptOutputs {
    pub ordered_event_ids: Vec<EventId>,
    pub excluded: Vec<ExcludedEvent>,
    pub allocations: Vec<AllocationRecord>,
    pub totals: WindowTotals,
}

impl Validate for TranscriptOutputs {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self
            .allocations
            .windows(2)
            .any(|w| w[0].principal_id >= w[1].principal_id)
        {
            return Err(ContractViolation::InvalidValue {
                field: "transcript_outputs.allocations",
                reason: "must be sorted by principal_id and unique",
            });
        }
        for row in &self.allocations {
            row.validate()?;
        }
        self.totals.validate()
    }
}

/// Sealed snapshot body. The seal hash is computed over its canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    pub schema_version: SchemaVersion,
    pub window_id: WindowId,
    pub policy_version: PolicyVersion,
    pub inputs: TranscriptInputs,
    pub outputs: TranscriptOutputs,
}

impl Transcript {
    pub fn v1(
        inputs: TranscriptInputs,
        outputs: TranscriptOutputs,
    ) -> Result<Self, ContractViolation> {
        let transcript = Self {
            schema_version: TRANSCRIPT_CONTRACT_VERSION,
            window_id: inputs.key.window_id(),
            policy_version: inputs.policy.policy_version,
            inputs,
            outputs,
        };
        transcript.validate()?;
        Ok(transcript)
    }
}

impl Validate for Transcript {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != TRANSCRIPT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "transcript.schema_version",
                reason: "must match TRANSCRIPT_CONTRACT_VERSION",
            });
        }
        self.inputs.validate()?;
        self.outputs.validate()?;
        if self.window_id != self.inputs.key.window_id() {
            return Err(ContractViolation::InvalidValue {
                field: "transcript.window_id",
                reason: "must match inputs.key",
            });
        }
        if self.policy_version != self.inputs.policy.policy_version {
            return Err(ContractViolation::InvalidValue {
                field: "transcript.policy_version",
                reason: "must match inputs.policy",
            });
        }
        let accounted = self.outputs.ordered_event_ids.len() + self.outputs.excluded.len();
        if accounted != self.inputs.events.len() {
            return Err(ContractViolation::InvalidValue {
                field: "transcript.outputs",
                reason: "every input event must be ordered or excluded exactly once",
            });
        }
        Ok(())
    }
}

/// Write-once object kept in the content-addressed transcript store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedTranscript {
    pub seal_hash: SealHash,
    pub window_id: WindowId,
    pub policy_version: PolicyVersion,
    pub transcript: Transcript,
}
