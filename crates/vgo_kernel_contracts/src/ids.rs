#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::common::{validate_hex, validate_token};
use crate::{ContractViolation, Validate};

macro_rules! token_id {
    ($(#[$meta:meta])* $name:ident, $field:literal, $max_len:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn new(v: impl Into<String>) -> Result<Self, ContractViolation> {
                let v = Self(v.into());
                v.validate()?;
                Ok(v)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Validate for $name {
            fn validate(&self) -> Result<(), ContractViolation> {
                validate_token($field, &self.0, $max_len)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ContractViolation;

            fn try_from(v: String) -> Result<Self, Self::Error> {
                Self::new(v)
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> String {
                v.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

token_id!(TenantId, "tenant_id", 64);
token_id!(PartitionId, "partition_id", 64);
token_id!(PrincipalId, "principal_id", 128);
token_id!(
    /// Globally unique across tenants and windows.
    EventId,
    "event_id",
    128
);
token_id!(IdempotencyKey, "idempotency_key", 128);
token_id!(WriterId, "writer_id", 128);
token_id!(SignerId, "signer_id", 128);
token_id!(
    /// Open-ended attestation kind, e.g. `BOOK_RESERVES_OK`.
    ProofKind,
    "proof_kind",
    64
);

impl ProofKind {
    pub const BOOK_RESERVES_OK: &'static str = "BOOK_RESERVES_OK";

    pub fn book_reserves_ok() -> Self {
        Self(Self::BOOK_RESERVES_OK.to_string())
    }
}

/// `w:<tenant>:<partition>:<seq>:v<version>`; derived, never chosen by callers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WindowId(String);

impl WindowId {
    pub fn derive(
        tenant_id: &TenantId,
        partition_id: &PartitionId,
        window_seq: u64,
        version: u32,
    ) -> Self {
        Self(format!(
            "w:{}:{}:{}:v{}",
            tenant_id.as_str(),
            partition_id.as_str(),
            window_seq,
            version
        ))
    }

    pub fn parse(v: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(v.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for WindowId {
    fn validate(&self) -> Result<(), ContractViolation> {
        let parts = self.0.split(':').collect::<Vec<_>>();
        if parts.len() != 5 || parts[0] != "w" {
            return Err(ContractViolation::InvalidValue {
                field: "window_id",
                reason: "must have shape w:<tenant>:<partition>:<seq>:v<version>",
            });
        }
        validate_token("window_id.tenant", parts[1], 64)?;
        validate_token("window_id.partition", parts[2], 64)?;
        if parts[3].parse::<u64>().is_err() {
            return Err(ContractViolation::InvalidValue {
                field: "window_id.seq",
                reason: "must be a decimal u64",
            });
        }
        match parts[4].strip_prefix('v').map(str::parse::<u32>) {
            Some(Ok(v)) if v > 0 => Ok(()),
            _ => Err(ContractViolation::InvalidValue {
                field: "window_id.version",
                reason: "must be v<u32 > 0>",
            }),
        }
    }
}

impl TryFrom<String> for WindowId {
    type Error = ContractViolation;

    fn try_from(v: String) -> Result<Self, Self::Error> {
        Self::parse(v)
    }
}

impl From<WindowId> for String {
    fn from(v: WindowId) -> String {
        v.0
    }
}

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! digest_id {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            pub fn from_hex(v: impl Into<String>) -> Result<Self, ContractViolation> {
                let v = Self(v.into());
                v.validate()?;
                Ok(v)
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Validate for $name {
            fn validate(&self) -> Result<(), ContractViolation> {
                validate_hex($field, &self.0, 32)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ContractViolation;

            fn try_from(v: String) -> Result<Self, Self::Error> {
                Self::from_hex(v)
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> String {
                v.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

digest_id!(
    /// SHA-256 over a window's canonical transcript bytes.
    SealHash,
    "seal_hash"
);
digest_id!(AcceptanceId, "acceptance_id");
