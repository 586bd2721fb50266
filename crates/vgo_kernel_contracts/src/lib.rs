#![forbid(unsafe_code)]

pub mod acceptance;
pub mod allocation;
pub mod audit;
pub mod common;
pub mod event;
pub mod export;
pub mod fold;
pub mod ids;
pub mod policy;
pub mod transcript;
pub mod window;

pub use common::{
    ContractViolation, LogicalTime, MonotonicTimeNs, ReasonCodeId, SchemaVersion, UnixSeconds,
    Validate,
};
