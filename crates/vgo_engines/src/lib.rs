#![forbid(unsafe_code)]

pub mod accept;
pub mod accumulate;
pub mod audit;
pub mod carry;
pub mod compute;
pub mod digest;
pub mod export;
pub mod intake;
pub mod lease;
pub mod ordering;
pub mod policy;
pub mod seal;

#[cfg(test)]
pub(crate) mod test_support;
