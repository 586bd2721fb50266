#![forbid(unsafe_code)]

use thiserror::Error;
use vgo_engines::accept::AcceptanceConfig;
use vgo_engines::audit::AuditConfig;
use vgo_engines::export::ExportConfig;
use vgo_engines::intake::IntakeConfig;
use vgo_engines::lease::LeaseConfig;

pub const ENV_PARTITION_COUNT: &str = "VGO_PARTITION_COUNT";
pub const ENV_LEASE_MAX_TTL_MS: &str = "VGO_LEASE_MAX_TTL_MS";

// Partition ids are rendered with four digits.
const MAX_PARTITION_COUNT: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub intake: IntakeConfig,
    pub lease: LeaseConfig,
    pub acceptance: AcceptanceConfig,
    pub export: ExportConfig,
    pub audit: AuditConfig,
}

impl EngineConfig {
    pub fn mvp_v1() -> Self {
        Self {
            intake: IntakeConfig::mvp_v1(),
            lease: LeaseConfig::mvp_v1(),
            acceptance: AcceptanceConfig::mvp_v1(),
            export: ExportConfig::mvp_v1(),
            audit: AuditConfig::mvp_v1(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// `mvp_v1` defaults overridden by whatever `lookup` returns.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::mvp_v1();
        if let Some(raw) = lookup(ENV_PARTITION_COUNT) {
            let count = parse_u32(ENV_PARTITION_COUNT, &raw)?;
            if count == 0 || count > MAX_PARTITION_COUNT {
                return Err(ConfigError::Invalid {
                    var: ENV_PARTITION_COUNT,
                    value: raw,
                    reason: "must be within 1..=10000",
                });
            }
            config.intake.partition_count = count;
        }
        if let Some(raw) = lookup(ENV_LEASE_MAX_TTL_MS) {
            let max_ttl_ms = parse_u32(ENV_LEASE_MAX_TTL_MS, &raw)?;
            if max_ttl_ms < config.lease.min_ttl_ms {
                return Err(ConfigError::Invalid {
                    var: ENV_LEASE_MAX_TTL_MS,
                    value: raw,
                    reason: "must not be below the minimum lease ttl",
                });
            }
            config.lease.max_ttl_ms = max_ttl_ms;
        }
        Ok(config)
    }
}

fn parse_u32(var: &'static str, raw: &str) -> Result<u32, ConfigError> {
    raw.trim().parse::<u32>().map_err(|_| ConfigError::Invalid {
        var,
        value: raw.to_string(),
        reason: "must be an unsigned integer",
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn at_config_01_defaults_when_unset() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::mvp_v1());
    }

    #[test]
    fn at_config_02_overrides_applied() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_PARTITION_COUNT, "4"),
            (ENV_LEASE_MAX_TTL_MS, "60000"),
        ]))
        .unwrap();
        assert_eq!(config.intake.partition_count, 4);
        assert_eq!(config.lease.max_ttl_ms, 60_000);
    }

    #[test]
    fn at_config_03_out_of_range_values_rejected() {
        assert!(EngineConfig::from_lookup(lookup(&[(ENV_PARTITION_COUNT, "0")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[(ENV_PARTITION_COUNT, "10001")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[(ENV_PARTITION_COUNT, "four")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[(ENV_LEASE_MAX_TTL_MS, "10")])).is_err());
    }
}
