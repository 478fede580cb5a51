//! Fixed-delay fault rule configuration.
//!
//! The rule is parsed once at filter-config time and consulted per request;
//! the runtime decides whether a given request is actually delayed and may
//! override both knobs at runtime.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// On-disk schema for the fault section:
/// `{"fixed_delay": {"percent": <0..100>, "duration_ms": <u64>}}`.
///
/// Both fields are required when `fixed_delay` is present; an absent
/// `fixed_delay` means no fault rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FaultConfigSchema {
    /// The fixed-delay rule, when configured.
    pub fixed_delay: Option<FixedDelaySchema>,
}

/// The fixed-delay rule fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixedDelaySchema {
    /// Percent of requests to delay, 0..=100.
    pub percent: u32,
    /// Delay duration in milliseconds.
    pub duration_ms: u64,
}

/// Parsed, validated fixed-delay fault rule. Immutable after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultConfig {
    delay_percent: u32,
    delay_duration: Duration,
}

impl FaultConfig {
    /// Build a rule from raw values, rejecting out-of-range percents.
    pub fn new(delay_percent: u32, delay_duration: Duration) -> Result<Self, ConfigError> {
        if delay_percent > 100 {
            return Err(ConfigError::PercentOutOfRange(delay_percent));
        }
        Ok(Self {
            delay_percent,
            delay_duration,
        })
    }

    /// Build from the parsed schema. `Ok(None)` when no `fixed_delay`
    /// section is present.
    pub fn from_schema(schema: &FaultConfigSchema) -> Result<Option<Self>, ConfigError> {
        match &schema.fixed_delay {
            Some(fixed_delay) => Ok(Some(Self::new(
                fixed_delay.percent,
                Duration::from_millis(fixed_delay.duration_ms),
            )?)),
            None => Ok(None),
        }
    }

    /// Parse the JSON schema from a string.
    pub fn from_json_str(json: &str) -> Result<Option<Self>, ConfigError> {
        let schema: FaultConfigSchema = serde_json::from_str(json)?;
        Self::from_schema(&schema)
    }

    /// Configured percent of requests to delay.
    pub fn delay_percent(&self) -> u32 {
        self.delay_percent
    }

    /// Configured delay duration.
    pub fn delay_duration(&self) -> Duration {
        self.delay_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_rule() {
        let config = FaultConfig::from_json_str(
            r#"{"fixed_delay": {"percent": 50, "duration_ms": 10}}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(config.delay_percent(), 50);
        assert_eq!(config.delay_duration(), Duration::from_millis(10));
    }

    #[test]
    fn test_absent_rule_is_none() {
        assert!(FaultConfig::from_json_str("{}").unwrap().is_none());
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let err = FaultConfig::from_json_str(r#"{"fixed_delay": {"percent": 50}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidJson(_)));

        let err =
            FaultConfig::from_json_str(r#"{"fixed_delay": {"duration_ms": 10}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidJson(_)));
    }

    #[test]
    fn test_out_of_range_percent_is_rejected() {
        let err = FaultConfig::from_json_str(
            r#"{"fixed_delay": {"percent": 101, "duration_ms": 10}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::PercentOutOfRange(101)));
    }
}
