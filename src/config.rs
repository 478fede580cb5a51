//! Listener-level proxy configuration.
//!
//! The host parses its configuration file and hands the filter factory a
//! [`MongoProxyConfig`]. The only nested schema the crate owns is the fault
//! section (see [`crate::fault`]); everything else is plain values.

use serde::Deserialize;

use crate::codec::DEFAULT_MAX_MESSAGE_BYTES;
use crate::error::ConfigError;
use crate::fault::{FaultConfig, FaultConfigSchema};

/// Configuration for one MongoDB proxy listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MongoProxyConfig {
    /// Prefix for every statistic the filter emits, without a trailing dot.
    pub stat_prefix: String,

    /// Path of the access-log file the host should open for this listener.
    /// The crate itself only ever sees the opened sink.
    #[serde(default)]
    pub access_log: Option<String>,

    /// Fault section, when fault injection is configured.
    #[serde(default)]
    pub fault: Option<FaultConfigSchema>,

    /// Cap on a single decoded wire message.
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

impl MongoProxyConfig {
    /// A configuration with only the stat prefix set.
    pub fn new(stat_prefix: impl Into<String>) -> Self {
        Self {
            stat_prefix: stat_prefix.into(),
            access_log: None,
            fault: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }

    /// Parse from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// The validated fault rule, when one is configured.
    pub fn fault_config(&self) -> Result<Option<FaultConfig>, ConfigError> {
        match &self.fault {
            Some(schema) => FaultConfig::from_schema(schema),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_minimal_config() {
        let config = MongoProxyConfig::from_json_str(r#"{"stat_prefix": "mongo_main"}"#).unwrap();
        assert_eq!(config.stat_prefix, "mongo_main");
        assert!(config.access_log.is_none());
        assert!(config.fault_config().unwrap().is_none());
        assert_eq!(config.max_message_bytes, DEFAULT_MAX_MESSAGE_BYTES);
    }

    #[test]
    fn test_full_config() {
        let config = MongoProxyConfig::from_json_str(
            r#"{
                "stat_prefix": "mongo_main",
                "access_log": "/var/log/mongo.log",
                "fault": {"fixed_delay": {"percent": 25, "duration_ms": 50}},
                "max_message_bytes": 1048576
            }"#,
        )
        .unwrap();

        assert_eq!(config.access_log.as_deref(), Some("/var/log/mongo.log"));
        assert_eq!(config.max_message_bytes, 1048576);
        let fault = config.fault_config().unwrap().unwrap();
        assert_eq!(fault.delay_percent(), 25);
        assert_eq!(fault.delay_duration(), Duration::from_millis(50));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = MongoProxyConfig::from_json_str(
            r#"{"stat_prefix": "m", "upstream_cluster": "c"}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidJson(_)));
    }
}
