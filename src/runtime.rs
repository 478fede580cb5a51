//! Runtime feature gates consumed by the proxy filter.
//!
//! The interface is deliberately narrow: a probabilistic percent gate and an
//! integer lookup. Lookup failure is never an error; the caller's default
//! applies. The sampler lives behind the gate, so the filter never touches a
//! random source directly and tests substitute deterministic loaders.

use dashmap::DashMap;
use rand::Rng;

/// Runtime keys consulted by the proxy filter.
pub mod keys {
    /// Master switch; below 100 percent the filter becomes pass-through.
    pub const PROXY_ENABLED: &str = "mongo.proxy_enabled";
    /// Gates connection-lifecycle log lines.
    pub const CONNECTION_LOGGING_ENABLED: &str = "mongo.connection_logging_enabled";
    /// Gates per-request access-log records.
    pub const LOGGING_ENABLED: &str = "mongo.logging_enabled";
    /// Effective percent of requests selected for a delay fault.
    pub const FAULT_DELAY_PERCENT: &str = "mongo.fault.delay.percent";
    /// Effective delay duration in milliseconds.
    pub const FAULT_DELAY_DURATION_MS: &str = "mongo.fault.delay.duration_ms";
}

/// Runtime configuration loader.
pub trait RuntimeLoader: Send + Sync {
    /// Probabilistic gate: true for roughly `percent` of calls, where
    /// `percent` is the runtime override for `key` or `default_percent`.
    fn feature_enabled(&self, key: &str, default_percent: u64) -> bool;

    /// Scalar parameter: the runtime override for `key` or `default`.
    fn get_integer(&self, key: &str, default: i64) -> i64;
}

/// Loader that samples uniformly against the effective percent.
///
/// Overrides installed with [`set`](Self::set) stand in for the host's
/// runtime snapshot; keys with no override fall back to the caller default.
#[derive(Debug, Default)]
pub struct RandomSamplingRuntime {
    overrides: DashMap<String, i64>,
}

impl RandomSamplingRuntime {
    /// A loader with no overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace an override for `key`.
    pub fn set(&self, key: &str, value: i64) {
        self.overrides.insert(key.to_string(), value);
    }

    /// Remove an override, restoring caller defaults.
    pub fn clear(&self, key: &str) {
        self.overrides.remove(key);
    }

    fn effective(&self, key: &str, default: i64) -> i64 {
        self.overrides.get(key).map(|v| *v).unwrap_or(default)
    }
}

impl RuntimeLoader for RandomSamplingRuntime {
    fn feature_enabled(&self, key: &str, default_percent: u64) -> bool {
        let percent = self.effective(key, default_percent as i64).clamp(0, 100);
        rand::thread_rng().gen_range(0..100) < percent
    }

    fn get_integer(&self, key: &str, default: i64) -> i64 {
        self.effective(key, default)
    }
}
