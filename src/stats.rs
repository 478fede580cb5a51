//! Statistics interfaces consumed by the proxy filter.
//!
//! The host owns the real stats backend; the filter sees a name-addressed
//! store that hands out cheap atomic counter and gauge handles and accepts
//! histogram and timing samples for delivery to the configured sinks.
//! Handles are `Arc`-backed atomics, so they are safe to share across
//! connections and threads.
//!
//! [`IsolatedStatsStore`] is a self-contained implementation backed by
//! concurrent maps. It additionally records delivered histogram and timing
//! samples so tests can assert on them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

/// Monotonic counter handle.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    /// Increment by one.
    pub fn inc(&self) {
        self.add(1);
    }

    /// Increment by `amount`.
    pub fn add(&self, amount: u64) {
        self.0.fetch_add(amount, Ordering::Relaxed);
    }

    /// Current value.
    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Up/down gauge handle. Decrements saturate at zero.
#[derive(Debug, Clone, Default)]
pub struct Gauge(Arc<AtomicU64>);

impl Gauge {
    /// Increment by one.
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by one, saturating at zero.
    pub fn dec(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Set to an absolute value.
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    /// Current value.
    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Name-addressed statistics store.
///
/// Two handles obtained for the same name observe the same underlying
/// value. Histogram and timing samples are fire-and-forget.
pub trait StatsStore: Send + Sync {
    /// Counter handle for `name`, created on first use.
    fn counter(&self, name: &str) -> Counter;

    /// Gauge handle for `name`, created on first use.
    fn gauge(&self, name: &str) -> Gauge;

    /// Deliver one histogram sample to the configured sinks.
    fn deliver_histogram_to_sinks(&self, name: &str, value: u64);

    /// Deliver one timing sample to the configured sinks.
    fn deliver_timing_to_sinks(&self, name: &str, duration: Duration);
}

/// In-process store with recorded sink deliveries.
#[derive(Debug, Default)]
pub struct IsolatedStatsStore {
    counters: DashMap<String, Counter>,
    gauges: DashMap<String, Gauge>,
    histograms: DashMap<String, Vec<u64>>,
    timings: DashMap<String, Vec<Duration>>,
}

impl IsolatedStatsStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All histogram samples delivered under `name`, in delivery order.
    pub fn histogram_values(&self, name: &str) -> Vec<u64> {
        self.histograms
            .get(name)
            .map(|values| values.clone())
            .unwrap_or_default()
    }

    /// All timing samples delivered under `name`, in delivery order.
    pub fn timing_values(&self, name: &str) -> Vec<Duration> {
        self.timings
            .get(name)
            .map(|values| values.clone())
            .unwrap_or_default()
    }
}

impl StatsStore for IsolatedStatsStore {
    fn counter(&self, name: &str) -> Counter {
        self.counters.entry(name.to_string()).or_default().clone()
    }

    fn gauge(&self, name: &str) -> Gauge {
        self.gauges.entry(name.to_string()).or_default().clone()
    }

    fn deliver_histogram_to_sinks(&self, name: &str, value: u64) {
        self.histograms.entry(name.to_string()).or_default().push(value);
    }

    fn deliver_timing_to_sinks(&self, name: &str, duration: Duration) {
        self.timings.entry(name.to_string()).or_default().push(duration);
    }
}
