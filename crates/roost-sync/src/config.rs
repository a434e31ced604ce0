//! Sync configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retention limit and flush windows for every cached entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Target number of persisted events after a sweep
    pub events_limit: usize,
    /// Batch window for event deltas
    pub events_batch_ms: u64,
    /// Batch window for relay provenance changes
    pub tracker_batch_ms: u64,
    /// Throttle window for relay metadata
    pub relays_throttle_ms: u64,
    /// Batch window for handle records
    pub handles_batch_ms: u64,
    /// Batch window for zapper records
    pub zappers_batch_ms: u64,
    /// Sampling interval for freshness timestamps
    pub freshness_interval_ms: u64,
    /// Sampling interval for decrypted plaintext
    pub plaintext_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            events_limit: 10_000,
            events_batch_ms: 3_000,
            tracker_batch_ms: 3_000,
            relays_throttle_ms: 3_000,
            handles_batch_ms: 300,
            zappers_batch_ms: 300,
            freshness_interval_ms: 10_000,
            plaintext_interval_ms: 10_000,
        }
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Short windows for tests
    pub fn testing() -> Self {
        Self {
            events_limit: 100,
            events_batch_ms: 50,
            tracker_batch_ms: 50,
            relays_throttle_ms: 50,
            handles_batch_ms: 20,
            zappers_batch_ms: 20,
            freshness_interval_ms: 100,
            plaintext_interval_ms: 100,
        }
    }

    pub fn with_events_limit(mut self, limit: usize) -> Self {
        self.events_limit = limit;
        self
    }

    pub fn with_events_batch(mut self, window: Duration) -> Self {
        self.events_batch_ms = window.as_millis() as u64;
        self
    }

    pub fn with_tracker_batch(mut self, window: Duration) -> Self {
        self.tracker_batch_ms = window.as_millis() as u64;
        self
    }

    pub fn with_relays_throttle(mut self, window: Duration) -> Self {
        self.relays_throttle_ms = window.as_millis() as u64;
        self
    }

    pub fn with_handles_batch(mut self, window: Duration) -> Self {
        self.handles_batch_ms = window.as_millis() as u64;
        self
    }

    pub fn with_zappers_batch(mut self, window: Duration) -> Self {
        self.zappers_batch_ms = window.as_millis() as u64;
        self
    }

    pub fn with_freshness_interval(mut self, interval: Duration) -> Self {
        self.freshness_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_plaintext_interval(mut self, interval: Duration) -> Self {
        self.plaintext_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn events_batch(&self) -> Duration {
        Duration::from_millis(self.events_batch_ms)
    }

    pub fn tracker_batch(&self) -> Duration {
        Duration::from_millis(self.tracker_batch_ms)
    }

    pub fn relays_throttle(&self) -> Duration {
        Duration::from_millis(self.relays_throttle_ms)
    }

    pub fn handles_batch(&self) -> Duration {
        Duration::from_millis(self.handles_batch_ms)
    }

    pub fn zappers_batch(&self) -> Duration {
        Duration::from_millis(self.zappers_batch_ms)
    }

    pub fn freshness_interval(&self) -> Duration {
        Duration::from_millis(self.freshness_interval_ms)
    }

    pub fn plaintext_interval(&self) -> Duration {
        Duration::from_millis(self.plaintext_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.events_limit, 10_000);
        assert_eq!(config.events_batch(), Duration::from_secs(3));
        assert_eq!(config.handles_batch(), Duration::from_millis(300));
        assert_eq!(config.freshness_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"events_limit": 500, "zappers_batch_ms": 1000}"#).unwrap();
        assert_eq!(config.events_limit, 500);
        assert_eq!(config.zappers_batch(), Duration::from_secs(1));
        assert_eq!(config.tracker_batch_ms, 3_000);
    }

    #[test]
    fn test_builders() {
        let config = SyncConfig::new()
            .with_events_limit(42)
            .with_relays_throttle(Duration::from_millis(750));
        assert_eq!(config.events_limit, 42);
        assert_eq!(config.relays_throttle_ms, 750);
    }
}
