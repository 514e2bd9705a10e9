//! Runtime configuration
//!
//! Every knob has a documented default. Configuration can be loaded from
//! partial JSON; missing keys keep their defaults and durations are given in
//! milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Serde adapter storing a `Duration` as integer milliseconds
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Batch window and queue limits for the [`MessageBatcher`](crate::MessageBatcher)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatcherConfig {
    /// Window length opened by the first enqueue
    #[serde(with = "duration_ms")]
    pub initial_window: Duration,
    /// Hard cap on the window length, measured from the first enqueue
    #[serde(with = "duration_ms")]
    pub max_window: Duration,
    /// Enqueues closer than this to the previous one extend the window
    #[serde(with = "duration_ms")]
    pub extension_threshold: Duration,
    /// Queue capacity before the oldest entries are dropped
    pub max_queue_size: usize,
    /// Entries older than this are discarded at flush time
    #[serde(with = "duration_ms")]
    pub item_ttl: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            initial_window: Duration::from_millis(50),
            max_window: Duration::from_millis(100),
            extension_threshold: Duration::from_millis(20),
            max_queue_size: 100,
            item_ttl: Duration::from_millis(30_000),
        }
    }
}

/// Defaults for cross-context requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestConfig {
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    pub require_ack: bool,
    /// Attempts made by `send_with_retry`, including the first one
    pub retry_attempts: u32,
    #[serde(with = "duration_ms")]
    pub retry_backoff: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(5000),
            require_ack: false,
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReactiveConfig {
    /// Deepest nested metadata path that may be written
    pub max_depth: usize,
}

impl Default for ReactiveConfig {
    fn default() -> Self {
        Self { max_depth: 3 }
    }
}

/// Subscription leak detection thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SentinelConfig {
    /// Warn once the number of live subscriptions goes above this
    pub warn_threshold: usize,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            warn_threshold: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WatcherConfig {
    /// How often the persistent store is polled for remote changes
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// All engine configuration in one place
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
    pub batcher: BatcherConfig,
    pub request: RequestConfig,
    pub reactive: ReactiveConfig,
    pub sentinel: SentinelConfig,
    pub watcher: WatcherConfig,
}

impl SyncConfig {
    /// Parse a configuration from JSON, keeping defaults for absent keys.
    ///
    /// # Example
    /// ```
    /// use quicktab_sync_core::config::SyncConfig;
    /// use std::time::Duration;
    ///
    /// let config = SyncConfig::from_json(r#"{ "batcher": { "initialWindow": 25 } }"#).unwrap();
    /// assert_eq!(config.batcher.initial_window, Duration::from_millis(25));
    /// assert_eq!(config.batcher.max_window, Duration::from_millis(100));
    /// ```
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_documented_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.batcher.initial_window, Duration::from_millis(50));
        assert_eq!(config.batcher.max_window, Duration::from_millis(100));
        assert_eq!(config.batcher.extension_threshold, Duration::from_millis(20));
        assert_eq!(config.batcher.max_queue_size, 100);
        assert_eq!(config.batcher.item_ttl, Duration::from_secs(30));
        assert_eq!(config.request.timeout, Duration::from_millis(5000));
        assert_eq!(config.reactive.max_depth, 3);
    }

    #[test]
    fn test_partial_override() {
        let config = SyncConfig::from_json(
            r#"{ "request": { "timeout": 250, "requireAck": true }, "sentinel": { "warnThreshold": 5 } }"#,
        )
        .unwrap();
        assert_eq!(config.request.timeout, Duration::from_millis(250));
        assert!(config.request.require_ack);
        assert_eq!(config.request.retry_attempts, 3);
        assert_eq!(config.sentinel.warn_threshold, 5);
        assert_eq!(config.batcher, BatcherConfig::default());
    }

    #[test]
    fn test_round_trip_keeps_millis() {
        let json = serde_json::to_value(WatcherConfig::default()).unwrap();
        assert_eq!(json, serde_json::json!({ "pollInterval": 500 }));
    }

    #[test]
    fn test_rejects_wrong_types() {
        assert!(SyncConfig::from_json(r#"{ "batcher": { "maxQueueSize": "big" } }"#).is_err());
    }
}
