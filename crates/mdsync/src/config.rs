//! Service configuration.

use serde::{Deserialize, Serialize};

use mdsync_events::EventsConfig;
use mdsync_store::QueueConfig;
use mdsync_sync::SyncConfig;

use crate::error::{Result, ServiceError};

/// Configuration for [`SyncCore`](crate::SyncCore).
///
/// Every section defaults, so a host can load a partial JSON document:
///
/// ```
/// let config = mdsync::SyncCoreConfig::from_json(r#"{ "sync": { "workers": 8 } }"#).unwrap();
/// assert_eq!(config.sync.workers, 8);
/// assert_eq!(config.queue.capacity, 10_000);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncCoreConfig {
    pub queue: QueueConfig,
    pub sync: SyncConfig,
    pub events: EventsConfig,
}

impl SyncCoreConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ServiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        fn check(ok: bool, msg: &str) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(ServiceError::Config(msg.to_string()))
            }
        }

        check(self.queue.capacity > 0, "queue.capacity must be positive")?;
        check(
            self.queue.retry_backoff_ms >= 0,
            "queue.retry_backoff_ms must not be negative",
        )?;
        check(
            self.queue.claim_timeout_ms > 0,
            "queue.claim_timeout_ms must be positive",
        )?;
        check(self.sync.workers > 0, "sync.workers must be positive")?;
        check(!self.events.source.is_empty(), "events.source must not be empty")?;
        check(self.events.dedup_window > 0, "events.dedup_window must be positive")?;
        check(
            self.events.live_channel_capacity > 0,
            "events.live_channel_capacity must be positive",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SyncCoreConfig::default();
        config.validate().unwrap();
        assert_eq!(config.queue.default_max_retries, 3);
        assert_eq!(config.queue.claim_timeout_ms, 300_000);
        assert_eq!(config.events.source, "mdsync");
    }

    #[test]
    fn test_partial_json() {
        let config = SyncCoreConfig::from_json(
            r#"{ "queue": { "capacity": 50 }, "events": { "source": "pos-7" } }"#,
        )
        .unwrap();
        assert_eq!(config.queue.capacity, 50);
        assert_eq!(config.queue.retry_backoff_ms, 1_000);
        assert_eq!(config.events.source, "pos-7");
        assert_eq!(config.sync.workers, 4);
    }

    #[test]
    fn test_rejects_zero_workers() {
        let err = SyncCoreConfig::from_json(r#"{ "sync": { "workers": 0 } }"#).unwrap_err();
        assert!(matches!(err, ServiceError::Config(msg) if msg.contains("workers")));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            SyncCoreConfig::from_json("{ nope"),
            Err(ServiceError::Config(_))
        ));
    }
}
