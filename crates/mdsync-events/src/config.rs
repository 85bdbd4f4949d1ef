//! Event fan-out configuration.

use serde::{Deserialize, Serialize};

/// Event publisher and subscriber settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Stamped into every published event's `source`.
    pub source: String,
    /// How many recent event ids each subscriber remembers for dedup.
    pub dedup_window: usize,
    /// Buffer of the live-client broadcast channel.
    pub live_channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            source: "mdsync".into(),
            dedup_window: 4096,
            live_channel_capacity: 1024,
        }
    }
}
