//! Error types for the events module.

use mdsync_core::{CoreError, Topic};
use thiserror::Error;

/// Errors raised by a [`Broker`](crate::Broker).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The topic could not accept the message.
    #[error("topic {topic} unavailable: {reason}")]
    Unavailable { topic: Topic, reason: String },

    /// The subscriber fell behind and messages were dropped.
    #[error("subscriber on {topic} lagged, {skipped} messages skipped")]
    Lagged { topic: Topic, skipped: u64 },

    /// The topic has been shut down.
    #[error("topic {0} closed")]
    Closed(Topic),
}

/// Errors that can occur while publishing or consuming events.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Event could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] CoreError),

    /// A subscriber side effect failed.
    #[error("handler {handler} failed: {reason}")]
    Handler { handler: String, reason: String },

    /// The cache backend failed.
    #[error("cache error: {0}")]
    Cache(String),
}

impl EventError {
    pub fn handler(handler: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        EventError::Handler {
            handler: handler.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type for event operations.
pub type Result<T> = std::result::Result<T, EventError>;
