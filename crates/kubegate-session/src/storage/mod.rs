//! Session record and its storage implementations.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod file;

#[cfg(feature = "memory")]
pub mod memory;

pub use file::FileSessionStore;

#[cfg(feature = "memory")]
pub use memory::MemorySessionStore;

/// A client's claim on a reply queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Reply queue name.
    pub queue_name: String,
    /// When the queue was created (serialized as RFC 3339).
    pub timestamp: DateTime<Utc>,
}

impl Session {
    /// Create a session stamped with the current time.
    #[must_use]
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            timestamp: Utc::now(),
        }
    }

    /// Whether the session is younger than `duration` at `now`.
    #[must_use]
    pub fn is_valid(&self, duration: Duration, now: DateTime<Utc>) -> bool {
        let Ok(duration) = TimeDelta::from_std(duration) else {
            // Longer than chrono can represent: never expires.
            return true;
        };
        now.signed_duration_since(self.timestamp) < duration
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Corrupt session record: {0}")]
    Corrupt(String),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Trait for session record storage.
///
/// A store holds at most one record; `save` replaces it.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load the record, `None` if there is none.
    async fn load(&self) -> Result<Option<Session>, StoreError>;

    /// Replace the record.
    async fn save(&self, session: &Session) -> Result<(), StoreError>;

    /// Remove the record. Removing a missing record succeeds.
    async fn clear(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_window() {
        let now = Utc::now();
        let session = Session {
            queue_name: "reply-queue-1".to_string(),
            timestamp: now - TimeDelta::minutes(59),
        };
        assert!(session.is_valid(Duration::from_secs(3600), now));
        assert!(!session.is_valid(Duration::from_secs(3600), now + TimeDelta::minutes(1)));
        assert!(!session.is_valid(Duration::from_secs(60), now));
    }

    #[test]
    fn test_serialized_shape() {
        let session = Session {
            queue_name: "reply-queue-1".to_string(),
            timestamp: DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        };
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["queue_name"], "reply-queue-1");
        assert_eq!(json["timestamp"], "2024-05-01T10:00:00Z");
    }
}
