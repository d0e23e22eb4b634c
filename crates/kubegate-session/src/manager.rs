//! Session manager for a client's reply queue.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use kubegate_core::{MessageQueue, QueueError};
use uuid::Uuid;

use crate::storage::{Session, SessionStore, StoreError};

/// How long a reply queue is reused before it is replaced.
pub const DEFAULT_SESSION_DURATION: Duration = Duration::from_secs(60 * 60);

/// Prefix of generated reply queue names.
pub const DEFAULT_QUEUE_PREFIX: &str = "reply-queue";

/// Session manager error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to create reply queue: {0}")]
    CreateQueue(#[source] QueueError),
    #[error("Failed to save session: {0}")]
    Store(#[from] StoreError),
}

/// Hands out the reply queue a client listens on.
///
/// The queue is recorded in a session store and reused until it is older
/// than the session duration, then deleted and replaced by a fresh one.
pub struct SessionManager<S>
where
    S: SessionStore,
{
    store: S,
    queue: Arc<dyn MessageQueue>,
    duration: Duration,
    prefix: String,
}

impl<S> SessionManager<S>
where
    S: SessionStore,
{
    /// Create a session manager over a connected backend.
    #[must_use]
    pub fn new(store: S, queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            store,
            queue,
            duration: DEFAULT_SESSION_DURATION,
            prefix: DEFAULT_QUEUE_PREFIX.to_string(),
        }
    }

    /// Override the session duration.
    #[must_use]
    pub const fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Override the reply queue name prefix. Blank prefixes are ignored.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        if !prefix.trim().is_empty() {
            self.prefix = prefix.trim().to_string();
        }
        self
    }

    /// The session store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Return the recorded reply queue if still valid, else create one.
    ///
    /// # Errors
    /// Returns error if the new queue cannot be created or the session
    /// cannot be saved. An unreadable record only triggers a new session.
    pub async fn get_or_create_reply_queue(&self) -> Result<String, SessionError> {
        match self.store.load().await {
            Ok(Some(session)) => {
                if session.is_valid(self.duration, Utc::now()) {
                    tracing::info!(queue = %session.queue_name, "Session is valid, reusing the queue");
                    return Ok(session.queue_name);
                }
                tracing::info!(queue = %session.queue_name, "Session expired, deleting the old queue");
                if let Err(e) = self.queue.delete_queue(&session.queue_name).await {
                    tracing::warn!(queue = %session.queue_name, "Failed to delete expired queue: {e}");
                }
            }
            Ok(None) => tracing::info!("No session found, creating a new queue"),
            Err(e) => tracing::warn!("Failed to load session, creating a new queue: {e}"),
        }

        let queue_name = format!("{}-{}", self.prefix, Uuid::new_v4());
        tracing::info!(queue = %queue_name, "Creating new reply queue");
        self.queue.create_queue(&queue_name).await.map_err(|e| {
            tracing::error!(queue = %queue_name, "Failed to create reply queue: {e}");
            SessionError::CreateQueue(e)
        })?;

        if let Err(e) = self.store.save(&Session::new(queue_name.clone())).await {
            tracing::error!(queue = %queue_name, "Failed to save session: {e}");
            // Unrecorded, nobody would ever reuse or delete it.
            if let Err(e) = self.queue.delete_queue(&queue_name).await {
                tracing::warn!(queue = %queue_name, "Failed to delete unrecorded queue: {e}");
            }
            return Err(e.into());
        }

        tracing::info!(queue = %queue_name, "Reply queue created and session saved");
        Ok(queue_name)
    }

    /// Delete the recorded queue and remove the record.
    ///
    /// # Errors
    /// Returns error if the record cannot be removed. Failing to delete the
    /// queue is only logged.
    pub async fn cleanup(&self) -> Result<(), SessionError> {
        match self.store.load().await {
            Ok(Some(session)) => {
                tracing::info!(queue = %session.queue_name, "Deleting queue from stale session");
                if let Err(e) = self.queue.delete_queue(&session.queue_name).await {
                    tracing::warn!(queue = %session.queue_name, "Failed to delete queue: {e}");
                }
            }
            Ok(None) => {
                tracing::info!("No session found, nothing to clean up");
                return Ok(());
            }
            Err(e) => tracing::warn!("Failed to read session during cleanup: {e}"),
        }
        self.store.clear().await?;
        tracing::info!("Stale session cleanup completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use kubegate_transport::{MemoryBroker, MemoryQueue};
    use kubegate_core::PoolConfig;

    use super::*;
    use crate::storage::{FileSessionStore, MemorySessionStore};

    async fn connected_queue(broker: &MemoryBroker) -> Arc<dyn MessageQueue> {
        let queue = Arc::new(MemoryQueue::new(broker.clone(), PoolConfig::default()));
        queue.connect().await.unwrap();
        queue
    }

    fn aged(queue_name: &str, age: TimeDelta) -> Session {
        Session {
            queue_name: queue_name.to_string(),
            timestamp: Utc::now() - age,
        }
    }

    #[tokio::test]
    async fn test_creates_and_records_queue() {
        let broker = MemoryBroker::default();
        let manager = SessionManager::new(MemorySessionStore::new(), connected_queue(&broker).await);

        let name = manager.get_or_create_reply_queue().await.unwrap();

        assert!(name.starts_with("reply-queue-"));
        assert!(broker.has_queue(&name));
        let recorded = manager.store().load().await.unwrap().unwrap();
        assert_eq!(recorded.queue_name, name);
    }

    #[tokio::test]
    async fn test_reuses_queue_within_window() {
        let broker = MemoryBroker::default();
        let store = MemorySessionStore::with_session(aged("reply-queue-old", TimeDelta::minutes(10)));
        let manager = SessionManager::new(store, connected_queue(&broker).await)
            .with_duration(Duration::from_secs(3600));

        assert_eq!(manager.get_or_create_reply_queue().await.unwrap(), "reply-queue-old");
        assert_eq!(manager.get_or_create_reply_queue().await.unwrap(), "reply-queue-old");
        assert!(broker.queue_names().is_empty());
    }

    #[tokio::test]
    async fn test_rotates_expired_session() {
        let broker = MemoryBroker::default();
        let queue = connected_queue(&broker).await;
        queue.create_queue("reply-queue-old").await.unwrap();

        let store = MemorySessionStore::with_session(aged("reply-queue-old", TimeDelta::hours(2)));
        let manager = SessionManager::new(store, queue).with_duration(Duration::from_secs(3600));

        let name = manager.get_or_create_reply_queue().await.unwrap();

        assert_ne!(name, "reply-queue-old");
        assert!(!broker.has_queue("reply-queue-old"));
        assert!(broker.has_queue(&name));
    }

    #[tokio::test]
    async fn test_session_exactly_at_duration_is_expired() {
        let broker = MemoryBroker::default();
        let store = MemorySessionStore::with_session(aged("reply-queue-old", TimeDelta::seconds(60)));
        let manager = SessionManager::new(store, connected_queue(&broker).await)
            .with_duration(Duration::from_secs(60));

        assert_ne!(manager.get_or_create_reply_queue().await.unwrap(), "reply-queue-old");
    }

    #[tokio::test]
    async fn test_corrupt_session_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        std::fs::write(&path, "garbage").unwrap();

        let broker = MemoryBroker::default();
        let manager = SessionManager::new(FileSessionStore::new(&path), connected_queue(&broker).await);

        let name = manager.get_or_create_reply_queue().await.unwrap();
        let saved: Session = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(saved.queue_name, name);
    }

    #[tokio::test]
    async fn test_unwritable_session_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();

        let broker = MemoryBroker::default();
        let manager = SessionManager::new(
            FileSessionStore::new(blocker.join("session.json")),
            connected_queue(&broker).await,
        );

        let err = manager.get_or_create_reply_queue().await.unwrap_err();
        assert!(matches!(err, SessionError::Store(_)));
        assert!(broker.queue_names().is_empty());
    }

    #[tokio::test]
    async fn test_create_failure_is_fatal() {
        let queue: Arc<dyn MessageQueue> =
            Arc::new(MemoryQueue::new(MemoryBroker::default(), PoolConfig::default()));
        let manager = SessionManager::new(MemorySessionStore::new(), queue);

        let err = manager.get_or_create_reply_queue().await.unwrap_err();
        assert!(matches!(err, SessionError::CreateQueue(QueueError::NotConnected)));
        assert!(manager.store().load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_custom_prefix() {
        let broker = MemoryBroker::default();
        let manager = SessionManager::new(MemorySessionStore::new(), connected_queue(&broker).await)
            .with_prefix("team-a-replies")
            .with_prefix("  ");

        let name = manager.get_or_create_reply_queue().await.unwrap();
        assert!(name.starts_with("team-a-replies-"));
    }

    #[tokio::test]
    async fn test_cleanup_removes_queue_and_record() {
        let broker = MemoryBroker::default();
        let manager = SessionManager::new(MemorySessionStore::new(), connected_queue(&broker).await);
        let name = manager.get_or_create_reply_queue().await.unwrap();

        manager.cleanup().await.unwrap();

        assert!(!broker.has_queue(&name));
        assert!(manager.store().load().await.unwrap().is_none());
        tokio_test::assert_ok!(manager.cleanup().await);
    }
}
