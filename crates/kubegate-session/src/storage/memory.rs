//! In-memory session storage.

use std::sync::RwLock;

use async_trait::async_trait;

use super::{Session, SessionStore, StoreError};

/// In-memory storage implementation.
///
/// Useful for tests and for clients that should not touch the disk.
/// The record is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    session: RwLock<Option<Session>>,
}

impl MemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `session`.
    #[must_use]
    pub fn with_session(session: Session) -> Self {
        Self {
            session: RwLock::new(Some(session)),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self) -> Result<Option<Session>, StoreError> {
        Ok(self
            .session
            .read()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .clone())
    }

    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        *self
            .session
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))? = Some(session.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.session
            .write()
            .map_err(|e| StoreError::Internal(e.to_string()))?
            .take();
        Ok(())
    }
}
