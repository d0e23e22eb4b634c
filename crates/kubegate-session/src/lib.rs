//! Reply queue sessions for KubeGate clients.
//!
//! Provides:
//! - `SessionManager` - Reuse or rotate the client's reply queue
//! - Storage implementations (JSON file, memory)

pub mod manager;
pub mod storage;

pub use manager::{DEFAULT_QUEUE_PREFIX, DEFAULT_SESSION_DURATION, SessionError, SessionManager};
pub use storage::{FileSessionStore, Session, SessionStore, StoreError};

#[cfg(feature = "memory")]
pub use storage::MemorySessionStore;
