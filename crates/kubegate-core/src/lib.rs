//! Core messaging abstractions for KubeGate.
//!
//! This crate provides the fundamental building blocks:
//! - `Message` - A request or response drained from a queue
//! - `MessageQueue` - Capability set every broker backend implements
//! - `WorkerPool` - Bounded handler dispatch with backpressure
//! - `Correlator` - Request/response calls over a queue with a timeout

pub mod correlator;
pub mod dispatch;
pub mod message;
pub mod traits;

pub use correlator::{Correlator, DEFAULT_RESPONSE_TIMEOUT, RpcError};
pub use dispatch::{PoolConfig, WorkerPool, run_handler};
pub use message::Message;
pub use traits::{HandlerResult, MessageHandler, MessageQueue, QueueError, handler_fn};

/// Re-exported so backends and callers share one cancellation type.
pub use tokio_util::sync::CancellationToken;
