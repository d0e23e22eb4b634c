//! Message broker backends for KubeGate.
//!
//! Provides:
//! - `BackendRegistry` - Backend identifier to constructor mapping
//! - RabbitMQ backend (feature: rabbitmq)
//! - AWS SQS backend (feature: sqs)
//! - In-process backend (feature: memory)

pub mod registry;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

#[cfg(feature = "sqs")]
pub mod sqs;

pub use registry::{BackendOptions, BackendRegistry};

#[cfg(feature = "memory")]
pub use memory::{MemoryBroker, MemoryQueue};

#[cfg(feature = "rabbitmq")]
pub use rabbitmq::RabbitMq;

#[cfg(feature = "sqs")]
pub use sqs::Sqs;
