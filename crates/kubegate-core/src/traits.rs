//! Core traits for message queue backends.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::Message;

/// Queue error.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Connecting, publishing or consuming against the broker failed.
    #[error("Transport unavailable: {0}")]
    Unavailable(String),
    /// An operation was attempted before `connect` succeeded.
    #[error("Not connected to the message broker")]
    NotConnected,
    /// The configured backend identifier is not registered.
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),
    /// The backend identifier is reserved but has no implementation.
    #[error("{0} backend not implemented yet")]
    NotImplemented(String),
    /// A message handler returned an error or panicked.
    #[error("Handler failed: {0}")]
    Handler(String),
}

impl QueueError {
    /// Create an `Unavailable` error from anything printable.
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }

    /// Whether this error means the broker could not be reached or used.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::NotConnected)
    }
}

/// Result returned by a message handler.
pub type HandlerResult = Result<(), QueueError>;

/// Callback invoked once per drained message.
///
/// Returning `Ok` acknowledges the message. Returning `Err` (or panicking)
/// hands it back to the broker for redelivery.
pub type MessageHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wrap an async closure into a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |msg| Box::pin(f(msg)))
}

/// Trait for message queue backends.
///
/// All methods take `&self`; implementations synchronise their connection
/// state internally so a backend can be shared through an `Arc` between a
/// publisher and a concurrently running drain.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Backend identifier, e.g. `rabbitmq`.
    fn kind(&self) -> &'static str;

    /// Establish the connection to the broker.
    ///
    /// Calling it again after a successful connect is a no-op. On failure no
    /// partially opened handle is retained.
    async fn connect(&self) -> Result<(), QueueError>;

    /// Create a queue if it does not exist.
    async fn create_queue(&self, queue: &str) -> Result<(), QueueError>;

    /// Delete a queue.
    async fn delete_queue(&self, queue: &str) -> Result<(), QueueError>;

    /// Publish a request, creating the target queue first if needed.
    async fn send_message(
        &self,
        queue: &str,
        body: &str,
        correlation_id: &str,
        reply_to: &str,
    ) -> Result<(), QueueError>;

    /// Drain a queue until `cancel` fires, dispatching every message to
    /// `handler` on the backend's worker pool.
    ///
    /// Returns `Ok(())` once cancelled and all in-flight handlers finished,
    /// or an error if the transport fails while consuming.
    async fn receive_messages(
        &self,
        queue: &str,
        handler: MessageHandler,
        cancel: CancellationToken,
    ) -> Result<(), QueueError>;

    /// Publish a response to a reply queue.
    async fn publish_response(
        &self,
        reply_to: &str,
        correlation_id: &str,
        body: &str,
    ) -> Result<(), QueueError>;

    /// Release channel and connection resources. Closing an already closed
    /// backend succeeds.
    async fn close(&self) -> Result<(), QueueError>;
}
