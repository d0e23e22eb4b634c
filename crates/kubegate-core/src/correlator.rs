//! Request/response correlation over a message queue.
//!
//! A call publishes the command with a fresh correlation id and the
//! caller's reply queue, then drains the reply queue on a separate task
//! until a response carrying the same id shows up or the deadline passes.
//! Responses carrying any other id are dropped.

use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    sync::{Mutex, oneshot},
    task::JoinError,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    Message,
    traits::{HandlerResult, MessageHandler, MessageQueue, QueueError, handler_fn},
};

/// Default time to wait for the agent's response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Time the reply listener gets to stop after the call finished.
const LISTENER_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Correlated call error.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] QueueError),
    #[error("Timed out after {timeout:?} waiting for response {correlation_id}")]
    Timeout {
        correlation_id: String,
        timeout: Duration,
    },
    #[error("Reply listener stopped before a response arrived")]
    ListenerClosed,
}

impl RpcError {
    /// Whether the call failed because no response arrived in time.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

enum Wake {
    Response(Result<String, oneshot::error::RecvError>),
    ListenerExited(Result<HandlerResult, JoinError>),
    Deadline,
}

/// Client side of the request/response protocol.
///
/// Calls on one instance are serialised: only the most recently sent
/// request is ever waited for.
pub struct Correlator {
    queue: Arc<dyn MessageQueue>,
    timeout: Duration,
    in_flight: Mutex<()>,
}

impl Correlator {
    /// Create a correlator over a connected backend.
    #[must_use]
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            queue,
            timeout: DEFAULT_RESPONSE_TIMEOUT,
            in_flight: Mutex::new(()),
        }
    }

    /// Override the response deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Configured response deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Join a command and its arguments with single spaces.
    #[must_use]
    pub fn compose_command(command: &str, args: &[String]) -> String {
        std::iter::once(command)
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Send `command args...` to `command_queue` and wait for its output.
    ///
    /// # Errors
    /// Returns `RpcError::Timeout` if no matching response arrives in time,
    /// `RpcError::Transport` if publishing or draining the reply queue fails.
    pub async fn call(
        &self,
        command_queue: &str,
        reply_queue: &str,
        command: &str,
        args: &[String],
    ) -> Result<String, RpcError> {
        let body = Self::compose_command(command, args);
        self.request(command_queue, reply_queue, &body).await
    }

    /// Send a raw request body and wait for the correlated response.
    ///
    /// # Errors
    /// See [`Correlator::call`].
    pub async fn request(
        &self,
        command_queue: &str,
        reply_queue: &str,
        body: &str,
    ) -> Result<String, RpcError> {
        let _guard = self.in_flight.lock().await;
        let correlation_id = Uuid::new_v4().to_string();

        let (tx, mut rx) = oneshot::channel();
        let handler = response_handler(correlation_id.clone(), tx);

        // The listener is started before publishing so a fast agent cannot
        // answer before anyone is draining the reply queue.
        let cancel = CancellationToken::new();
        let mut listener = {
            let queue = Arc::clone(&self.queue);
            let reply_queue = reply_queue.to_string();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.receive_messages(&reply_queue, handler, cancel).await })
        };

        if let Err(e) = self
            .queue
            .send_message(command_queue, body, &correlation_id, reply_queue)
            .await
        {
            tracing::error!(
                queue = %command_queue,
                correlation_id = %correlation_id,
                "Failed to send command: {e}"
            );
            cancel.cancel();
            stop_listener(listener).await;
            return Err(e.into());
        }

        tracing::info!(
            queue = %command_queue,
            reply_queue = %reply_queue,
            correlation_id = %correlation_id,
            "Command sent, waiting for response"
        );

        let wake = tokio::select! {
            biased;
            response = &mut rx => Wake::Response(response),
            joined = &mut listener => Wake::ListenerExited(joined),
            () = tokio::time::sleep(self.timeout) => Wake::Deadline,
        };

        cancel.cancel();

        match wake {
            Wake::Response(Ok(response)) => {
                stop_listener(listener).await;
                tracing::info!(correlation_id = %correlation_id, "Received response");
                Ok(response)
            }
            // The sender lives in the listener's handler, so a failed drain
            // closes the channel before the join handle is polled.
            Wake::Response(Err(_)) => match stop_listener(listener).await {
                Some(e) => {
                    tracing::error!(
                        reply_queue = %reply_queue,
                        correlation_id = %correlation_id,
                        "Reply listener failed: {e}"
                    );
                    Err(RpcError::Transport(e))
                }
                None => Err(RpcError::ListenerClosed),
            },
            Wake::ListenerExited(joined) => {
                // A response may have landed right before the drain ended.
                if let Ok(response) = rx.try_recv() {
                    return Ok(response);
                }
                match joined {
                    Ok(Err(e)) => {
                        tracing::error!(
                            reply_queue = %reply_queue,
                            correlation_id = %correlation_id,
                            "Reply listener failed: {e}"
                        );
                        Err(RpcError::Transport(e))
                    }
                    Ok(Ok(())) => Err(RpcError::ListenerClosed),
                    Err(e) => {
                        tracing::error!(correlation_id = %correlation_id, "Reply listener aborted: {e}");
                        Err(RpcError::ListenerClosed)
                    }
                }
            }
            Wake::Deadline => {
                stop_listener(listener).await;
                tracing::error!(
                    reply_queue = %reply_queue,
                    correlation_id = %correlation_id,
                    "Timed out waiting for response"
                );
                Err(RpcError::Timeout {
                    correlation_id,
                    timeout: self.timeout,
                })
            }
        }
    }
}

fn response_handler(expected: String, tx: oneshot::Sender<String>) -> MessageHandler {
    let slot = Arc::new(std::sync::Mutex::new(Some(tx)));
    handler_fn(move |msg: Message| {
        if msg.correlation_id == expected {
            let sender = slot.lock().ok().and_then(|mut slot| slot.take());
            if let Some(sender) = sender {
                let _ = sender.send(msg.body);
            }
        } else {
            tracing::debug!(
                expected = %expected,
                received = %msg.correlation_id,
                "Skipping response for another request"
            );
        }
        std::future::ready(Ok(()))
    })
}

/// Wait for an already cancelled listener, aborting it if it lingers.
///
/// Returns the transport error the listener ended with, if any.
async fn stop_listener(listener: tokio::task::JoinHandle<HandlerResult>) -> Option<QueueError> {
    let abort = listener.abort_handle();
    match tokio::time::timeout(LISTENER_SHUTDOWN_GRACE, listener).await {
        Ok(Ok(Err(e))) => {
            tracing::debug!("Reply listener ended with error: {e}");
            Some(e)
        }
        Ok(_) => None,
        Err(_) => {
            tracing::warn!("Reply listener did not stop in time, aborting");
            abort.abort();
            None
        }
    }
}
