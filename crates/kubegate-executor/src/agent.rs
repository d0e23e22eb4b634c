//! Agent command loop.
//!
//! Drains the command queue, runs each command through a
//! [`CommandExecutor`] and publishes the output to the request's reply
//! queue under the request's correlation id.

use std::sync::Arc;

use kubegate_core::{
    CancellationToken, HandlerResult, Message, MessageHandler, MessageQueue, QueueError, handler_fn,
};

use crate::kubectl::CommandExecutor;

/// Serves commands arriving on one queue.
pub struct Agent {
    queue: Arc<dyn MessageQueue>,
    executor: Arc<dyn CommandExecutor>,
    command_queue: String,
}

impl Agent {
    /// Create an agent over a connected backend.
    #[must_use]
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        executor: Arc<dyn CommandExecutor>,
        command_queue: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            executor,
            command_queue: command_queue.into(),
        }
    }

    /// The queue this agent drains.
    #[must_use]
    pub fn command_queue(&self) -> &str {
        &self.command_queue
    }

    /// Handler answering one command message.
    #[must_use]
    pub fn handler(&self) -> MessageHandler {
        let queue = Arc::clone(&self.queue);
        let executor = Arc::clone(&self.executor);
        handler_fn(move |message| {
            let queue = Arc::clone(&queue);
            let executor = Arc::clone(&executor);
            async move { handle_command(queue.as_ref(), executor.as_ref(), message).await }
        })
    }

    /// Serve commands until `cancel` fires.
    ///
    /// # Errors
    /// Returns error if the transport fails while draining.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), QueueError> {
        tracing::info!(
            backend = self.queue.kind(),
            command_queue = %self.command_queue,
            "Agent is listening for commands"
        );
        let result = self
            .queue
            .receive_messages(&self.command_queue, self.handler(), cancel)
            .await;
        match &result {
            Ok(()) => tracing::info!(command_queue = %self.command_queue, "Agent stopped"),
            Err(e) => tracing::error!(command_queue = %self.command_queue, "Agent stopped: {e}"),
        }
        result
    }
}

/// Execute a command message and publish the result.
///
/// Execution failures are reported to the client as `Error: <details>`.
/// Only a failed publish fails the handler, so the broker redelivers.
async fn handle_command(
    queue: &dyn MessageQueue,
    executor: &dyn CommandExecutor,
    message: Message,
) -> HandlerResult {
    tracing::info!(
        command = %message.body,
        reply_queue = %message.reply_to,
        correlation_id = %message.correlation_id,
        "Received command from client"
    );

    if !message.expects_reply() {
        tracing::warn!(
            correlation_id = %message.correlation_id,
            "Command has no reply queue, dropping it"
        );
        return Ok(());
    }

    let body = match executor.execute(&message.body).await {
        Ok(output) => output,
        Err(e) => {
            tracing::error!(command = %message.body, "Failed to execute command: {e}");
            format!("Error: {e}")
        }
    };

    queue
        .publish_response(&message.reply_to, &message.correlation_id, &body)
        .await
        .inspect_err(|e| {
            tracing::error!(
                reply_queue = %message.reply_to,
                correlation_id = %message.correlation_id,
                "Failed to send response: {e}"
            );
        })?;

    tracing::info!(
        reply_queue = %message.reply_to,
        correlation_id = %message.correlation_id,
        "Response sent to client"
    );
    Ok(())
}
