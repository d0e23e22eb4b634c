//! In-process message queue backend.
//!
//! Useful for tests and single-process development: every `MemoryQueue`
//! built from the same `MemoryBroker` sees the same queues. Messages are
//! removed only after the handler succeeds; failed ones go back to the
//! tail of their queue.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use kubegate_core::{
    CancellationToken, Message, MessageHandler, MessageQueue, PoolConfig, QueueError, WorkerPool,
    dispatch::Job, run_handler,
};
use tokio::sync::Notify;

use crate::registry::MEMORY;

#[derive(Default)]
struct QueueState {
    messages: Mutex<VecDeque<Message>>,
    notify: Notify,
}

impl QueueState {
    fn push(&self, msg: Message) -> Result<(), QueueError> {
        self.messages
            .lock()
            .map_err(|e| QueueError::Unavailable(e.to_string()))?
            .push_back(msg);
        self.notify.notify_one();
        Ok(())
    }

    fn try_pop(&self) -> Option<Message> {
        self.messages.lock().ok()?.pop_front()
    }

    async fn pop(&self) -> Message {
        loop {
            if let Some(msg) = self.try_pop() {
                return msg;
            }
            self.notify.notified().await;
        }
    }

    fn len(&self) -> usize {
        self.messages.lock().map(|m| m.len()).unwrap_or(0)
    }
}

/// Shared in-process broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    queues: Arc<Mutex<HashMap<String, Arc<QueueState>>>>,
}

impl MemoryBroker {
    fn declare(&self, queue: &str) -> Result<Arc<QueueState>, QueueError> {
        let mut queues = self
            .queues
            .lock()
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(Arc::clone(queues.entry(queue.to_string()).or_default()))
    }

    fn lookup(&self, queue: &str) -> Result<Option<Arc<QueueState>>, QueueError> {
        let queues = self
            .queues
            .lock()
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        Ok(queues.get(queue).cloned())
    }

    fn remove(&self, queue: &str) -> Result<(), QueueError> {
        self.queues
            .lock()
            .map_err(|e| QueueError::Unavailable(e.to_string()))?
            .remove(queue);
        Ok(())
    }

    /// Whether a queue exists.
    #[must_use]
    pub fn has_queue(&self, queue: &str) -> bool {
        self.lookup(queue).ok().flatten().is_some()
    }

    /// Number of messages waiting in a queue.
    #[must_use]
    pub fn depth(&self, queue: &str) -> usize {
        self.lookup(queue)
            .ok()
            .flatten()
            .map_or(0, |state| state.len())
    }

    /// Remove the head of a queue without waiting.
    #[must_use]
    pub fn try_take(&self, queue: &str) -> Option<Message> {
        self.lookup(queue).ok().flatten()?.try_pop()
    }

    /// Wait for the head of a queue. `None` if the queue does not exist.
    pub async fn take(&self, queue: &str) -> Option<Message> {
        let state = self.lookup(queue).ok().flatten()?;
        Some(state.pop().await)
    }

    /// Names of all existing queues, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .queues
            .lock()
            .map(|q| q.keys().cloned().collect())
            .unwrap_or_default();
        names.sort_unstable();
        names
    }
}

/// Message queue backed by a [`MemoryBroker`].
pub struct MemoryQueue {
    broker: MemoryBroker,
    pool: PoolConfig,
    connected: AtomicBool,
}

impl MemoryQueue {
    /// Create a backend attached to `broker`.
    #[must_use]
    pub const fn new(broker: MemoryBroker, pool: PoolConfig) -> Self {
        Self {
            broker,
            pool,
            connected: AtomicBool::new(false),
        }
    }

    /// The broker this backend talks to.
    #[must_use]
    pub const fn broker(&self) -> &MemoryBroker {
        &self.broker
    }

    fn ensure_connected(&self) -> Result<(), QueueError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::NotConnected)
        }
    }
}

fn delivery_job(
    queue: String,
    state: Arc<QueueState>,
    handler: MessageHandler,
    message: Message,
) -> Job {
    Box::pin(async move {
        if let Err(e) = run_handler(&handler, message.clone()).await {
            tracing::error!(
                queue = %queue,
                correlation_id = %message.correlation_id,
                "Failed to process message, requeueing: {e}"
            );
            if let Err(e) = state.push(message) {
                tracing::error!(queue = %queue, "Failed to requeue message: {e}");
            }
        }
    })
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    fn kind(&self) -> &'static str {
        MEMORY
    }

    async fn connect(&self) -> Result<(), QueueError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.ensure_connected()?;
        self.broker.declare(queue)?;
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.ensure_connected()?;
        self.broker.remove(queue)
    }

    async fn send_message(
        &self,
        queue: &str,
        body: &str,
        correlation_id: &str,
        reply_to: &str,
    ) -> Result<(), QueueError> {
        self.ensure_connected()?;
        self.broker
            .declare(queue)?
            .push(Message::request(body, correlation_id, reply_to))?;
        tracing::info!(queue = %queue, correlation_id = %correlation_id, "Message sent to queue");
        Ok(())
    }

    async fn receive_messages(
        &self,
        queue: &str,
        handler: MessageHandler,
        cancel: CancellationToken,
    ) -> Result<(), QueueError> {
        self.ensure_connected()?;
        let state = self.broker.declare(queue)?;
        let pool = WorkerPool::new(self.pool);
        tracing::info!(queue = %queue, "Started listening to queue");

        let outcome = loop {
            let message = tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                message = state.pop() => message,
            };
            let job = delivery_job(
                queue.to_string(),
                Arc::clone(&state),
                Arc::clone(&handler),
                message,
            );
            if let Err(e) = pool.submit(job).await {
                break Err(e);
            }
        };

        pool.shutdown().await;
        tracing::info!(queue = %queue, "Stopped listening to queue");
        outcome
    }

    async fn publish_response(
        &self,
        reply_to: &str,
        correlation_id: &str,
        body: &str,
    ) -> Result<(), QueueError> {
        self.ensure_connected()?;
        // Like the AMQP default exchange: unroutable responses are dropped.
        match self.broker.lookup(reply_to)? {
            Some(state) => {
                state.push(Message::response(body, correlation_id))?;
                tracing::info!(
                    reply_queue = %reply_to,
                    correlation_id = %correlation_id,
                    "Response published to reply queue"
                );
            }
            None => tracing::warn!(
                reply_queue = %reply_to,
                correlation_id = %correlation_id,
                "Reply queue does not exist, dropping response"
            ),
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
