//! AWS SQS backend.
//!
//! Queue names resolve to queue URLs through `GetQueueUrl`/`CreateQueue`
//! and are cached for the lifetime of the backend. Correlation id and reply
//! queue travel as the `CorrelationID` and `ReplyTo` string attributes.
//! Messages are long-polled and deleted only once the handler succeeded;
//! anything else becomes visible again when its visibility timeout lapses.

use std::{
    collections::HashMap,
    sync::{Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_sqs::{Client, error::DisplayErrorContext, types::MessageAttributeValue};
use kubegate_core::{
    CancellationToken, Message, MessageHandler, MessageQueue, PoolConfig, QueueError, WorkerPool,
    dispatch::Job, run_handler,
};

use crate::registry::SQS;

/// Attribute carrying the correlation id.
pub const CORRELATION_ATTR: &str = "CorrelationID";
/// Attribute carrying the reply queue.
pub const REPLY_TO_ATTR: &str = "ReplyTo";

/// Upper bound SQS accepts for a receive batch.
const MAX_BATCH: i32 = 10;
/// Upper bound SQS accepts for a long-poll wait, in seconds.
const MAX_WAIT_SECS: i32 = 20;

/// AWS SQS message queue backend.
pub struct Sqs {
    endpoint: Option<String>,
    pool: PoolConfig,
    long_poll: Duration,
    client: RwLock<Option<Client>>,
    urls: Mutex<HashMap<String, String>>,
}

impl Sqs {
    /// Create an unconnected backend.
    ///
    /// A non-empty `endpoint` overrides the regional SQS endpoint, e.g. for
    /// LocalStack.
    #[must_use]
    pub fn new(endpoint: &str, pool: PoolConfig, long_poll: Duration) -> Self {
        let endpoint = endpoint.trim();
        Self {
            endpoint: (!endpoint.is_empty()).then(|| endpoint.to_string()),
            pool,
            long_poll,
            client: RwLock::new(None),
            urls: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self) -> Result<Client, QueueError> {
        self.client
            .read()
            .map_err(|e| QueueError::Unavailable(e.to_string()))?
            .clone()
            .ok_or(QueueError::NotConnected)
    }

    fn wait_seconds(&self) -> i32 {
        i32::try_from(self.long_poll.as_secs())
            .unwrap_or(MAX_WAIT_SECS)
            .min(MAX_WAIT_SECS)
    }

    fn cached_url(&self, queue: &str) -> Option<String> {
        self.urls.lock().ok()?.get(queue).cloned()
    }

    fn forget_url(&self, queue: &str) {
        if let Ok(mut urls) = self.urls.lock() {
            urls.remove(queue);
        }
    }

    /// Resolve a queue name to its URL, creating the queue if `create`.
    async fn queue_url(&self, client: &Client, queue: &str, create: bool) -> Result<String, QueueError> {
        if let Some(url) = literal_url(queue) {
            return Ok(url.to_string());
        }
        if let Some(url) = self.cached_url(queue) {
            return Ok(url);
        }

        let url = if create {
            client
                .create_queue()
                .queue_name(queue)
                .send()
                .await
                .map_err(|e| sdk_error(&format!("failed to create queue {queue}"), e))?
                .queue_url()
                .map(str::to_string)
        } else {
            client
                .get_queue_url()
                .queue_name(queue)
                .send()
                .await
                .map_err(|e| sdk_error(&format!("failed to resolve queue {queue}"), e))?
                .queue_url()
                .map(str::to_string)
        };
        let url = url.ok_or_else(|| QueueError::Unavailable(format!("no URL returned for queue {queue}")))?;

        if let Ok(mut urls) = self.urls.lock() {
            urls.insert(queue.to_string(), url.clone());
        }
        Ok(url)
    }
}

/// Queue references that already are URLs are used as-is.
fn literal_url(queue: &str) -> Option<&str> {
    (queue.starts_with("https://") || queue.starts_with("http://")).then_some(queue)
}

fn sdk_error(context: &str, err: impl std::error::Error) -> QueueError {
    QueueError::Unavailable(format!("{context}: {}", DisplayErrorContext(err)))
}

fn string_attribute(value: &str) -> Result<MessageAttributeValue, QueueError> {
    MessageAttributeValue::builder()
        .data_type("String")
        .string_value(value)
        .build()
        .map_err(|e| QueueError::Unavailable(format!("invalid message attribute: {e}")))
}

fn decode(msg: &aws_sdk_sqs::types::Message) -> Message {
    let attribute = |name: &str| {
        msg.message_attributes()
            .and_then(|attributes| attributes.get(name))
            .and_then(MessageAttributeValue::string_value)
            .unwrap_or_default()
            .to_string()
    };
    Message {
        body: msg.body().unwrap_or_default().to_string(),
        correlation_id: attribute(CORRELATION_ATTR),
        reply_to: attribute(REPLY_TO_ATTR),
    }
}

fn delivery_job(
    client: Client,
    queue_url: String,
    handler: MessageHandler,
    message: Message,
    receipt_handle: Option<String>,
) -> Job {
    Box::pin(async move {
        let correlation_id = message.correlation_id.clone();
        if let Err(e) = run_handler(&handler, message).await {
            tracing::error!(
                queue = %queue_url,
                correlation_id = %correlation_id,
                "Failed to process message, leaving it for redelivery: {e}"
            );
            return;
        }

        let Some(receipt_handle) = receipt_handle else {
            tracing::warn!(correlation_id = %correlation_id, "Message has no receipt handle");
            return;
        };
        if let Err(e) = client
            .delete_message()
            .queue_url(&queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
        {
            tracing::error!(
                queue = %queue_url,
                correlation_id = %correlation_id,
                "Failed to delete message: {}",
                DisplayErrorContext(e)
            );
        }
    })
}

#[async_trait]
impl MessageQueue for Sqs {
    fn kind(&self) -> &'static str {
        SQS
    }

    async fn connect(&self) -> Result<(), QueueError> {
        if self.client().is_ok() {
            return Ok(());
        }

        let shared = aws_config::defaults(BehaviorVersion::latest()).load().await;
        if shared.region().is_none() {
            tracing::error!("No AWS region configured");
            return Err(QueueError::Unavailable(
                "no AWS region configured (set AWS_REGION)".to_string(),
            ));
        }

        let mut builder = aws_sdk_sqs::config::Builder::from(&shared);
        if let Some(endpoint) = &self.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        *self
            .client
            .write()
            .map_err(|e| QueueError::Unavailable(e.to_string()))? =
            Some(Client::from_conf(builder.build()));

        tracing::info!(endpoint = ?self.endpoint, "Connected to SQS");
        Ok(())
    }

    async fn create_queue(&self, queue: &str) -> Result<(), QueueError> {
        let client = self.client()?;
        let url = self.queue_url(&client, queue, true).await?;
        tracing::info!(queue = %queue, url = %url, "Queue created");
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), QueueError> {
        let client = self.client()?;
        let url = self.queue_url(&client, queue, false).await?;
        client
            .delete_queue()
            .queue_url(&url)
            .send()
            .await
            .map_err(|e| sdk_error(&format!("failed to delete queue {queue}"), e))?;
        self.forget_url(queue);
        tracing::info!(queue = %queue, "Queue deleted");
        Ok(())
    }

    async fn send_message(
        &self,
        queue: &str,
        body: &str,
        correlation_id: &str,
        reply_to: &str,
    ) -> Result<(), QueueError> {
        let client = self.client()?;
        let url = self.queue_url(&client, queue, true).await?;

        let mut request = client
            .send_message()
            .queue_url(url)
            .message_body(body)
            .message_attributes(CORRELATION_ATTR, string_attribute(correlation_id)?);
        // SQS rejects empty attribute values.
        if !reply_to.is_empty() {
            request = request.message_attributes(REPLY_TO_ATTR, string_attribute(reply_to)?);
        }
        request
            .send()
            .await
            .map_err(|e| sdk_error("failed to send message", e))?;

        tracing::info!(queue = %queue, correlation_id = %correlation_id, "Message sent to queue");
        Ok(())
    }

    async fn receive_messages(
        &self,
        queue: &str,
        handler: MessageHandler,
        cancel: CancellationToken,
    ) -> Result<(), QueueError> {
        let client = self.client()?;
        let url = self.queue_url(&client, queue, true).await?;
        let pool = WorkerPool::new(self.pool);
        tracing::info!(queue = %queue, "Started listening to queue");

        let outcome = 'drain: loop {
            let request = client
                .receive_message()
                .queue_url(&url)
                .max_number_of_messages(MAX_BATCH)
                .wait_time_seconds(self.wait_seconds())
                .message_attribute_names("All");

            let received = tokio::select! {
                () = cancel.cancelled() => break 'drain Ok(()),
                received = request.send() => received,
            };
            let output = match received {
                Ok(output) => output,
                Err(e) => break 'drain Err(sdk_error("failed to receive messages", e)),
            };

            for msg in output.messages() {
                let job = delivery_job(
                    client.clone(),
                    url.clone(),
                    handler.clone(),
                    decode(msg),
                    msg.receipt_handle().map(str::to_string),
                );
                if let Err(e) = pool.submit(job).await {
                    break 'drain Err(e);
                }
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
        let client = self.client()?;
        let url = self.queue_url(&client, reply_to, false).await?;
        client
            .send_message()
            .queue_url(url)
            .message_body(body)
            .message_attributes(CORRELATION_ATTR, string_attribute(correlation_id)?)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(
                    reply_queue = %reply_to,
                    correlation_id = %correlation_id,
                    "Failed to publish response: {}",
                    DisplayErrorContext(&e)
                );
                sdk_error("failed to send response", e)
            })?;

        tracing::info!(
            reply_queue = %reply_to,
            correlation_id = %correlation_id,
            "Response published to reply queue"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        // HTTP based: dropping the client is all there is to release.
        self.client
            .write()
            .map_err(|e| QueueError::Unavailable(e.to_string()))?
            .take();
        if let Ok(mut urls) = self.urls.lock() {
            urls.clear();
        }
        Ok(())
    }
}
