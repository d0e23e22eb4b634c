//! RabbitMQ backend (AMQP 0-9-1 via `lapin`).
//!
//! Requests and responses go through the default exchange with the queue
//! name as routing key. Correlation id and reply queue travel as message
//! properties. Deliveries are acknowledged after the handler succeeds and
//! negatively acknowledged with requeue when it fails or panics.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::StreamExt;
use kubegate_core::{
    CancellationToken, Message, MessageHandler, MessageQueue, PoolConfig, QueueError, WorkerPool,
    dispatch::Job, run_handler,
};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{FieldTable, ShortString},
};
use tokio::sync::Mutex;

use crate::registry::RABBITMQ;

const REPLY_SUCCESS: u16 = 200;
const CONTENT_TYPE: &str = "text/plain";

struct Link {
    connection: Connection,
    channel: Channel,
}

/// RabbitMQ message queue backend.
pub struct RabbitMq {
    url: String,
    pool: PoolConfig,
    link: RwLock<Option<Arc<Link>>>,
    connecting: Mutex<()>,
}

impl RabbitMq {
    /// Create an unconnected backend for an AMQP URI.
    #[must_use]
    pub fn new(url: &str, pool: PoolConfig) -> Self {
        Self {
            url: url.to_string(),
            pool,
            link: RwLock::new(None),
            connecting: Mutex::new(()),
        }
    }

    /// Whether `connect` has succeeded and `close` has not been called.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.link.read().map(|link| link.is_some()).unwrap_or(false)
    }

    fn link(&self) -> Result<Arc<Link>, QueueError> {
        self.link
            .read()
            .map_err(|e| QueueError::Unavailable(e.to_string()))?
            .clone()
            .ok_or(QueueError::NotConnected)
    }

    async fn drain(
        &self,
        channel: &Channel,
        queue: &str,
        handler: &MessageHandler,
        cancel: &CancellationToken,
    ) -> Result<(), QueueError> {
        declare(channel, queue).await?;
        channel
            .basic_qos(self.pool.prefetch(), BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::unavailable(format!("failed to set prefetch: {e}")))?;

        let mut consumer = channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::unavailable(format!("failed to consume messages: {e}")))?;

        tracing::info!(queue = %queue, "Started listening to queue");
        let pool = WorkerPool::new(self.pool);

        let outcome = loop {
            let next = tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                next = consumer.next() => next,
            };
            match next {
                Some(Ok(delivery)) => {
                    let job = delivery_job(queue.to_string(), Arc::clone(handler), delivery);
                    if let Err(e) = pool.submit(job).await {
                        break Err(e);
                    }
                }
                Some(Err(e)) => {
                    break Err(QueueError::unavailable(format!("consumer failed: {e}")));
                }
                None => {
                    break Err(QueueError::Unavailable(format!(
                        "consumer for {queue} was cancelled by the broker"
                    )));
                }
            }
        };

        if outcome.is_ok() {
            let tag = consumer.tag();
            if let Err(e) = channel
                .basic_cancel(tag.as_str(), BasicCancelOptions::default())
                .await
            {
                tracing::debug!(queue = %queue, "Failed to cancel consumer: {e}");
            }
        }

        // Let running handlers ack before the channel goes away.
        pool.shutdown().await;
        tracing::info!(queue = %queue, "Stopped listening to queue");
        outcome
    }
}

async fn declare(channel: &Channel, queue: &str) -> Result<(), QueueError> {
    channel
        .queue_declare(queue, QueueDeclareOptions::default(), FieldTable::default())
        .await
        .map(|_| ())
        .map_err(|e| QueueError::unavailable(format!("failed to declare queue {queue}: {e}")))
}

async fn publish(
    channel: &Channel,
    queue: &str,
    body: &str,
    properties: BasicProperties,
) -> Result<(), QueueError> {
    channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            body.as_bytes(),
            properties,
        )
        .await
        .map_err(|e| QueueError::unavailable(format!("failed to publish message: {e}")))?
        .await
        .map_err(|e| QueueError::unavailable(format!("failed to publish message: {e}")))?;
    Ok(())
}

fn message_properties(correlation_id: &str, reply_to: &str) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type(ShortString::from(CONTENT_TYPE))
        .with_correlation_id(ShortString::from(correlation_id));
    if reply_to.is_empty() {
        properties
    } else {
        properties.with_reply_to(ShortString::from(reply_to))
    }
}

fn decode(delivery: &Delivery) -> Message {
    let properties = &delivery.properties;
    let text = |value: &Option<ShortString>| {
        value
            .as_ref()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default()
    };
    Message {
        body: String::from_utf8_lossy(&delivery.data).into_owned(),
        correlation_id: text(properties.correlation_id()),
        reply_to: text(properties.reply_to()),
    }
}

fn delivery_job(queue: String, handler: MessageHandler, delivery: Delivery) -> Job {
    Box::pin(async move {
        let message = decode(&delivery);
        let correlation_id = message.correlation_id.clone();
        tracing::debug!(
            queue = %queue,
            correlation_id = %correlation_id,
            delivery_tag = delivery.delivery_tag,
            "Message consumed"
        );

        match run_handler(&handler, message).await {
            Ok(()) => {
                if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                    tracing::error!(queue = %queue, correlation_id = %correlation_id, "Failed to ack message: {e}");
                }
            }
            Err(e) => {
                tracing::error!(
                    queue = %queue,
                    correlation_id = %correlation_id,
                    "Failed to process message, requeueing: {e}"
                );
                let options = BasicNackOptions {
                    requeue: true,
                    ..BasicNackOptions::default()
                };
                if let Err(e) = delivery.acker.nack(options).await {
                    tracing::error!(queue = %queue, correlation_id = %correlation_id, "Failed to nack message: {e}");
                }
            }
        }
    })
}

const fn already_closed(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_)
    )
}

#[async_trait]
impl MessageQueue for RabbitMq {
    fn kind(&self) -> &'static str {
        RABBITMQ
    }

    async fn connect(&self) -> Result<(), QueueError> {
        let _guard = self.connecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to RabbitMQ: {e}");
                QueueError::unavailable(format!("failed to connect to RabbitMQ: {e}"))
            })?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "channel open failed").await;
                return Err(QueueError::unavailable(format!("failed to open a channel: {e}")));
            }
        };

        *self
            .link
            .write()
            .map_err(|e| QueueError::Unavailable(e.to_string()))? =
            Some(Arc::new(Link { connection, channel }));
        tracing::info!("Connected to RabbitMQ successfully");
        Ok(())
    }

    async fn create_queue(&self, queue: &str) -> Result<(), QueueError> {
        let link = self.link()?;
        declare(&link.channel, queue).await?;
        tracing::info!(queue = %queue, "Queue declared");
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), QueueError> {
        let link = self.link()?;
        link.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| QueueError::unavailable(format!("failed to delete queue {queue}: {e}")))?;
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
        let link = self.link()?;
        declare(&link.channel, queue).await?;
        publish(
            &link.channel,
            queue,
            body,
            message_properties(correlation_id, reply_to),
        )
        .await?;
        tracing::info!(queue = %queue, correlation_id = %correlation_id, "Message sent to queue");
        Ok(())
    }

    async fn receive_messages(
        &self,
        queue: &str,
        handler: MessageHandler,
        cancel: CancellationToken,
    ) -> Result<(), QueueError> {
        let link = self.link()?;
        // A dedicated channel per drain: closing it hands unacked
        // deliveries back to the broker.
        let channel = link
            .connection
            .create_channel()
            .await
            .map_err(|e| QueueError::unavailable(format!("failed to open a channel: {e}")))?;

        let outcome = self.drain(&channel, queue, &handler, &cancel).await;

        if let Err(e) = channel.close(REPLY_SUCCESS, "consumer stopped").await {
            if !already_closed(&e) {
                tracing::warn!(queue = %queue, "Failed to close consumer channel: {e}");
            }
        }
        outcome
    }

    async fn publish_response(
        &self,
        reply_to: &str,
        correlation_id: &str,
        body: &str,
    ) -> Result<(), QueueError> {
        let link = self.link()?;
        publish(&link.channel, reply_to, body, message_properties(correlation_id, ""))
            .await
            .inspect_err(|e| {
                tracing::error!(
                    reply_queue = %reply_to,
                    correlation_id = %correlation_id,
                    "Failed to publish response: {e}"
                );
            })?;
        tracing::info!(
            reply_queue = %reply_to,
            correlation_id = %correlation_id,
            "Response published to reply queue"
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        let link = self
            .link
            .write()
            .map_err(|e| QueueError::Unavailable(e.to_string()))?
            .take();
        let Some(link) = link else {
            return Ok(());
        };

        let mut result = Ok(());
        if let Err(e) = link.channel.close(REPLY_SUCCESS, "closing").await {
            if !already_closed(&e) {
                tracing::warn!("Failed to close channel: {e}");
                result = Err(QueueError::unavailable(format!("failed to close channel: {e}")));
            }
        }
        if let Err(e) = link.connection.close(REPLY_SUCCESS, "closing").await {
            if !already_closed(&e) {
                tracing::warn!("Failed to close connection: {e}");
                result = Err(QueueError::unavailable(format!("failed to close connection: {e}")));
            }
        }
        tracing::info!("RabbitMQ connection closed");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_properties() {
        let properties = message_properties("c1", "reply-1");
        assert_eq!(
            properties.correlation_id().as_ref().map(ShortString::as_str),
            Some("c1")
        );
        assert_eq!(
            properties.reply_to().as_ref().map(ShortString::as_str),
            Some("reply-1")
        );
        assert_eq!(
            properties.content_type().as_ref().map(ShortString::as_str),
            Some(CONTENT_TYPE)
        );
    }

    #[test]
    fn test_response_properties_omit_reply_to() {
        let properties = message_properties("c1", "");
        assert!(properties.reply_to().is_none());
    }

    #[tokio::test]
    async fn test_operations_require_connect() {
        let queue = RabbitMq::new("amqp://127.0.0.1:1/%2f", PoolConfig::default());
        let err = queue.send_message("cmds", "get pods", "c1", "r").await.unwrap_err();
        assert!(matches!(err, QueueError::NotConnected));
    }

    #[tokio::test]
    async fn test_failed_connect_leaves_no_link() {
        let queue = RabbitMq::new("amqp://127.0.0.1:1/%2f", PoolConfig::default());
        let err = queue.connect().await.unwrap_err();
        assert!(err.is_transport());
        assert!(!queue.is_connected());
    }

    #[tokio::test]
    async fn test_close_without_connect_is_ok() {
        let queue = RabbitMq::new("amqp://127.0.0.1:1/%2f", PoolConfig::default());
        tokio_test::assert_ok!(queue.close().await);
        tokio_test::assert_ok!(queue.close().await);
    }
}
