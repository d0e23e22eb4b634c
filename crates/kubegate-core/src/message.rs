//! Message type carried over every transport.

use serde::{Deserialize, Serialize};

/// A message drained from a queue.
///
/// The correlation id and reply destination travel as protocol metadata
/// (AMQP properties, SQS message attributes), never inside the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// UTF-8 payload: the command line on requests, the output on responses.
    pub body: String,
    /// Token pairing a request with its response.
    pub correlation_id: String,
    /// Queue the response should be published to. Empty on responses.
    #[serde(default)]
    pub reply_to: String,
}

impl Message {
    /// Create a request message.
    #[must_use]
    pub fn request(
        body: impl Into<String>,
        correlation_id: impl Into<String>,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            body: body.into(),
            correlation_id: correlation_id.into(),
            reply_to: reply_to.into(),
        }
    }

    /// Create a response message.
    #[must_use]
    pub fn response(body: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            correlation_id: correlation_id.into(),
            reply_to: String::new(),
        }
    }

    /// Whether the sender asked for a reply.
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        !self.reply_to.is_empty()
    }
}
