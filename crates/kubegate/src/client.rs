//! Client side of a kubectl invocation.

use std::{sync::Arc, time::Duration};

use kubegate_core::{Correlator, MessageQueue, QueueError, RpcError};
use kubegate_executor::{FileArgError, encode_file_args};
use kubegate_session::{SessionError, SessionManager, SessionStore};
use kubegate_transport::{BackendOptions, BackendRegistry};
use thiserror::Error;

use crate::config::Context;

/// Client error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("No command given")]
    EmptyCommand,
    #[error("Context {0} has no command queue")]
    NoCommandQueue(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    FileArg(#[from] FileArgError),
}

/// Sends kubectl commands for one context and waits for their output.
pub struct Client<S>
where
    S: SessionStore,
{
    queue: Arc<dyn MessageQueue>,
    sessions: SessionManager<S>,
    correlator: Correlator,
    command_queue: String,
}

impl<S> Client<S>
where
    S: SessionStore,
{
    /// Build the context's backend and connect it.
    ///
    /// # Errors
    /// Returns error if the backend is unknown or the broker unreachable.
    pub async fn connect(
        registry: &BackendRegistry,
        context: &Context,
        store: S,
    ) -> Result<Self, ClientError> {
        if context.command_queue.is_empty() {
            return Err(ClientError::NoCommandQueue(context.name.clone()));
        }
        let queue = registry.create(&context.backend, &BackendOptions::new(&context.rabbitmq_url))?;
        queue.connect().await.inspect_err(|e| {
            tracing::error!(backend = %context.backend, "Failed to connect: {e}");
        })?;
        Ok(Self::new(queue, context, store))
    }

    /// Build a client over an already connected backend.
    #[must_use]
    pub fn new(queue: Arc<dyn MessageQueue>, context: &Context, store: S) -> Self {
        let sessions =
            SessionManager::new(store, Arc::clone(&queue)).with_prefix(&context.reply_queue);
        Self {
            correlator: Correlator::new(Arc::clone(&queue)),
            queue,
            sessions,
            command_queue: context.command_queue.clone(),
        }
    }

    /// Override the response deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.correlator = self.correlator.with_timeout(timeout);
        self
    }

    /// Override how long a reply queue is reused.
    #[must_use]
    pub fn with_session_duration(mut self, duration: Duration) -> Self {
        self.sessions = self.sessions.with_duration(duration);
        self
    }

    /// The session manager handing out reply queues.
    pub const fn sessions(&self) -> &SessionManager<S> {
        &self.sessions
    }

    /// Run `kubectl <args>` on the agent and return its output.
    ///
    /// Local files passed with `-f`/`--filename` are sent inline.
    ///
    /// # Errors
    /// Returns error if a file cannot be read, no reply queue is available,
    /// or the call fails or times out.
    pub async fn run(&self, args: &[String]) -> Result<String, ClientError> {
        let args = encode_file_args(args)?;
        let (command, rest) = args.split_first().ok_or(ClientError::EmptyCommand)?;
        let reply_queue = self.sessions.get_or_create_reply_queue().await?;
        tracing::info!(
            command = %command,
            command_queue = %self.command_queue,
            reply_queue = %reply_queue,
            "Sending command to agent"
        );
        let response = self
            .correlator
            .call(&self.command_queue, &reply_queue, command, rest)
            .await?;
        Ok(response)
    }

    /// Release the broker connection.
    ///
    /// # Errors
    /// Returns error if the backend fails to close.
    pub async fn close(&self) -> Result<(), ClientError> {
        Ok(self.queue.close().await?)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{TimeDelta, Utc};
    use kubegate_core::CancellationToken;
    use kubegate_executor::{Agent, CommandExecutor, ExecError};
    use kubegate_session::{FileSessionStore, MemorySessionStore, Session};
    use kubegate_transport::registry::MEMORY;

    use super::*;

    struct FakeKubectl;

    #[async_trait]
    impl CommandExecutor for FakeKubectl {
        async fn execute(&self, command: &str) -> Result<String, ExecError> {
            if command == "get pods" {
                Ok("pod-a  Running\npod-b  Running".to_string())
            } else {
                Ok(format!("ran: {command}"))
            }
        }
    }

    fn context() -> Context {
        Context {
            name: "test".to_string(),
            rabbitmq_url: String::new(),
            command_queue: "cmds".to_string(),
            reply_queue: "reply-queue".to_string(),
            backend: MEMORY.to_string(),
        }
    }

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    async fn start_agent(registry: &BackendRegistry) -> CancellationToken {
        let queue = registry.create(MEMORY, &BackendOptions::new("")).unwrap();
        queue.connect().await.unwrap();
        let agent = Agent::new(queue, Arc::new(FakeKubectl), "cmds");
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        tokio::spawn(async move { agent.run(token).await });
        cancel
    }

    #[tokio::test]
    async fn test_get_pods_end_to_end() {
        let registry = BackendRegistry::with_defaults();
        let agent = start_agent(&registry).await;

        let client = Client::connect(&registry, &context(), MemorySessionStore::new())
            .await
            .unwrap()
            .with_timeout(Duration::from_secs(5));
        let output = client.run(&args(&["get", "pods"])).await.unwrap();

        assert_eq!(output, "pod-a  Running\npod-b  Running");
        let session = client.sessions().store().load().await.unwrap().unwrap();
        assert!(session.queue_name.starts_with("reply-queue-"));
        agent.cancel();
    }

    #[tokio::test]
    async fn test_sequential_invocations_reuse_reply_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let registry = BackendRegistry::with_defaults();
        let agent = start_agent(&registry).await;

        let mut names = Vec::new();
        for _ in 0..2 {
            let client = Client::connect(&registry, &context(), FileSessionStore::new(&path))
                .await
                .unwrap()
                .with_timeout(Duration::from_secs(5));
            assert_eq!(client.run(&args(&["get", "ns"])).await.unwrap(), "ran: get ns");
            names.push(client.sessions().store().load().await.unwrap().unwrap().queue_name);
            client.close().await.unwrap();
        }
        assert_eq!(names[0], names[1]);

        // Age the record past the session window.
        let stale = Session {
            queue_name: names[0].clone(),
            timestamp: Utc::now() - TimeDelta::hours(2),
        };
        FileSessionStore::new(&path).save(&stale).await.unwrap();

        let client = Client::connect(&registry, &context(), FileSessionStore::new(&path))
            .await
            .unwrap()
            .with_timeout(Duration::from_secs(5));
        client.run(&args(&["get", "ns"])).await.unwrap();
        let rotated = client.sessions().store().load().await.unwrap().unwrap().queue_name;
        assert_ne!(rotated, names[0]);
        agent.cancel();
    }

    #[tokio::test]
    async fn test_timeout_without_agent() {
        let registry = BackendRegistry::with_defaults();
        let client = Client::connect(&registry, &context(), MemorySessionStore::new())
            .await
            .unwrap()
            .with_timeout(Duration::from_millis(100));

        let err = client.run(&args(&["get", "pods"])).await.unwrap_err();
        assert!(matches!(err, ClientError::Rpc(ref e) if e.is_timeout()));
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let registry = BackendRegistry::with_defaults();

        let mut ctx = context();
        ctx.backend = "unknown-backend".to_string();
        let err = Client::connect(&registry, &ctx, MemorySessionStore::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Queue(QueueError::UnknownBackend(_))));

        let mut ctx = context();
        ctx.command_queue.clear();
        let err = Client::connect(&registry, &ctx, MemorySessionStore::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::NoCommandQueue(_)));

        let client = Client::connect(&registry, &context(), MemorySessionStore::new())
            .await
            .unwrap();
        assert!(matches!(client.run(&[]).await, Err(ClientError::EmptyCommand)));
    }
}
