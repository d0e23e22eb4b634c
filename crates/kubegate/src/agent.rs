//! Agent startup.

use std::sync::Arc;

use kubegate_core::{CancellationToken, QueueError};
use kubegate_executor::{Agent, CommandExecutor};
use kubegate_transport::{BackendOptions, BackendRegistry};

use crate::config::AgentConfig;

/// Connect the configured backend and serve commands until `cancel` fires.
///
/// # Errors
/// Returns error if the backend is unknown, the broker is unreachable, or
/// the drain fails.
pub async fn run_agent(
    registry: &BackendRegistry,
    config: &AgentConfig,
    executor: Arc<dyn CommandExecutor>,
    cancel: CancellationToken,
) -> Result<(), QueueError> {
    let queue = registry.create(&config.backend, &BackendOptions::new(&config.rabbitmq_url))?;
    queue.connect().await.inspect_err(|e| {
        tracing::error!(backend = %config.backend, "Failed to connect: {e}");
    })?;
    tracing::info!(
        backend = %config.backend,
        command_queue = %config.command_queue,
        "Agent started and connected"
    );

    let agent = Agent::new(Arc::clone(&queue), executor, &config.command_queue);
    let result = agent.run(cancel).await;
    if let Err(e) = queue.close().await {
        tracing::warn!("Failed to close connection: {e}");
    }
    result
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use kubegate_executor::ExecError;
    use kubegate_transport::registry::{MEMORY, PUBSUB};

    use super::*;

    struct Echo;

    #[async_trait]
    impl CommandExecutor for Echo {
        async fn execute(&self, command: &str) -> Result<String, ExecError> {
            Ok(command.to_string())
        }
    }

    fn config(backend: &str) -> AgentConfig {
        AgentConfig {
            rabbitmq_url: String::new(),
            command_queue: "cmds".to_string(),
            backend: backend.to_string(),
        }
    }

    #[tokio::test]
    async fn test_reserved_backend_fails_before_serving() {
        let err = run_agent(
            &BackendRegistry::with_defaults(),
            &config(PUBSUB),
            Arc::new(Echo),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, QueueError::NotImplemented(_)));
    }

    #[tokio::test]
    async fn test_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_agent(
                &BackendRegistry::with_defaults(),
                &config(MEMORY),
                Arc::new(Echo),
                cancel,
            ),
        )
        .await
        .unwrap();
        tokio_test::assert_ok!(result);
    }
}
