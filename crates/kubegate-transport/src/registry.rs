//! Backend registry: maps backend identifiers to constructors.
//!
//! Constructing a backend never touches the network; callers run
//! `connect` on the returned instance themselves.

use std::{collections::HashMap, sync::Arc, time::Duration};

use kubegate_core::{MessageQueue, PoolConfig, QueueError};

/// Identifier of the RabbitMQ backend.
pub const RABBITMQ: &str = "rabbitmq";
/// Identifier of the AWS SQS backend.
pub const SQS: &str = "sqs";
/// Identifier of the in-process backend.
pub const MEMORY: &str = "memory";
/// Reserved identifier for Google Cloud Pub/Sub.
pub const PUBSUB: &str = "pubsub";
/// Reserved identifier for Azure Service Bus.
pub const AZURE: &str = "azure";

/// Default SQS long-poll wait.
pub const DEFAULT_LONG_POLL: Duration = Duration::from_secs(20);

/// Settings handed to a backend constructor.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Broker URL (AMQP URI, or SQS endpoint override).
    pub url: String,
    /// Handler pool used by `receive_messages`.
    pub pool: PoolConfig,
    /// Long-poll wait for backends that poll.
    pub long_poll: Duration,
}

impl BackendOptions {
    /// Options with default pool sizing.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool: PoolConfig::default(),
            long_poll: DEFAULT_LONG_POLL,
        }
    }

    /// Override the handler pool.
    #[must_use]
    pub const fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }
}

/// Constructor stored in the registry.
pub type BackendConstructor =
    Box<dyn Fn(&BackendOptions) -> Result<Arc<dyn MessageQueue>, QueueError> + Send + Sync>;

/// Registry of backend constructors keyed by identifier.
pub struct BackendRegistry {
    constructors: HashMap<String, BackendConstructor>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl BackendRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Registry with every built-in backend.
    ///
    /// `pubsub` and `azure` are registered but always fail with
    /// `NotImplemented`. All `memory` backends created from one registry
    /// share a single in-process broker.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        #[cfg(feature = "rabbitmq")]
        registry.register(RABBITMQ, |options| {
            let backend: Arc<dyn MessageQueue> =
                Arc::new(crate::rabbitmq::RabbitMq::new(&options.url, options.pool));
            Ok(backend)
        });

        #[cfg(feature = "sqs")]
        registry.register(SQS, |options| {
            let backend: Arc<dyn MessageQueue> = Arc::new(crate::sqs::Sqs::new(
                &options.url,
                options.pool,
                options.long_poll,
            ));
            Ok(backend)
        });

        #[cfg(feature = "memory")]
        {
            let broker = crate::memory::MemoryBroker::default();
            registry.register(MEMORY, move |options| {
                let backend: Arc<dyn MessageQueue> = Arc::new(crate::memory::MemoryQueue::new(
                    broker.clone(),
                    options.pool,
                ));
                Ok(backend)
            });
        }

        registry.register(PUBSUB, |_| {
            Err(QueueError::NotImplemented("Pub/Sub".to_string()))
        });
        registry.register(AZURE, |_| {
            Err(QueueError::NotImplemented("Azure Service Bus".to_string()))
        });

        registry
    }

    /// Register (or replace) a constructor.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(&BackendOptions) -> Result<Arc<dyn MessageQueue>, QueueError> + Send + Sync + 'static,
    {
        self.constructors.insert(name.into(), Box::new(constructor));
        self
    }

    /// Whether an identifier is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered identifiers, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Construct an unconnected backend.
    ///
    /// # Errors
    /// Returns `UnknownBackend` for unregistered identifiers and whatever the
    /// constructor returns otherwise (`NotImplemented` for reserved ones).
    pub fn create(
        &self,
        name: &str,
        options: &BackendOptions,
    ) -> Result<Arc<dyn MessageQueue>, QueueError> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| QueueError::UnknownBackend(name.to_string()))?;
        let backend = constructor(options)?;
        tracing::debug!(backend = %name, "Constructed message queue backend");
        Ok(backend)
    }
}
