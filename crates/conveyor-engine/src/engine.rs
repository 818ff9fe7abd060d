//! The engine: ownership of all components and the public API.
//!
//! An [`Engine`] is built once at startup from an [`EngineConfig`] and a
//! set of processor registrations, then threaded explicitly through the
//! application (there is no process-wide singleton accessor). It owns the
//! storage adapter, the dispatcher client, the handler registry, and the
//! event bus, and exposes the producer/consumer operations as methods.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use conveyor_core::TaskId;

use crate::config::{EngineConfig, StorageConfig, DEFAULT_MAX_ATTEMPTS};
use crate::consumer::Consumer;
use crate::dispatch::cloud_tasks::{CloudTasksClient, CloudTasksClientConfig};
use crate::dispatch::{DeliveryPayload, DispatcherClient};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus, EventKind, Subscription};
use crate::producer::{AddTaskOutcome, ChainEntry, ChainOptions, ChainOutcome, Producer};
use crate::rate_limit::{RateLimitKey, RateLimitStatus, RateLimiter};
use crate::registry::{HandlerRegistry, ProcessorEntry};
use crate::store::memory::InMemoryStore;
use crate::store::{CleanupPolicy, StorageAdapter, TaskFilter};
use crate::task::{Task, TaskOptions, TaskProgress};

/// Builder for [`Engine`].
///
/// Processors are registered here; once `build` returns, the registry is
/// immutable.
pub struct EngineBuilder {
    config: EngineConfig,
    registry: HandlerRegistry,
    store: Option<Arc<dyn StorageAdapter>>,
    dispatcher: Option<Arc<dyn DispatcherClient>>,
    dispatcher_config: CloudTasksClientConfig,
}

impl std::fmt::Debug for EngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineBuilder")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EngineBuilder {
    /// Starts a builder from a configuration.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let mut dispatcher_config = CloudTasksClientConfig::default();
        if let Some(auth) = &config.auth {
            dispatcher_config.key_filename = auth.key_filename.clone();
            dispatcher_config.credentials = auth.credentials.clone();
        }

        Self {
            config,
            registry: HandlerRegistry::new(),
            store: None,
            dispatcher: None,
            dispatcher_config,
        }
    }

    /// Registers a processor entry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the entry names no queue or defines
    /// no handler.
    pub fn register(mut self, entry: ProcessorEntry) -> Result<Self> {
        self.registry.register(entry)?;
        Ok(self)
    }

    /// Injects a custom storage adapter, overriding the configured
    /// `storage` selection.
    #[must_use]
    pub fn with_storage_adapter(mut self, store: Arc<dyn StorageAdapter>) -> Self {
        self.store = Some(store);
        self
    }

    /// Injects a custom dispatcher client (tests use the in-memory one).
    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn DispatcherClient>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Overrides the Cloud Tasks client configuration.
    #[must_use]
    pub fn with_dispatcher_config(mut self, config: CloudTasksClientConfig) -> Self {
        self.dispatcher_config = config;
        self
    }

    /// Builds the engine: resolves the storage adapter and dispatcher,
    /// and optionally creates dispatcher-side queues.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when a configured backend requires a
    /// cargo feature that is not enabled, and `Backend`-kind errors when
    /// connecting to a backend fails.
    pub async fn build(self) -> Result<Engine> {
        let store: Arc<dyn StorageAdapter> = match (self.store, &self.config.storage) {
            (Some(store), _) => store,
            (None, StorageConfig::Memory) => Arc::new(InMemoryStore::new()),
            (None, StorageConfig::Redis { url, key_prefix }) => {
                build_redis_store(url, key_prefix.clone()).await?
            }
            (None, StorageConfig::Mongo { uri, database }) => {
                build_mongo_store(uri, database).await?
            }
        };

        let dispatcher: Arc<dyn DispatcherClient> = match self.dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(CloudTasksClient::new(self.dispatcher_config).await?),
        };

        let config = Arc::new(self.config);

        if config.auto_create_queues {
            for queue in &config.queues {
                let path = queue.queue_path(&config.project_id, &config.location);
                let max_retries = queue.max_retries.unwrap_or(DEFAULT_MAX_ATTEMPTS);
                if let Err(err) = dispatcher
                    .create_queue(&path, max_retries, queue.retry_delay)
                    .await
                {
                    tracing::warn!(
                        queue = %queue.name,
                        error = %err,
                        "dispatcher queue creation failed"
                    );
                }
            }
        }

        let registry = Arc::new(self.registry);
        let events = EventBus::new();

        let producer = Producer::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            events.clone(),
        );
        let consumer = Consumer::new(Arc::clone(&store), Arc::clone(&registry), events.clone());
        let rate_limiter = RateLimiter::new(Arc::clone(&store));

        Ok(Engine {
            config,
            store,
            events,
            producer,
            consumer,
            rate_limiter,
        })
    }
}

#[cfg(feature = "redis")]
async fn build_redis_store(url: &str, key_prefix: String) -> Result<Arc<dyn StorageAdapter>> {
    Ok(Arc::new(
        crate::store::redis::RedisStore::connect(url, key_prefix).await?,
    ))
}

#[cfg(not(feature = "redis"))]
async fn build_redis_store(_url: &str, _key_prefix: String) -> Result<Arc<dyn StorageAdapter>> {
    Err(Error::invalid_argument(
        "storage kind 'redis' requires the 'redis' cargo feature",
    ))
}

#[cfg(feature = "mongo")]
async fn build_mongo_store(uri: &str, database: &str) -> Result<Arc<dyn StorageAdapter>> {
    Ok(Arc::new(
        crate::store::mongo::MongoStore::connect(uri, database).await?,
    ))
}

#[cfg(not(feature = "mongo"))]
async fn build_mongo_store(_uri: &str, _database: &str) -> Result<Arc<dyn StorageAdapter>> {
    Err(Error::invalid_argument(
        "storage kind 'mongo' requires the 'mongo' cargo feature",
    ))
}

/// The task-queue engine.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct Engine {
    config: Arc<EngineConfig>,
    store: Arc<dyn StorageAdapter>,
    events: EventBus,
    producer: Producer,
    consumer: Consumer,
    rate_limiter: RateLimiter,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Starts a builder.
    #[must_use]
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Adds a task to a queue. See [`Producer::add_task`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unknown queue and `Backend`-kind
    /// errors when storage fails.
    pub async fn add_task(
        &self,
        queue_name: &str,
        data: Value,
        options: TaskOptions,
    ) -> Result<AddTaskOutcome> {
        self.producer.add_task(queue_name, data, options).await
    }

    /// Adds an ordered chain of tasks. See [`Producer::add_chain`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unknown queue or an empty chain.
    pub async fn add_chain(
        &self,
        queue_name: &str,
        entries: Vec<ChainEntry>,
        options: ChainOptions,
    ) -> Result<ChainOutcome> {
        self.producer.add_chain(queue_name, entries, options).await
    }

    /// Processes one dispatcher delivery. See
    /// [`Consumer::process_delivery`].
    ///
    /// # Errors
    ///
    /// See [`Consumer::process_delivery`]; an error maps to a non-2xx
    /// response at the HTTP layer.
    pub async fn process_delivery(&self, payload: &DeliveryPayload) -> Result<Value> {
        self.consumer.process_delivery(payload).await
    }

    /// Updates a task's progress. See [`Consumer::update_task_progress`].
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the task does not exist.
    pub async fn update_task_progress(
        &self,
        task_id: &TaskId,
        progress: TaskProgress,
    ) -> Result<Task> {
        self.consumer.update_task_progress(task_id, progress).await
    }

    /// Gets a task by ID.
    ///
    /// # Errors
    ///
    /// Returns `Backend`-kind errors when storage fails.
    pub async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        self.store.get_task(task_id).await
    }

    /// Queries tasks.
    ///
    /// # Errors
    ///
    /// Returns `Backend`-kind errors when storage fails.
    pub async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.store.query_tasks(filter).await
    }

    /// Counts tasks matching a filter.
    ///
    /// # Errors
    ///
    /// Returns `Backend`-kind errors when storage fails.
    pub async fn count_tasks(&self, filter: &TaskFilter) -> Result<u64> {
        self.store.count_tasks(filter).await
    }

    /// Bulk-deletes tasks per the policy; returns the deletion count.
    ///
    /// # Errors
    ///
    /// Returns `Backend`-kind errors when storage fails.
    pub async fn cleanup(&self, policy: &CleanupPolicy) -> Result<u64> {
        self.store.cleanup(policy).await
    }

    /// Reads a queue's current rate-limit window without consuming quota.
    ///
    /// Returns `Ok(None)` when the queue has no limiter configured or no
    /// window is live.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unknown queue.
    pub async fn rate_limit_status(&self, queue_name: &str) -> Result<Option<RateLimitStatus>> {
        let queue = self.config.queue(queue_name).ok_or_else(|| {
            Error::invalid_argument(format!("unknown queue '{queue_name}'"))
        })?;
        let Some(limit) = queue.rate_limiter else {
            return Ok(None);
        };
        self.rate_limiter
            .get_status(&RateLimitKey::queue(queue_name), &limit)
            .await
    }

    /// Subscribes a listener to engine events. The returned handle is the
    /// unsubscriber.
    pub fn subscribe(
        &self,
        kind: EventKind,
        listener: impl Fn(&EngineEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.events.subscribe(kind, listener)
    }

    /// Number of deliveries currently in flight in this process.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.consumer.in_flight()
    }

    /// Drains in-flight deliveries, then closes the storage adapter.
    ///
    /// In-flight deliveries complete and their final state is persisted
    /// before this returns; nothing is force-killed.
    ///
    /// # Errors
    ///
    /// Returns `Backend`-kind errors when closing the adapter fails.
    pub async fn close(&self) -> Result<()> {
        while self.consumer.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.store.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::dispatch::memory::InMemoryDispatcher;
    use crate::registry::{FnHandler, HandlerContext};

    fn echo_entry(queue: &str) -> ProcessorEntry {
        ProcessorEntry::new(queue).with_handler(Arc::new(FnHandler::new(
            |ctx: HandlerContext| async move { Ok(ctx.task().data.clone()) },
        )))
    }

    fn test_config() -> EngineConfig {
        EngineConfig::new("p", "l")
            .with_queue(QueueConfig::new("emails").with_processor_url("https://w.example.com"))
    }

    #[tokio::test]
    async fn builder_wires_components() -> Result<()> {
        let dispatcher = Arc::new(InMemoryDispatcher::new());
        let engine = Engine::builder(test_config())
            .register(echo_entry("emails"))?
            .with_dispatcher(Arc::<InMemoryDispatcher>::clone(&dispatcher))
            .build()
            .await?;

        let outcome = engine
            .add_task("emails", serde_json::json!({"ping": true}), TaskOptions::default())
            .await?;
        assert!(outcome.success);
        assert_eq!(dispatcher.len()?, 1);

        let task = engine
            .get_task(&outcome.task_id.unwrap())
            .await?
            .expect("persisted");
        assert_eq!(task.queue_name, "emails");

        Ok(())
    }

    #[tokio::test]
    async fn auto_create_queues_calls_dispatcher() -> Result<()> {
        let dispatcher = Arc::new(InMemoryDispatcher::new());
        let config = test_config().with_auto_create_queues(true);

        let _engine = Engine::builder(config)
            .register(echo_entry("emails"))?
            .with_dispatcher(Arc::<InMemoryDispatcher>::clone(&dispatcher))
            .build()
            .await?;

        assert_eq!(
            dispatcher.created_queues()?,
            vec!["projects/p/locations/l/queues/emails".to_string()]
        );

        Ok(())
    }

    #[tokio::test]
    async fn rate_limit_status_requires_known_queue() -> Result<()> {
        let engine = Engine::builder(test_config())
            .register(echo_entry("emails"))?
            .with_dispatcher(Arc::new(InMemoryDispatcher::new()))
            .build()
            .await?;

        // Known queue without a limiter: None.
        assert!(engine.rate_limit_status("emails").await?.is_none());

        // Unknown queue: InvalidArgument.
        let result = engine.rate_limit_status("nope").await;
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));

        Ok(())
    }

    #[tokio::test]
    async fn close_with_no_in_flight_work_returns() -> Result<()> {
        let engine = Engine::builder(test_config())
            .register(echo_entry("emails"))?
            .with_dispatcher(Arc::new(InMemoryDispatcher::new()))
            .build()
            .await?;

        assert_eq!(engine.in_flight(), 0);
        engine.close().await?;

        Ok(())
    }
}
