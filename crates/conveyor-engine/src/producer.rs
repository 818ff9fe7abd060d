//! Task production: validation, deduplication, rate limiting,
//! persistence, and dispatcher registration.
//!
//! `add_task` runs an ordered pipeline; each step aborts the call on
//! failure:
//!
//! 1. resolve the queue configuration
//! 2. acquire the uniqueness lock, when a key is supplied
//! 3. consume rate-limit quota (global, then per-queue), releasing the
//!    uniqueness lock on denial
//! 4. build and persist the task
//! 5. register the task with the dispatcher — dispatcher failure is
//!    logged but NOT fatal; the task stays persisted for later delivery
//! 6. emit `taskAdded`
//!
//! Anticipated conditions (uniqueness skip, rate-limit denial) come back
//! as a structured [`AddTaskOutcome`], never as an error.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use conveyor_core::{ChainId, TaskId};

use crate::config::{EngineConfig, QueueConfig, DEFAULT_MAX_ATTEMPTS};
use crate::dispatch::{DeliveryPayload, DeliveryTarget, DispatcherClient, EnqueueOptions};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::rate_limit::{RateLimitKey, RateLimiter};
use crate::store::{StorageAdapter, TaskFilter};
use crate::task::{ChainPosition, Task, TaskOptions, TaskStatus};

/// How long a uniqueness lock lives when the task never reaches a
/// terminal state (crash between creation and completion).
pub const DEFAULT_UNIQUENESS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Structured result of `add_task`.
#[derive(Debug, Clone)]
pub struct AddTaskOutcome {
    /// The created task's ID; on a uniqueness skip, the existing live
    /// task's ID when it could be resolved.
    pub task_id: Option<TaskId>,
    /// Whether a task was created and persisted.
    pub success: bool,
    /// True when creation was skipped because the uniqueness key is held.
    pub skipped: bool,
    /// Failure description for anticipated denials.
    pub error: Option<String>,
}

impl AddTaskOutcome {
    fn created(task_id: TaskId) -> Self {
        Self {
            task_id: Some(task_id),
            success: true,
            skipped: false,
            error: None,
        }
    }

    fn skipped(existing: Option<TaskId>) -> Self {
        Self {
            task_id: existing,
            success: false,
            skipped: true,
            error: None,
        }
    }

    fn denied(message: impl Into<String>) -> Self {
        Self {
            task_id: None,
            success: false,
            skipped: false,
            error: Some(message.into()),
        }
    }
}

/// One entry of a chain.
#[derive(Debug, Clone)]
pub struct ChainEntry {
    /// Caller payload for this step.
    pub data: Value,
    /// Per-step options; the chain position is filled in by `add_chain`.
    pub options: TaskOptions,
}

impl ChainEntry {
    /// Creates a chain entry with default options.
    #[must_use]
    pub fn new(data: Value) -> Self {
        Self {
            data,
            options: TaskOptions::default(),
        }
    }
}

/// Options for `add_chain`.
#[derive(Debug, Clone, Default)]
pub struct ChainOptions {
    /// Chain identifier; generated when absent.
    pub id: Option<ChainId>,
    /// Recorded on every step's chain position.
    pub wait_for_previous: bool,
}

/// Result of `add_chain`.
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    /// The chain identifier shared by all steps.
    pub chain_id: ChainId,
    /// Per-step outcomes, in index order. Shorter than the input when a
    /// step failed: creation stops on first failure with no rollback.
    pub results: Vec<AddTaskOutcome>,
}

/// The producer half of the engine.
pub struct Producer {
    config: Arc<EngineConfig>,
    store: Arc<dyn StorageAdapter>,
    dispatcher: Arc<dyn DispatcherClient>,
    rate_limiter: RateLimiter,
    events: EventBus,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Producer {
    /// Creates a producer over shared engine components.
    #[must_use]
    pub fn new(
        config: Arc<EngineConfig>,
        store: Arc<dyn StorageAdapter>,
        dispatcher: Arc<dyn DispatcherClient>,
        events: EventBus,
    ) -> Self {
        let rate_limiter = RateLimiter::new(Arc::clone(&store));
        Self {
            config,
            store,
            dispatcher,
            rate_limiter,
            events,
        }
    }

    /// Validates, deduplicates, rate-limits, persists, and registers a
    /// task with the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an unknown queue and `Backend`-kind
    /// errors when storage fails. Uniqueness skips and rate-limit denials
    /// are reported in the outcome, not as errors.
    #[tracing::instrument(skip(self, data, options), fields(queue = %queue_name))]
    pub async fn add_task(
        &self,
        queue_name: &str,
        data: Value,
        options: TaskOptions,
    ) -> Result<AddTaskOutcome> {
        let queue = self.config.queue(queue_name).ok_or_else(|| {
            Error::invalid_argument(format!("unknown queue '{queue_name}'"))
        })?;

        let task_id = TaskId::generate();

        // Uniqueness: atomic test-and-set before anything else touches
        // shared state.
        let lock_key = options.uniqueness_key.clone();
        if let Some(key) = &lock_key {
            let acquired = self
                .store
                .set_uniqueness_key_active(key, &task_id, DEFAULT_UNIQUENESS_TTL)
                .await?;
            if !acquired {
                let existing = self.find_live_task_for_key(key).await?;
                tracing::debug!(key = %key, "uniqueness key held; skipping task creation");
                return Ok(AddTaskOutcome::skipped(existing));
            }
        }

        // Rate limiting: global window first, then the queue's own.
        if let Some(denied) = self.check_rate_limits(queue, &lock_key).await? {
            return Ok(denied);
        }

        let max_attempts = options
            .max_attempts
            .or(queue.max_retries)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            if let Some(key) = &lock_key {
                self.store.remove_uniqueness_key(key).await?;
            }
            return Err(Error::invalid_argument("max_attempts must be at least 1"));
        }

        let task = Task::new(task_id, queue_name, data.clone(), options, max_attempts);

        if let Err(err) = self.store.save_task(&task).await {
            if let Some(key) = &lock_key {
                // The lock points at a task that never existed.
                let _ = self.store.remove_uniqueness_key(key).await;
            }
            return Err(err);
        }

        self.register_with_dispatcher(queue, &task).await;

        self.events.emit(&EngineEvent::TaskAdded {
            task_id,
            queue_name: queue_name.to_string(),
            data,
        });

        Ok(AddTaskOutcome::created(task_id))
    }

    /// Creates an ordered chain of tasks sharing one chain ID.
    ///
    /// Steps are created front to back; on the first failed step the call
    /// stops and returns the partial results. Previously created steps
    /// are not rolled back.
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
        if entries.is_empty() {
            return Err(Error::invalid_argument("chain requires at least one task"));
        }

        let chain_id = options.id.unwrap_or_else(ChainId::generate);
        let total =
            u32::try_from(entries.len()).map_err(|_| Error::invalid_argument("chain too long"))?;

        let mut results = Vec::with_capacity(entries.len());

        for (index, entry) in entries.into_iter().enumerate() {
            let mut task_options = entry.options;
            task_options.chain = Some(ChainPosition {
                id: chain_id,
                index: index as u32,
                total,
                wait_for_previous: options.wait_for_previous,
            });

            match self.add_task(queue_name, entry.data, task_options).await {
                Ok(outcome) => {
                    let stop = !outcome.success;
                    results.push(outcome);
                    if stop {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        chain_id = %chain_id,
                        index = index,
                        error = %err,
                        "chain creation stopped on failed step"
                    );
                    results.push(AddTaskOutcome::denied(err.to_string()));
                    break;
                }
            }
        }

        Ok(ChainOutcome { chain_id, results })
    }

    /// Applies the global and per-queue rate limits.
    ///
    /// On denial the uniqueness lock taken earlier in the same call is
    /// released and the denial outcome is returned.
    async fn check_rate_limits(
        &self,
        queue: &QueueConfig,
        lock_key: &Option<String>,
    ) -> Result<Option<AddTaskOutcome>> {
        let checks = [
            (RateLimitKey::GLOBAL.to_string(), self.config.global_rate_limiter),
            (RateLimitKey::queue(&queue.name), queue.rate_limiter),
        ];

        for (key, limit) in checks {
            let Some(limit) = limit else { continue };
            let decision = self.rate_limiter.check_rate_limit(&key, &limit).await?;
            if !decision.allowed {
                if let Some(lock) = lock_key {
                    self.store.remove_uniqueness_key(lock).await?;
                }
                tracing::debug!(
                    key = %key,
                    count = decision.count,
                    limit = decision.limit,
                    "rate limit exceeded"
                );
                return Ok(Some(AddTaskOutcome::denied("rate limit exceeded")));
            }
        }

        Ok(None)
    }

    /// Registers the task with the external dispatcher.
    ///
    /// Dispatcher failure is recoverable: the task stays persisted for
    /// later local or manual processing, and a structured warning is
    /// emitted.
    async fn register_with_dispatcher(&self, queue: &QueueConfig, task: &Task) {
        let Some(url) = self.config.processor_url_for(queue) else {
            tracing::warn!(
                queue = %queue.name,
                task_id = %task.id,
                "queue has no processor URL; task persisted without dispatcher registration"
            );
            return;
        };

        let target = DeliveryTarget {
            queue_path: queue.queue_path(&self.config.project_id, &self.config.location),
            url: url.to_string(),
            service_account_email: queue.service_account_email.clone(),
        };
        let payload = DeliveryPayload::from_task(task);
        let mut enqueue_options = EnqueueOptions::new();
        if let Some(delay) = task.options.delay {
            enqueue_options = enqueue_options.with_delay(delay);
        }

        if let Err(err) = self
            .dispatcher
            .enqueue_http(&target, &payload, enqueue_options)
            .await
        {
            tracing::warn!(
                queue = %queue.name,
                task_id = %task.id,
                error = %err,
                "dispatcher enqueue failed; task remains persisted"
            );
        }
    }

    /// Resolves the live task currently holding a uniqueness key.
    async fn find_live_task_for_key(&self, key: &str) -> Result<Option<TaskId>> {
        let holders = self
            .store
            .query_tasks(
                &TaskFilter {
                    statuses: vec![TaskStatus::Idle, TaskStatus::Active],
                    uniqueness_key: Some(key.to_string()),
                    limit: Some(1),
                    ..TaskFilter::default()
                },
            )
            .await?;
        Ok(holders.first().map(|t| t.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::dispatch::memory::InMemoryDispatcher;
    use crate::store::memory::InMemoryStore;

    fn components(
        config: EngineConfig,
    ) -> (Producer, Arc<InMemoryStore>, Arc<InMemoryDispatcher>) {
        let store = Arc::new(InMemoryStore::new());
        let dispatcher = Arc::new(InMemoryDispatcher::new());
        let producer = Producer::new(
            Arc::new(config),
            Arc::<InMemoryStore>::clone(&store),
            Arc::<InMemoryDispatcher>::clone(&dispatcher),
            EventBus::new(),
        );
        (producer, store, dispatcher)
    }

    fn email_config() -> EngineConfig {
        EngineConfig::new("p", "l").with_queue(
            QueueConfig::new("emails").with_processor_url("https://worker.example.com/deliver"),
        )
    }

    #[tokio::test]
    async fn add_task_persists_and_registers() -> Result<()> {
        let (producer, store, dispatcher) = components(email_config());

        let outcome = producer
            .add_task("emails", serde_json::json!({"n": 1}), TaskOptions::default())
            .await?;

        assert!(outcome.success);
        let task_id = outcome.task_id.expect("task id present");

        let task = store.get_task(&task_id).await?.expect("persisted");
        assert_eq!(task.status, TaskStatus::Idle);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.max_attempts, DEFAULT_MAX_ATTEMPTS);

        let recorded = dispatcher.drain()?;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].payload.task_id, task_id);
        assert_eq!(
            recorded[0].target.queue_path,
            "projects/p/locations/l/queues/emails"
        );

        Ok(())
    }

    #[tokio::test]
    async fn add_task_unknown_queue_is_invalid_argument() {
        let (producer, _store, _dispatcher) = components(email_config());

        let result = producer
            .add_task("nope", serde_json::json!({}), TaskOptions::default())
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn add_task_resolves_max_attempts_cascade() -> Result<()> {
        let config = EngineConfig::new("p", "l").with_queue(
            QueueConfig::new("emails")
                .with_processor_url("https://w.example.com")
                .with_max_retries(7),
        );
        let (producer, store, _dispatcher) = components(config);

        // Queue default applies.
        let outcome = producer
            .add_task("emails", serde_json::json!({}), TaskOptions::default())
            .await?;
        let task = store.get_task(&outcome.task_id.unwrap()).await?.unwrap();
        assert_eq!(task.max_attempts, 7);

        // Option override wins.
        let outcome = producer
            .add_task(
                "emails",
                serde_json::json!({}),
                TaskOptions {
                    max_attempts: Some(2),
                    ..TaskOptions::default()
                },
            )
            .await?;
        let task = store.get_task(&outcome.task_id.unwrap()).await?.unwrap();
        assert_eq!(task.max_attempts, 2);

        Ok(())
    }

    #[tokio::test]
    async fn zero_max_attempts_is_rejected_and_releases_lock() -> Result<()> {
        let (producer, store, _dispatcher) = components(email_config());

        let result = producer
            .add_task(
                "emails",
                serde_json::json!({}),
                TaskOptions {
                    max_attempts: Some(0),
                    uniqueness_key: Some("k".into()),
                    ..TaskOptions::default()
                },
            )
            .await;

        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
        assert!(!store.is_uniqueness_key_active("k").await?);

        Ok(())
    }

    #[tokio::test]
    async fn duplicate_uniqueness_key_skips() -> Result<()> {
        let (producer, _store, _dispatcher) = components(email_config());
        let options = || TaskOptions {
            uniqueness_key: Some("report-42".into()),
            ..TaskOptions::default()
        };

        let first = producer
            .add_task("emails", serde_json::json!({}), options())
            .await?;
        assert!(first.success);

        let second = producer
            .add_task("emails", serde_json::json!({}), options())
            .await?;
        assert!(!second.success);
        assert!(second.skipped);
        assert_eq!(second.task_id, first.task_id);

        Ok(())
    }

    #[tokio::test]
    async fn rate_limit_denial_releases_uniqueness_lock() -> Result<()> {
        let config = EngineConfig::new("p", "l").with_queue(
            QueueConfig::new("emails")
                .with_processor_url("https://w.example.com")
                .with_rate_limiter(RateLimitConfig::new(0, Duration::from_secs(60))),
        );
        let (producer, store, _dispatcher) = components(config);

        let outcome = producer
            .add_task(
                "emails",
                serde_json::json!({}),
                TaskOptions {
                    uniqueness_key: Some("k".into()),
                    ..TaskOptions::default()
                },
            )
            .await?;

        assert!(!outcome.success);
        assert!(!outcome.skipped);
        assert!(outcome.error.as_deref().unwrap().contains("rate limit"));

        // The lock was released, so the key is free again.
        assert!(!store.is_uniqueness_key_active("k").await?);

        Ok(())
    }

    #[tokio::test]
    async fn global_rate_limiter_applies_across_queues() -> Result<()> {
        let config = EngineConfig::new("p", "l")
            .with_queue(QueueConfig::new("a").with_processor_url("https://w.example.com"))
            .with_queue(QueueConfig::new("b").with_processor_url("https://w.example.com"))
            .with_global_rate_limiter(RateLimitConfig::new(1, Duration::from_secs(60)));
        let (producer, _store, _dispatcher) = components(config);

        let first = producer
            .add_task("a", serde_json::json!({}), TaskOptions::default())
            .await?;
        assert!(first.success);

        let second = producer
            .add_task("b", serde_json::json!({}), TaskOptions::default())
            .await?;
        assert!(!second.success);
        assert!(second.error.as_deref().unwrap().contains("rate limit"));

        Ok(())
    }

    #[tokio::test]
    async fn dispatcher_failure_is_not_fatal() -> Result<()> {
        let (producer, store, dispatcher) = components(email_config());
        dispatcher.set_fail_enqueues(true);

        let outcome = producer
            .add_task("emails", serde_json::json!({}), TaskOptions::default())
            .await?;

        // The task is persisted and reported as created.
        assert!(outcome.success);
        let task = store.get_task(&outcome.task_id.unwrap()).await?;
        assert!(task.is_some());
        assert!(dispatcher.is_empty()?);

        Ok(())
    }

    #[tokio::test]
    async fn add_chain_assigns_contiguous_positions() -> Result<()> {
        let (producer, store, _dispatcher) = components(email_config());

        let outcome = producer
            .add_chain(
                "emails",
                (0..3)
                    .map(|step| ChainEntry::new(serde_json::json!({ "step": step })))
                    .collect(),
                ChainOptions::default(),
            )
            .await?;

        assert_eq!(outcome.results.len(), 3);
        assert!(outcome.results.iter().all(|r| r.success));

        let members = store.get_chain_tasks(&outcome.chain_id).await?;
        let positions: Vec<(u32, u32)> = members
            .iter()
            .map(|t| {
                let c = t.chain.unwrap();
                (c.index, c.total)
            })
            .collect();
        assert_eq!(positions, vec![(0, 3), (1, 3), (2, 3)]);

        Ok(())
    }

    #[tokio::test]
    async fn add_chain_stops_on_first_failure_without_rollback() -> Result<()> {
        let config = EngineConfig::new("p", "l").with_queue(
            QueueConfig::new("emails")
                .with_processor_url("https://w.example.com")
                .with_rate_limiter(RateLimitConfig::new(2, Duration::from_secs(600))),
        );
        let (producer, store, _dispatcher) = components(config);

        let outcome = producer
            .add_chain(
                "emails",
                (0..5)
                    .map(|step| ChainEntry::new(serde_json::json!({ "step": step })))
                    .collect(),
                ChainOptions::default(),
            )
            .await?;

        // Third step hits the rate limit; creation stops there.
        assert_eq!(outcome.results.len(), 3);
        assert!(outcome.results[0].success);
        assert!(outcome.results[1].success);
        assert!(!outcome.results[2].success);

        // The two created steps stay persisted.
        assert_eq!(store.get_chain_tasks(&outcome.chain_id).await?.len(), 2);

        Ok(())
    }

    #[tokio::test]
    async fn add_chain_rejects_empty_input() {
        let (producer, _store, _dispatcher) = components(email_config());
        let result = producer
            .add_chain("emails", Vec::new(), ChainOptions::default())
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn delay_is_forwarded_to_dispatcher() -> Result<()> {
        let (producer, store, dispatcher) = components(email_config());

        let outcome = producer
            .add_task(
                "emails",
                serde_json::json!({}),
                TaskOptions {
                    delay: Some(Duration::from_secs(30)),
                    ..TaskOptions::default()
                },
            )
            .await?;

        let recorded = dispatcher.drain()?;
        assert_eq!(recorded[0].options.delay, Some(Duration::from_secs(30)));

        let task = store.get_task(&outcome.task_id.unwrap()).await?.unwrap();
        assert!(task.scheduled_for.is_some());

        Ok(())
    }
}
