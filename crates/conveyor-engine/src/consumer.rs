//! Delivery processing: state transitions, handler dispatch, retry
//! accounting, and progress updates.
//!
//! `process_delivery` executes one delivery end to end:
//!
//! 1. load the task (stale deliveries for deleted tasks fail `NotFound`)
//! 2. take the per-process concurrency guard (`Conflict` when the same
//!    task is already in flight in this process)
//! 3. mark the task active and count the attempt
//! 4. resolve the handler and invoke it with a progress-reporting context
//! 5. on success, persist the result and emit `taskCompleted`
//! 6. on failure, either return the task to idle for a dispatcher retry
//!    or, on the final attempt, persist the terminal failure and emit
//!    `taskFailed`
//!
//! An attempt is counted when the delivery is consumed, whether the
//! handler succeeds or fails, so a task observed `Failed` always has
//! `attempts == max_attempts`.
//!
//! The guard is process-local only: duplicate deliveries reaching two
//! distinct processes must be handled idempotently by the handler itself.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use conveyor_core::TaskId;

use crate::dispatch::DeliveryPayload;
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::registry::{HandlerContext, HandlerRegistry, ProgressSink};
use crate::store::{StorageAdapter, TaskPatch};
use crate::task::{Task, TaskFailure, TaskProgress, TaskStatus};

/// Shared consumer state, also reachable from progress sinks handed to
/// handlers.
struct ConsumerShared {
    store: Arc<dyn StorageAdapter>,
    registry: Arc<HandlerRegistry>,
    events: EventBus,
    /// Per-queue sets of task IDs currently in flight in this process.
    active: Mutex<HashMap<String, HashSet<TaskId>>>,
}

impl ConsumerShared {
    /// Persists a progress update without changing status, then fires
    /// progress hooks and emits `taskProgress`.
    async fn update_task_progress(&self, task_id: &TaskId, progress: TaskProgress) -> Result<Task> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(Error::TaskNotFound { task_id: *task_id })?;

        let clamped = progress.clamped();
        let updated = self
            .store
            .update_task_status(
                task_id,
                task.status,
                TaskPatch {
                    progress: Some(clamped.clone()),
                    ..TaskPatch::default()
                },
            )
            .await?;

        self.registry.fire_progress(&updated, &clamped);
        self.events.emit(&EngineEvent::TaskProgress {
            task_id: *task_id,
            queue_name: updated.queue_name.clone(),
            progress: clamped,
        });

        Ok(updated)
    }
}

/// Progress sink bound to one in-flight delivery.
struct DeliveryProgressSink {
    shared: Arc<ConsumerShared>,
    task_id: TaskId,
}

#[async_trait]
impl ProgressSink for DeliveryProgressSink {
    async fn update_progress(&self, progress: TaskProgress) -> Result<()> {
        self.shared
            .update_task_progress(&self.task_id, progress)
            .await
            .map(|_| ())
    }
}

/// Removes a task from the in-flight set when the delivery exits, on
/// every path.
struct ActiveGuard {
    shared: Arc<ConsumerShared>,
    queue_name: String,
    task_id: TaskId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut active) = self.shared.active.lock() {
            if let Some(tasks) = active.get_mut(&self.queue_name) {
                tasks.remove(&self.task_id);
                if tasks.is_empty() {
                    active.remove(&self.queue_name);
                }
            }
        }
    }
}

/// The consumer half of the engine.
#[derive(Clone)]
pub struct Consumer {
    shared: Arc<ConsumerShared>,
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer").finish_non_exhaustive()
    }
}

impl Consumer {
    /// Creates a consumer over shared engine components.
    #[must_use]
    pub fn new(
        store: Arc<dyn StorageAdapter>,
        registry: Arc<HandlerRegistry>,
        events: EventBus,
    ) -> Self {
        Self {
            shared: Arc::new(ConsumerShared {
                store,
                registry,
                events,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the number of deliveries currently in flight in this
    /// process.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared
            .active
            .lock()
            .map(|active| active.values().map(HashSet::len).sum())
            .unwrap_or(0)
    }

    /// Executes one delivery.
    ///
    /// Returns the handler result on success. An error return maps to a
    /// non-2xx response at the HTTP layer, which makes the dispatcher
    /// retry per its own policy.
    ///
    /// # Errors
    ///
    /// - `NotFound` when the task was deleted between enqueue and
    ///   delivery (terminal; no further work is attempted)
    /// - `Conflict` when this process is already handling a delivery for
    ///   the same task
    /// - `InvalidArgument` when no handler is registered for the queue
    ///   (the task fails terminally)
    /// - `Handler` when the user handler failed
    #[tracing::instrument(skip(self, payload), fields(task_id = %payload.task_id, queue = %payload.queue_name))]
    pub async fn process_delivery(&self, payload: &DeliveryPayload) -> Result<Value> {
        let mut task = self
            .shared
            .store
            .get_task(&payload.task_id)
            .await?
            .ok_or(Error::TaskNotFound {
                task_id: payload.task_id,
            })?;

        let _guard = self.acquire(&task)?;

        // Activate and count the attempt.
        task.mark_active();
        task.increment_attempts();
        let active = self
            .shared
            .store
            .update_task_status(
                &task.id,
                TaskStatus::Active,
                TaskPatch {
                    attempts: Some(task.attempts),
                    active_at: task.active_at,
                    ..TaskPatch::default()
                },
            )
            .await?;
        self.shared.registry.fire_active(&active);

        let Some(handler) = self
            .shared
            .registry
            .resolve(&task.queue_name, task.task_name.as_deref())
        else {
            let message = format!("no handler registered for queue '{}'", task.queue_name);
            self.fail_terminally(task, TaskFailure::new(&message), true)
                .await?;
            return Err(Error::invalid_argument(message));
        };

        let ctx = HandlerContext::new(
            active,
            Arc::new(DeliveryProgressSink {
                shared: Arc::clone(&self.shared),
                task_id: task.id,
            }),
        );

        match handler.handle(ctx).await {
            Ok(result) => self.complete(task, result).await,
            Err(handler_err) => {
                let message = handler_err.to_string();
                if task.attempts < task.max_attempts {
                    // Non-terminal: back to idle, dispatcher schedules the
                    // retry. No failure event is emitted.
                    self.shared
                        .store
                        .update_task_status(&task.id, TaskStatus::Idle, TaskPatch::default())
                        .await?;
                    tracing::debug!(
                        task_id = %task.id,
                        attempts = task.attempts,
                        max_attempts = task.max_attempts,
                        "handler failed; task returned to idle for retry"
                    );
                } else {
                    self.fail_terminally(task, TaskFailure::new(&message), false)
                        .await?;
                }
                Err(Error::handler(message))
            }
        }
    }

    /// Persists and broadcasts a progress update for an in-flight task.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the task does not exist and
    /// `Backend`-kind errors when persisting fails.
    pub async fn update_task_progress(
        &self,
        task_id: &TaskId,
        progress: TaskProgress,
    ) -> Result<Task> {
        self.shared.update_task_progress(task_id, progress).await
    }

    /// Takes the per-process concurrency guard for a task.
    fn acquire(&self, task: &Task) -> Result<ActiveGuard> {
        let mut active = self
            .shared
            .active
            .lock()
            .map_err(|_| Error::storage("consumer guard lock poisoned"))?;

        let tasks = active.entry(task.queue_name.clone()).or_default();
        if !tasks.insert(task.id) {
            return Err(Error::conflict(format!(
                "task {} is already being processed",
                task.id
            )));
        }

        Ok(ActiveGuard {
            shared: Arc::clone(&self.shared),
            queue_name: task.queue_name.clone(),
            task_id: task.id,
        })
    }

    /// Success path: persist the result, fire callbacks, emit events,
    /// record chain advancement, and apply the removal policy.
    async fn complete(&self, mut task: Task, result: Value) -> Result<Value> {
        task.mark_completed(result.clone());
        let completed = self
            .shared
            .store
            .update_task_status(
                &task.id,
                TaskStatus::Completed,
                TaskPatch {
                    result: Some(result.clone()),
                    completed_at: task.completed_at,
                    ..TaskPatch::default()
                },
            )
            .await?;

        self.shared.registry.fire_completed(&completed, &result);
        self.shared.events.emit(&EngineEvent::TaskCompleted {
            task_id: completed.id,
            queue_name: completed.queue_name.clone(),
            result: result.clone(),
            duration_ms: completed.duration().map_or(0, |d| d.num_milliseconds()),
        });

        // Best-effort chain advancement notification: the next step is
        // already persisted and enqueued by the chain producer, and the
        // dispatcher owns its delivery timing.
        if let (Some(chain), Some(next_index)) = (completed.chain, completed.next_chain_index()) {
            self.shared.events.emit(&EngineEvent::ChainAdvanced {
                chain_id: chain.id,
                queue_name: completed.queue_name.clone(),
                completed_index: chain.index,
                next_index,
            });
        }

        if completed.should_remove_on_complete() {
            self.remove_task(&completed).await?;
        }

        Ok(result)
    }

    /// Terminal failure path shared by exhausted retries and
    /// missing-handler configuration errors.
    ///
    /// `force_attempt_cap` pins `attempts` to `max_attempts` for failures
    /// that no retry can fix, keeping the terminal-state invariant.
    async fn fail_terminally(
        &self,
        mut task: Task,
        failure: TaskFailure,
        force_attempt_cap: bool,
    ) -> Result<()> {
        if force_attempt_cap {
            task.attempts = task.max_attempts;
        }
        task.mark_failed(failure.clone());

        let failed = self
            .shared
            .store
            .update_task_status(
                &task.id,
                TaskStatus::Failed,
                TaskPatch {
                    attempts: Some(task.attempts),
                    error: Some(failure.clone()),
                    failed_at: task.failed_at,
                    ..TaskPatch::default()
                },
            )
            .await?;

        self.shared.events.emit(&EngineEvent::TaskFailed {
            task_id: failed.id,
            queue_name: failed.queue_name.clone(),
            error: failure.clone(),
            attempts: failed.attempts,
            max_attempts: failed.max_attempts,
            is_final_attempt: true,
        });
        self.shared.registry.fire_failed(&failed, &failure);

        if failed.should_remove_on_fail() {
            self.remove_task(&failed).await?;
        }

        Ok(())
    }

    /// Deletes a task and its uniqueness lock per the removal policy.
    async fn remove_task(&self, task: &Task) -> Result<()> {
        self.shared.store.delete_task(&task.id).await?;
        if let Some(key) = &task.uniqueness_key {
            self.shared.store.remove_uniqueness_key(key).await?;
        }
        Ok(())
    }
}
