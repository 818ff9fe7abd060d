//! Handler registration and dispatch.
//!
//! Handlers are associated with queues by explicit registration calls at
//! engine build time (the registry is read-only during delivery
//! handling). Within a queue, a delivery is dispatched to:
//!
//! 1. the handler whose `task_name` equals the task's name, else
//! 2. the first handler registered without a name, else
//! 3. the first registered handler.
//!
//! Multiple registrations for the same queue are allowed and compose in
//! registration order. Each registration may carry per-queue lifecycle
//! hooks (`active`, `completed`, `failed`, `progress`); hook panics are
//! isolated and logged.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::task::{Task, TaskFailure, TaskProgress};

/// Result of a user handler invocation.
///
/// A handler failure is user-domain information, not an engine error; the
/// consumer translates it into retry accounting.
pub type HandlerResult = std::result::Result<Value, Box<dyn std::error::Error + Send + Sync>>;

/// Sink for progress updates reported by an in-flight handler.
///
/// Implemented by the consumer; handlers reach it through
/// [`HandlerContext::update_progress`].
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Persists and broadcasts a progress update for the running task.
    async fn update_progress(&self, progress: TaskProgress) -> Result<()>;
}

/// Context passed to a handler for one delivery.
///
/// The task is immutable from the handler's perspective; the only
/// side-channel back into the engine is `update_progress`.
#[derive(Clone)]
pub struct HandlerContext {
    task: Task,
    progress: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for HandlerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerContext")
            .field("task", &self.task.id)
            .finish_non_exhaustive()
    }
}

impl HandlerContext {
    /// Creates a context for one delivery.
    #[must_use]
    pub fn new(task: Task, progress: Arc<dyn ProgressSink>) -> Self {
        Self { task, progress }
    }

    /// The task being processed.
    #[must_use]
    pub const fn task(&self) -> &Task {
        &self.task
    }

    /// Reports progress while the task is in flight.
    ///
    /// The update is persisted and progress events propagate immediately.
    ///
    /// # Errors
    ///
    /// Returns a `Backend`-kind error when persisting the update fails.
    pub async fn update_progress(&self, progress: TaskProgress) -> Result<()> {
        self.progress.update_progress(progress).await
    }
}

/// A task handler.
///
/// Handlers receive the full delivery context and return either a result
/// value (persisted on the task) or an error (counted as a failed
/// attempt).
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Processes one delivery.
    async fn handle(&self, ctx: HandlerContext) -> HandlerResult;
}

/// Adapter turning an async closure into a [`TaskHandler`].
///
/// ## Example
///
/// ```rust,ignore
/// let handler = FnHandler::new(|ctx: HandlerContext| async move {
///     Ok(serde_json::json!({"echo": ctx.task().data}))
/// });
/// ```
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    /// Wraps a closure.
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, ctx: HandlerContext) -> HandlerResult {
        (self.f)(ctx).await
    }
}

/// One handler registered under a queue.
#[derive(Clone)]
pub struct HandlerEntry {
    /// Selector within the queue; `None` matches unnamed tasks.
    pub task_name: Option<String>,
    /// The handler.
    pub handler: Arc<dyn TaskHandler>,
    /// Concurrency hint for this handler. Recorded for the dispatcher's
    /// benefit; the consumer itself does not serialize executions.
    pub concurrency: Option<usize>,
}

impl std::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("task_name", &self.task_name)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

/// Per-queue lifecycle callbacks.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    /// Fired when a delivery marks the task active.
    pub on_active: Option<Arc<dyn Fn(&Task) + Send + Sync>>,
    /// Fired when the handler succeeds, with the result.
    pub on_completed: Option<Arc<dyn Fn(&Task, &Value) + Send + Sync>>,
    /// Fired on terminal failure.
    pub on_failed: Option<Arc<dyn Fn(&Task, &TaskFailure) + Send + Sync>>,
    /// Fired on every progress update.
    pub on_progress: Option<Arc<dyn Fn(&Task, &TaskProgress) + Send + Sync>>,
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("on_active", &self.on_active.is_some())
            .field("on_completed", &self.on_completed.is_some())
            .field("on_failed", &self.on_failed.is_some())
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

impl LifecycleHooks {
    /// Creates empty hooks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the `active` callback.
    #[must_use]
    pub fn on_active(mut self, f: impl Fn(&Task) + Send + Sync + 'static) -> Self {
        self.on_active = Some(Arc::new(f));
        self
    }

    /// Sets the `completed` callback.
    #[must_use]
    pub fn on_completed(mut self, f: impl Fn(&Task, &Value) + Send + Sync + 'static) -> Self {
        self.on_completed = Some(Arc::new(f));
        self
    }

    /// Sets the `failed` callback.
    #[must_use]
    pub fn on_failed(mut self, f: impl Fn(&Task, &TaskFailure) + Send + Sync + 'static) -> Self {
        self.on_failed = Some(Arc::new(f));
        self
    }

    /// Sets the `progress` callback.
    #[must_use]
    pub fn on_progress(
        mut self,
        f: impl Fn(&Task, &TaskProgress) + Send + Sync + 'static,
    ) -> Self {
        self.on_progress = Some(Arc::new(f));
        self
    }
}

/// One registration: a queue, its handlers, and optional hooks.
#[derive(Debug, Clone)]
pub struct ProcessorEntry {
    /// Queue this registration serves.
    pub queue: String,
    /// Handlers in registration order.
    pub handlers: Vec<HandlerEntry>,
    /// Lifecycle callbacks for the queue.
    pub hooks: LifecycleHooks,
}

impl ProcessorEntry {
    /// Starts a registration for a queue.
    #[must_use]
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            handlers: Vec::new(),
            hooks: LifecycleHooks::default(),
        }
    }

    /// Adds an unnamed handler.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.push(HandlerEntry {
            task_name: None,
            handler,
            concurrency: None,
        });
        self
    }

    /// Adds a handler selected by task name.
    #[must_use]
    pub fn with_named_handler(
        mut self,
        task_name: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        self.handlers.push(HandlerEntry {
            task_name: Some(task_name.into()),
            handler,
            concurrency: None,
        });
        self
    }

    /// Sets the lifecycle hooks.
    #[must_use]
    pub fn with_hooks(mut self, hooks: LifecycleHooks) -> Self {
        self.hooks = hooks;
        self
    }
}

/// Invokes a lifecycle hook, isolating panics.
fn invoke_isolated(queue: &str, hook_name: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tracing::warn!(queue = queue, hook = hook_name, "lifecycle hook panicked");
    }
}

/// Registry of `(queue, task_name) -> handler` plus per-queue hooks.
///
/// Populated at engine build and read-only during delivery handling.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    entries: HashMap<String, Vec<ProcessorEntry>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a processor entry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the entry names no queue or
    /// defines no handler.
    pub fn register(&mut self, entry: ProcessorEntry) -> Result<()> {
        if entry.queue.is_empty() {
            return Err(Error::invalid_argument(
                "processor registration requires a queue name",
            ));
        }
        if entry.handlers.is_empty() {
            return Err(Error::invalid_argument(format!(
                "processor registration for queue '{}' defines no handler",
                entry.queue
            )));
        }

        self.entries.entry(entry.queue.clone()).or_default().push(entry);
        Ok(())
    }

    /// Returns true if any registration serves the queue.
    #[must_use]
    pub fn has_queue(&self, queue: &str) -> bool {
        self.entries.contains_key(queue)
    }

    /// Resolves the handler for a delivery.
    ///
    /// Applies the dispatch rule over all registrations for the queue in
    /// registration order: exact `task_name` match, else first unnamed
    /// handler, else first registered handler.
    #[must_use]
    pub fn resolve(&self, queue: &str, task_name: Option<&str>) -> Option<Arc<dyn TaskHandler>> {
        let registrations = self.entries.get(queue)?;
        let handlers = || registrations.iter().flat_map(|r| r.handlers.iter());

        if let Some(name) = task_name {
            if let Some(entry) = handlers().find(|h| h.task_name.as_deref() == Some(name)) {
                return Some(Arc::clone(&entry.handler));
            }
        }

        if let Some(entry) = handlers().find(|h| h.task_name.is_none()) {
            return Some(Arc::clone(&entry.handler));
        }

        handlers().next().map(|h| Arc::clone(&h.handler))
    }

    /// Fires the `active` hooks of every registration for the queue.
    pub fn fire_active(&self, task: &Task) {
        self.for_each_hooks(&task.queue_name, |hooks| {
            if let Some(hook) = &hooks.on_active {
                invoke_isolated(&task.queue_name, "active", || hook(task));
            }
        });
    }

    /// Fires the `completed` hooks of every registration for the queue.
    pub fn fire_completed(&self, task: &Task, result: &Value) {
        self.for_each_hooks(&task.queue_name, |hooks| {
            if let Some(hook) = &hooks.on_completed {
                invoke_isolated(&task.queue_name, "completed", || hook(task, result));
            }
        });
    }

    /// Fires the `failed` hooks of every registration for the queue.
    pub fn fire_failed(&self, task: &Task, error: &TaskFailure) {
        self.for_each_hooks(&task.queue_name, |hooks| {
            if let Some(hook) = &hooks.on_failed {
                invoke_isolated(&task.queue_name, "failed", || hook(task, error));
            }
        });
    }

    /// Fires the `progress` hooks of every registration for the queue.
    pub fn fire_progress(&self, task: &Task, progress: &TaskProgress) {
        self.for_each_hooks(&task.queue_name, |hooks| {
            if let Some(hook) = &hooks.on_progress {
                invoke_isolated(&task.queue_name, "progress", || hook(task, progress));
            }
        });
    }

    fn for_each_hooks(&self, queue: &str, mut f: impl FnMut(&LifecycleHooks)) {
        if let Some(registrations) = self.entries.get(queue) {
            for registration in registrations {
                f(&registration.hooks);
            }
        }
    }
}
