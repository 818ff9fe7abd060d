//! Engine lifecycle events and the subscription bus.
//!
//! Components emit an [`EngineEvent`] whenever a task crosses a lifecycle
//! boundary. Applications observe them through
//! [`EventBus::subscribe`], which returns a [`Subscription`] handle acting
//! as the unsubscriber.
//!
//! Listeners run synchronously on the emitting task. Each listener
//! invocation is isolated: a panicking listener is logged and never
//! prevents the remaining listeners from running.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde::Serialize;
use serde_json::Value;

use conveyor_core::{ChainId, TaskId};

use crate::task::{TaskFailure, TaskProgress};

/// The kind of an engine event, used for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A task was persisted and registered with the dispatcher.
    TaskAdded,
    /// A task completed successfully.
    TaskCompleted,
    /// A task terminally failed.
    TaskFailed,
    /// A task reported progress.
    TaskProgress,
    /// A non-terminal chain step completed.
    ChainAdvanced,
    /// Matches every event.
    Any,
}

/// A task lifecycle event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A task was persisted and registered with the dispatcher.
    TaskAdded {
        /// Task identifier.
        task_id: TaskId,
        /// Queue the task was added to.
        queue_name: String,
        /// Caller payload.
        data: Value,
    },

    /// A task completed successfully.
    TaskCompleted {
        /// Task identifier.
        task_id: TaskId,
        /// Queue the task belonged to.
        queue_name: String,
        /// Handler result.
        result: Value,
        /// Creation-to-completion duration in milliseconds.
        duration_ms: i64,
    },

    /// A task terminally failed.
    TaskFailed {
        /// Task identifier.
        task_id: TaskId,
        /// Queue the task belonged to.
        queue_name: String,
        /// Failure record.
        error: TaskFailure,
        /// Attempts consumed.
        attempts: u32,
        /// Attempt cap.
        max_attempts: u32,
        /// Always true: the event is only emitted on the final attempt.
        is_final_attempt: bool,
    },

    /// A task reported progress while in flight.
    TaskProgress {
        /// Task identifier.
        task_id: TaskId,
        /// Queue the task belongs to.
        queue_name: String,
        /// The reported progress.
        progress: TaskProgress,
    },

    /// A non-terminal chain step completed.
    ///
    /// Best-effort notification only; the dispatcher owns actual delivery
    /// of the next step.
    ChainAdvanced {
        /// Chain identifier.
        chain_id: ChainId,
        /// Queue the chain runs on.
        queue_name: String,
        /// Index of the step that completed.
        completed_index: u32,
        /// Index of the next step.
        next_index: u32,
    },
}

impl EngineEvent {
    /// Returns the kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::TaskAdded { .. } => EventKind::TaskAdded,
            Self::TaskCompleted { .. } => EventKind::TaskCompleted,
            Self::TaskFailed { .. } => EventKind::TaskFailed,
            Self::TaskProgress { .. } => EventKind::TaskProgress,
            Self::ChainAdvanced { .. } => EventKind::ChainAdvanced,
        }
    }

    /// Returns the event name (`snake_case`).
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::TaskAdded { .. } => "task_added",
            Self::TaskCompleted { .. } => "task_completed",
            Self::TaskFailed { .. } => "task_failed",
            Self::TaskProgress { .. } => "task_progress",
            Self::ChainAdvanced { .. } => "chain_advanced",
        }
    }

    /// Returns the task ID associated with this event (if any).
    #[must_use]
    pub const fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::TaskAdded { task_id, .. }
            | Self::TaskCompleted { task_id, .. }
            | Self::TaskFailed { task_id, .. }
            | Self::TaskProgress { task_id, .. } => Some(task_id),
            Self::ChainAdvanced { .. } => None,
        }
    }
}

/// A registered event listener.
type Listener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

#[derive(Default)]
struct BusState {
    listeners: HashMap<EventKind, Vec<(u64, Listener)>>,
}

#[derive(Default)]
struct BusInner {
    state: RwLock<BusState>,
    next_id: AtomicU64,
}

/// Synchronous, isolated event delivery.
///
/// Cloning the bus shares the underlying listener table, so components
/// hold cheap clones.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    /// Creates an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener for events of `kind`.
    ///
    /// `EventKind::Any` receives every event. The returned
    /// [`Subscription`] is the unsubscriber; dropping it without calling
    /// [`Subscription::unsubscribe`] leaves the listener registered.
    pub fn subscribe(
        &self,
        kind: EventKind,
        listener: impl Fn(&EngineEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut state) = self.inner.state.write() {
            state
                .listeners
                .entry(kind)
                .or_default()
                .push((id, Arc::new(listener)));
        }

        Subscription {
            bus: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Delivers an event to every matching listener.
    ///
    /// Listener panics are caught and logged so one failing listener
    /// cannot prevent others from running.
    pub fn emit(&self, event: &EngineEvent) {
        let matching: Vec<Listener> = {
            let Ok(state) = self.inner.state.read() else {
                return;
            };
            let mut matching = Vec::new();
            if let Some(listeners) = state.listeners.get(&event.kind()) {
                matching.extend(listeners.iter().map(|(_, l)| Arc::clone(l)));
            }
            if let Some(listeners) = state.listeners.get(&EventKind::Any) {
                matching.extend(listeners.iter().map(|(_, l)| Arc::clone(l)));
            }
            matching
        };

        for listener in matching {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!(event = event.event_name(), "event listener panicked");
            }
        }
    }

    /// Returns the number of registered listeners (all kinds).
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner
            .state
            .read()
            .map(|state| state.listeners.values().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

/// Handle returned by [`EventBus::subscribe`]; the unsubscriber.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<BusInner>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    /// Removes the listener from the bus.
    pub fn unsubscribe(self) {
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        if let Ok(mut state) = inner.state.write() {
            if let Some(listeners) = state.listeners.get_mut(&self.kind) {
                listeners.retain(|(id, _)| *id != self.id);
            }
        };
    }
}
