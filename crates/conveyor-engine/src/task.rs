//! Task model and lifecycle helpers.
//!
//! This module provides:
//! - `TaskStatus`: The four-state task lifecycle
//! - `Task`: The central persisted entity
//! - `TaskFailure`: Error information from a failed attempt
//! - `TaskProgress`: In-flight progress reporting
//! - `ChainPosition`: Location of a task within an ordered chain
//! - `TaskOptions`: Caller-supplied per-task options
//!
//! Helpers mutate in-memory state and stamp `updated_at`; persistence is a
//! separate step through the storage adapter and helpers never perform I/O.
//!
//! Timestamps are serialized as absolute millisecond timestamps and all
//! stamps are taken at millisecond precision, so a serialize/deserialize
//! round trip preserves every field exactly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use conveyor_core::{ChainId, TaskId};

#[cfg(test)]
use crate::config::DEFAULT_MAX_ATTEMPTS;

/// Returns the current wall-clock time truncated to millisecond precision.
///
/// All task timestamps share this precision so persisted and re-read tasks
/// compare equal.
#[must_use]
pub(crate) fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Task lifecycle states.
///
/// ```text
///              delivery arrives          handler ok
/// ┌──────┐ ──────────────────► ┌────────┐ ─────────► ┌───────────┐
/// │ IDLE │                     │ ACTIVE │            │ COMPLETED │
/// └──────┘ ◄────────────────── └────────┘            └───────────┘
///            handler failed,        │
///            attempts remain        │ handler failed,
///                                   │ attempts exhausted
///                                   ▼
///                              ┌────────┐
///                              │ FAILED │
///                              └────────┘
/// ```
///
/// `Completed` and `Failed` are terminal: no further transitions are
/// permitted except deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting for a delivery (newly created or awaiting retry).
    Idle,
    /// A delivery is being processed.
    Active,
    /// The handler succeeded.
    Completed,
    /// Attempts are exhausted.
    Failed,
}

impl TaskStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Error information recorded on a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    /// Error message.
    pub message: String,
    /// Stack trace or detail, when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// When the failure was recorded.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl TaskFailure {
    /// Creates a failure record stamped now.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            timestamp: now_millis(),
        }
    }

    /// Attaches a stack trace or detail string.
    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// Progress of an in-flight task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    /// Completion percentage in `[0, 100]`.
    pub percentage: f64,
    /// Optional handler-supplied progress payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl TaskProgress {
    /// Creates a progress record, clamping the percentage to `[0, 100]`.
    #[must_use]
    pub fn new(percentage: f64) -> Self {
        Self {
            percentage: percentage.clamp(0.0, 100.0),
            data: None,
        }
    }

    /// Attaches a progress payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Returns a copy with the percentage clamped to `[0, 100]`.
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.percentage = self.percentage.clamp(0.0, 100.0);
        self
    }
}

/// Location of a task within an ordered chain.
///
/// All sibling tasks of a chain share the same `id` and `total`, and
/// indices form the contiguous range `[0, total)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainPosition {
    /// Chain identifier shared by all members.
    pub id: ChainId,
    /// Zero-based position of this task.
    pub index: u32,
    /// Number of tasks in the chain.
    pub total: u32,
    /// Whether this step is intended to wait for the previous one.
    ///
    /// Recorded for observability; delivery timing is the dispatcher's
    /// responsibility and the engine does not withhold downstream steps.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub wait_for_previous: bool,
}

/// Caller-supplied options for a new task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOptions {
    /// Handler selector within the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,

    /// Attempt cap override; defaults from queue configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Delay before the earliest dispatch.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub delay: Option<std::time::Duration>,

    /// User-supplied deduplication key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uniqueness_key: Option<String>,

    /// Delete the task (and its uniqueness lock) once it completes.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub remove_on_complete: bool,

    /// Delete the task (and its uniqueness lock) once it terminally fails.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub remove_on_fail: bool,

    /// Dispatch priority hint (lower = higher priority).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    /// Chain membership, populated by `add_chain`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainPosition>,
}

/// The central persisted entity of the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Globally unique identifier. Immutable.
    pub id: TaskId,

    /// Logical queue identifier. Immutable.
    pub queue_name: String,

    /// Handler selector within the queue. Immutable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,

    /// Opaque caller payload. Immutable.
    pub data: Value,

    /// Lifecycle state.
    pub status: TaskStatus,

    /// Count of delivery attempts consumed. Monotonic non-decreasing.
    pub attempts: u32,

    /// Fixed attempt cap. Immutable.
    pub max_attempts: u32,

    /// Creation timestamp.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,

    /// Last-mutation timestamp; monotonic within a task's lifecycle.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,

    /// Set on the first transition into `Active`.
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub active_at: Option<DateTime<Utc>>,

    /// Set on the transition into `Completed`.
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub completed_at: Option<DateTime<Utc>>,

    /// Set on the transition into `Failed`.
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub failed_at: Option<DateTime<Utc>>,

    /// Earliest dispatch time, when the task was added with a delay.
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub scheduled_for: Option<DateTime<Utc>>,

    /// Handler result, set on `Completed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Failure record, set on `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,

    /// Latest reported progress; overwritten by updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TaskProgress>,

    /// Chain membership.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainPosition>,

    /// User-supplied deduplication key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uniqueness_key: Option<String>,

    /// Options the task was created with.
    #[serde(default)]
    pub options: TaskOptions,
}

impl Task {
    /// Builds a new idle task from caller input.
    ///
    /// `max_attempts` has already been resolved by the producer from the
    /// options/queue/default cascade.
    #[must_use]
    pub fn new(
        id: TaskId,
        queue_name: impl Into<String>,
        data: Value,
        options: TaskOptions,
        max_attempts: u32,
    ) -> Self {
        let now = now_millis();
        let scheduled_for = options
            .delay
            .filter(|d| !d.is_zero())
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);

        Self {
            id,
            queue_name: queue_name.into(),
            task_name: options.task_name.clone(),
            data,
            status: TaskStatus::Idle,
            attempts: 0,
            max_attempts,
            created_at: now,
            updated_at: now,
            active_at: None,
            completed_at: None,
            failed_at: None,
            scheduled_for,
            result: None,
            error: None,
            progress: None,
            chain: options.chain,
            uniqueness_key: options.uniqueness_key.clone(),
            options,
        }
    }

    /// Returns true if the task is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Marks the task active, stamping `active_at` on the first activation.
    pub fn mark_active(&mut self) {
        let now = now_millis();
        self.status = TaskStatus::Active;
        if self.active_at.is_none() {
            self.active_at = Some(now);
        }
        self.updated_at = now;
    }

    /// Marks the task completed with the handler result.
    pub fn mark_completed(&mut self, result: Value) {
        let now = now_millis();
        self.status = TaskStatus::Completed;
        self.result = Some(result);
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Marks the task terminally failed.
    pub fn mark_failed(&mut self, error: TaskFailure) {
        let now = now_millis();
        self.status = TaskStatus::Failed;
        self.error = Some(error);
        self.failed_at = Some(now);
        self.updated_at = now;
    }

    /// Consumes one attempt.
    pub fn increment_attempts(&mut self) {
        self.attempts += 1;
        self.updated_at = now_millis();
    }

    /// Overwrites the task's progress, clamping the percentage.
    pub fn update_progress(&mut self, progress: TaskProgress) {
        self.progress = Some(progress.clamped());
        self.updated_at = now_millis();
    }

    /// Returns true if the task belongs to a chain.
    #[must_use]
    pub const fn is_in_chain(&self) -> bool {
        self.chain.is_some()
    }

    /// Returns true if the task is the last step of its chain.
    ///
    /// Tasks outside any chain are trivially last.
    #[must_use]
    pub fn is_last_in_chain(&self) -> bool {
        self.chain.is_none_or(|c| c.index + 1 >= c.total)
    }

    /// Returns the index of the next chain step, if one exists.
    #[must_use]
    pub fn next_chain_index(&self) -> Option<u32> {
        let chain = self.chain?;
        (chain.index + 1 < chain.total).then_some(chain.index + 1)
    }

    /// Returns true if the task should be deleted after completing.
    #[must_use]
    pub const fn should_remove_on_complete(&self) -> bool {
        self.options.remove_on_complete
    }

    /// Returns true if the task should be deleted after terminally failing.
    #[must_use]
    pub const fn should_remove_on_fail(&self) -> bool {
        self.options.remove_on_fail
    }

    /// Returns the creation-to-completion duration, once completed.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.created_at)
    }
}
