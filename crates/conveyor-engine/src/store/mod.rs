//! Pluggable storage for task-queue state.
//!
//! The [`StorageAdapter`] trait defines the persistence layer for tasks,
//! uniqueness locks, rate-limit windows, and chain membership. It is the
//! synchronisation boundary of the engine: every operation behaves
//! atomically with respect to concurrent callers across all processes
//! sharing the same backing store.
//!
//! ## Design Principles
//!
//! - **Single mutator**: all persistent mutations go through the adapter
//! - **Atomic primitives**: uniqueness acquisition and rate-limit
//!   increments are test-and-set operations, not read-modify-write
//! - **No internal retries**: transient backend failures surface to the
//!   caller, who decides whether to retry
//!
//! ## Implementations
//!
//! - [`memory::InMemoryStore`] — process-local reference implementation
//! - `redis::RedisStore` — key-value adapter (feature `redis`)
//! - `mongo::MongoStore` — document-store adapter (feature `mongo`)

pub mod memory;

#[cfg(feature = "mongo")]
pub mod mongo;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use conveyor_core::{ChainId, TaskId};

use crate::error::Result;
use crate::task::{Task, TaskFailure, TaskProgress, TaskStatus};

/// Partial update merged over an existing task record.
///
/// Only populated fields are written; everything else keeps its stored
/// value. The adapter stamps `updated_at` itself on every status update.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    /// New attempt count.
    pub attempts: Option<u32>,
    /// Handler result.
    pub result: Option<Value>,
    /// Failure record.
    pub error: Option<TaskFailure>,
    /// Progress record.
    pub progress: Option<TaskProgress>,
    /// First-activation timestamp.
    pub active_at: Option<DateTime<Utc>>,
    /// Completion timestamp.
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal-failure timestamp.
    pub failed_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    /// Applies this patch over a task in place, stamping `updated_at`.
    pub(crate) fn apply(&self, task: &mut Task, status: TaskStatus, now: DateTime<Utc>) {
        task.status = status;
        if let Some(attempts) = self.attempts {
            task.attempts = attempts;
        }
        if let Some(result) = &self.result {
            task.result = Some(result.clone());
        }
        if let Some(error) = &self.error {
            task.error = Some(error.clone());
        }
        if let Some(progress) = &self.progress {
            task.progress = Some(progress.clone());
        }
        if let Some(active_at) = self.active_at {
            task.active_at = Some(active_at);
        }
        if let Some(completed_at) = self.completed_at {
            task.completed_at = Some(completed_at);
        }
        if let Some(failed_at) = self.failed_at {
            task.failed_at = Some(failed_at);
        }
        task.updated_at = now;
    }
}

/// Field a task query can be sorted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    /// Sort by creation time.
    CreatedAt,
    /// Sort by last mutation time.
    UpdatedAt,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortDirection {
    /// Oldest first.
    Ascending,
    /// Newest first.
    Descending,
}

/// Sort specification for task queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSort {
    /// Field to sort on.
    pub field: SortField,
    /// Direction.
    pub direction: SortDirection,
}

/// Filter for task queries.
///
/// All populated clauses are conjunctive. With a `sort` the result
/// ordering is stable; without one the order is unspecified.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Match any of these statuses (empty = all statuses).
    pub statuses: Vec<TaskStatus>,
    /// Match this queue.
    pub queue_name: Option<String>,
    /// Match members of this chain.
    pub chain_id: Option<ChainId>,
    /// Match this uniqueness key.
    pub uniqueness_key: Option<String>,
    /// Match tasks created at or after this instant.
    pub created_after: Option<DateTime<Utc>>,
    /// Match tasks created at or before this instant.
    pub created_before: Option<DateTime<Utc>>,
    /// Result ordering.
    pub sort: Option<TaskSort>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Number of matching results to skip.
    pub offset: usize,
}

impl TaskFilter {
    /// Creates an empty filter matching every task.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to a single status.
    #[must_use]
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.push(status);
        self
    }

    /// Restricts to a queue.
    #[must_use]
    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    /// Restricts to a chain.
    #[must_use]
    pub const fn with_chain(mut self, chain_id: ChainId) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    /// Restricts to a uniqueness key.
    #[must_use]
    pub fn with_uniqueness_key(mut self, key: impl Into<String>) -> Self {
        self.uniqueness_key = Some(key.into());
        self
    }

    /// Sets the result ordering.
    #[must_use]
    pub const fn with_sort(mut self, field: SortField, direction: SortDirection) -> Self {
        self.sort = Some(TaskSort { field, direction });
        self
    }

    /// Limits the number of results.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if the task matches every populated clause.
    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if let Some(queue) = &self.queue_name {
            if &task.queue_name != queue {
                return false;
            }
        }
        if let Some(chain_id) = self.chain_id {
            if task.chain.map(|c| c.id) != Some(chain_id) {
                return false;
            }
        }
        if let Some(key) = &self.uniqueness_key {
            if task.uniqueness_key.as_ref() != Some(key) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if task.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if task.created_at > before {
                return false;
            }
        }
        true
    }
}

/// Sorts and paginates an in-process result set according to a filter.
///
/// Shared by adapters that filter in process. Sorting ties break on task
/// ID so ordering is stable.
pub(crate) fn sort_and_paginate(mut tasks: Vec<Task>, filter: &TaskFilter) -> Vec<Task> {
    if let Some(sort) = filter.sort {
        tasks.sort_by(|a, b| {
            let ordering = match sort.field {
                SortField::CreatedAt => a.created_at.cmp(&b.created_at),
                SortField::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            };
            let ordering = ordering.then_with(|| a.id.cmp(&b.id));
            match sort.direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            }
        });
    }

    tasks
        .into_iter()
        .skip(filter.offset)
        .take(filter.limit.unwrap_or(usize::MAX))
        .collect()
}

/// Bulk-deletion policy for `cleanup`.
///
/// A task is deleted iff any enabled clause (`statuses`,
/// `remove_completed`, `remove_failed`) matches AND the age gate (when
/// set) is satisfied. When no clause is enabled but `older_than` is set,
/// any task older than the gate is deleted.
#[derive(Debug, Clone, Default)]
pub struct CleanupPolicy {
    /// Age gate: only tasks created before this instant are considered.
    pub older_than: Option<DateTime<Utc>>,
    /// Delete tasks in any of these statuses.
    pub statuses: Vec<TaskStatus>,
    /// Delete completed tasks.
    pub remove_completed: bool,
    /// Delete failed tasks.
    pub remove_failed: bool,
}

impl CleanupPolicy {
    /// Creates an empty policy matching nothing.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the age gate.
    #[must_use]
    pub const fn with_older_than(mut self, instant: DateTime<Utc>) -> Self {
        self.older_than = Some(instant);
        self
    }

    /// Adds a status clause.
    #[must_use]
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.statuses.push(status);
        self
    }

    /// Enables the completed-tasks clause.
    #[must_use]
    pub const fn removing_completed(mut self) -> Self {
        self.remove_completed = true;
        self
    }

    /// Enables the failed-tasks clause.
    #[must_use]
    pub const fn removing_failed(mut self) -> Self {
        self.remove_failed = true;
        self
    }

    /// Returns true if the policy deletes the given task.
    #[must_use]
    pub fn matches(&self, task: &Task) -> bool {
        if let Some(gate) = self.older_than {
            if task.created_at >= gate {
                return false;
            }
        }

        let any_clause_enabled =
            !self.statuses.is_empty() || self.remove_completed || self.remove_failed;

        if !any_clause_enabled {
            // Pure age-based cleanup.
            return self.older_than.is_some();
        }

        self.statuses.contains(&task.status)
            || (self.remove_completed && task.status == TaskStatus::Completed)
            || (self.remove_failed && task.status == TaskStatus::Failed)
    }
}

/// State of a rate-limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitWindow {
    /// Number of increments recorded in the current window.
    pub count: u64,
    /// Absolute instant the window expires. Fixed at window creation.
    pub reset_time: DateTime<Utc>,
}

/// Result of an atomic rate-limit increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitIncrement {
    /// Whether the increment stayed within the limit.
    pub allowed: bool,
    /// Counter value after the increment.
    pub count: u64,
    /// Absolute instant the current window expires.
    pub reset_time: DateTime<Utc>,
}

/// Storage abstraction for task-queue state.
///
/// Implementations must behave atomically with respect to concurrent
/// callers across multiple processes sharing the same backing store.
/// Every operation fails with one of the engine's `NotFound`, `Conflict`,
/// `Backend`, or `InvalidArgument` kinds; transient backend failures are
/// retried by callers at their discretion, never by the adapter.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from the
/// producer, the consumer, and administrative callers.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    // --- Task operations ---

    /// Upserts a task by ID. Last-writer-wins on non-status fields; the
    /// caller is responsible for read-modify-write ordering.
    async fn save_task(&self, task: &Task) -> Result<()>;

    /// Gets a task by ID. Returns `None` if absent.
    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>>;

    /// Transitions a task's status and merges `patch` over the stored
    /// record, stamping `updated_at` with the current time.
    ///
    /// No compare-and-swap is performed at this layer; the consumer's
    /// concurrency guard owns that responsibility.
    ///
    /// Returns the updated task.
    async fn update_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        patch: TaskPatch,
    ) -> Result<Task>;

    /// Deletes a task. Returns true if a task was removed.
    async fn delete_task(&self, task_id: &TaskId) -> Result<bool>;

    /// Queries tasks matching the filter.
    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>>;

    /// Counts tasks matching the filter (ignoring limit/offset).
    async fn count_tasks(&self, filter: &TaskFilter) -> Result<u64>;

    // --- Uniqueness locks ---

    /// Returns true if a live (unexpired) lock exists for the key.
    async fn is_uniqueness_key_active(&self, key: &str) -> Result<bool>;

    /// Atomically acquires the uniqueness lock for `key`.
    ///
    /// Returns false if another live lock exists. Locks expire at
    /// `now + ttl` and are ignored or cleaned once expired.
    async fn set_uniqueness_key_active(
        &self,
        key: &str,
        task_id: &TaskId,
        ttl: Duration,
    ) -> Result<bool>;

    /// Removes the uniqueness lock for `key`, if any.
    async fn remove_uniqueness_key(&self, key: &str) -> Result<()>;

    // --- Rate-limit windows ---

    /// Atomically increments the counter for `key` within its current
    /// fixed window, opening a new window when none is live.
    ///
    /// The window's `reset_time` is fixed when the window opens and is
    /// never extended by subsequent increments. The returned count
    /// reflects the counter after this increment and
    /// `allowed == (count <= max_requests)`.
    async fn increment_rate_limit(
        &self,
        key: &str,
        window: Duration,
        max_requests: u32,
    ) -> Result<RateLimitIncrement>;

    /// Returns the live window for `key` without incrementing, or `None`
    /// when no window is open.
    async fn get_rate_limit(&self, key: &str) -> Result<Option<RateLimitWindow>>;

    /// Deletes the rate-limit window for `key`, if any.
    async fn delete_rate_limit(&self, key: &str) -> Result<()>;

    // --- Chains ---

    /// Returns true if any member of the chain is Idle or Active.
    async fn has_active_task_in_chain(&self, chain_id: &ChainId) -> Result<bool>;

    /// Returns all members of the chain ordered by chain index.
    async fn get_chain_tasks(&self, chain_id: &ChainId) -> Result<Vec<Task>>;

    /// Returns the chain member at `index`, if present.
    async fn get_next_task_in_chain(
        &self,
        chain_id: &ChainId,
        index: u32,
    ) -> Result<Option<Task>>;

    // --- Maintenance ---

    /// Bulk-deletes tasks matching the policy. Returns the exact count of
    /// deleted tasks.
    async fn cleanup(&self, policy: &CleanupPolicy) -> Result<u64>;

    /// Releases backend resources. Called once by `Engine::close`.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
