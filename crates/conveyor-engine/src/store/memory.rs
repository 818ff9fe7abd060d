//! In-memory storage adapter.
//!
//! This module provides [`InMemoryStore`], the reference implementation of
//! the [`StorageAdapter`] trait, suitable for testing, development, and
//! single-process deployments.
//!
//! ## Limitations
//!
//! - **Single-process only**: State is not shared across process
//!   boundaries, so uniqueness locks and rate limits only coordinate
//!   within one process
//! - **No persistence**: All state is lost when the process exits

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use conveyor_core::{ChainId, TaskId};

use super::{
    sort_and_paginate, CleanupPolicy, RateLimitIncrement, RateLimitWindow, StorageAdapter,
    TaskFilter, TaskPatch,
};
use crate::error::{Error, Result};
use crate::task::{now_millis, Task, TaskStatus};

/// A uniqueness lock held in memory.
#[derive(Debug, Clone)]
struct UniquenessLock {
    #[allow(dead_code)] // Read for debugging; lookups resolve tasks via query_tasks.
    task_id: TaskId,
    expires_at: DateTime<Utc>,
}

/// Mutable adapter state behind one lock.
///
/// Guarding everything with a single lock makes each adapter operation
/// atomic, including the rate-limit increment.
#[derive(Debug, Default)]
struct StoreState {
    tasks: HashMap<TaskId, Task>,
    uniqueness: HashMap<String, UniquenessLock>,
    rate_limits: HashMap<String, RateLimitWindow>,
}

/// In-memory storage adapter.
///
/// ## Example
///
/// ```rust
/// use conveyor_engine::store::memory::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// // Use store in tests...
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("store lock poisoned")
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of tasks currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn task_count(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.tasks.len())
    }
}

#[async_trait]
impl StorageAdapter for InMemoryStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.tasks.get(task_id).cloned())
    }

    async fn update_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        patch: TaskPatch,
    ) -> Result<Task> {
        let mut state = self.state.write().map_err(poison_err)?;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or(Error::TaskNotFound { task_id: *task_id })?;

        patch.apply(task, status, now_millis());
        Ok(task.clone())
    }

    async fn delete_task(&self, task_id: &TaskId) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        Ok(state.tasks.remove(task_id).is_some())
    }

    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let matching = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .tasks
                .values()
                .filter(|t| filter.matches(t))
                .cloned()
                .collect::<Vec<_>>()
        };
        Ok(sort_and_paginate(matching, filter))
    }

    async fn count_tasks(&self, filter: &TaskFilter) -> Result<u64> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.tasks.values().filter(|t| filter.matches(t)).count() as u64)
    }

    async fn is_uniqueness_key_active(&self, key: &str) -> Result<bool> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .uniqueness
            .get(key)
            .is_some_and(|lock| lock.expires_at > Utc::now()))
    }

    async fn set_uniqueness_key_active(
        &self,
        key: &str,
        task_id: &TaskId,
        ttl: Duration,
    ) -> Result<bool> {
        let mut state = self.state.write().map_err(poison_err)?;
        let now = Utc::now();

        if let Some(existing) = state.uniqueness.get(key) {
            if existing.expires_at > now {
                return Ok(false);
            }
        }

        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| Error::invalid_argument(format!("uniqueness ttl out of range: {e}")))?;
        state.uniqueness.insert(
            key.to_string(),
            UniquenessLock {
                task_id: *task_id,
                expires_at,
            },
        );
        Ok(true)
    }

    async fn remove_uniqueness_key(&self, key: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.uniqueness.remove(key);
        Ok(())
    }

    async fn increment_rate_limit(
        &self,
        key: &str,
        window: Duration,
        max_requests: u32,
    ) -> Result<RateLimitIncrement> {
        let mut state = self.state.write().map_err(poison_err)?;
        let now = Utc::now();

        let window_len = chrono::Duration::from_std(window)
            .map_err(|e| Error::invalid_argument(format!("rate window out of range: {e}")))?;

        let entry = state
            .rate_limits
            .entry(key.to_string())
            .and_modify(|w| {
                if now >= w.reset_time {
                    // Window expired: open a fresh one.
                    w.count = 0;
                    w.reset_time = now + window_len;
                }
            })
            .or_insert(RateLimitWindow {
                count: 0,
                reset_time: now + window_len,
            });

        entry.count += 1;

        Ok(RateLimitIncrement {
            allowed: entry.count <= u64::from(max_requests),
            count: entry.count,
            reset_time: entry.reset_time,
        })
    }

    async fn get_rate_limit(&self, key: &str) -> Result<Option<RateLimitWindow>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .rate_limits
            .get(key)
            .filter(|w| w.reset_time > Utc::now())
            .copied())
    }

    async fn delete_rate_limit(&self, key: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.rate_limits.remove(key);
        Ok(())
    }

    async fn has_active_task_in_chain(&self, chain_id: &ChainId) -> Result<bool> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.tasks.values().any(|t| {
            t.chain.map(|c| c.id) == Some(*chain_id)
                && matches!(t.status, TaskStatus::Idle | TaskStatus::Active)
        }))
    }

    async fn get_chain_tasks(&self, chain_id: &ChainId) -> Result<Vec<Task>> {
        let mut members: Vec<Task> = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .tasks
                .values()
                .filter(|t| t.chain.map(|c| c.id) == Some(*chain_id))
                .cloned()
                .collect()
        };
        members.sort_by_key(|t| t.chain.map_or(0, |c| c.index));
        Ok(members)
    }

    async fn get_next_task_in_chain(
        &self,
        chain_id: &ChainId,
        index: u32,
    ) -> Result<Option<Task>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .tasks
            .values()
            .find(|t| t.chain.is_some_and(|c| c.id == *chain_id && c.index == index))
            .cloned())
    }

    async fn cleanup(&self, policy: &CleanupPolicy) -> Result<u64> {
        let mut state = self.state.write().map_err(poison_err)?;
        let before = state.tasks.len();
        state.tasks.retain(|_, task| !policy.matches(task));
        Ok((before - state.tasks.len()) as u64)
    }
}
