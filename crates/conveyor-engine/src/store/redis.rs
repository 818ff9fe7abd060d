//! Redis key-value storage adapter.
//!
//! Layout (all keys share a configurable prefix):
//!
//! - `{prefix}task:{id}` — task JSON blob
//! - `{prefix}queue:{name}` — sorted set of task IDs scored by creation
//!   time
//! - `{prefix}chain:{id}` — sorted set of task IDs scored by chain index
//! - `{prefix}unique:{key}` — uniqueness lock (`SET NX PX`, native TTL)
//! - `{prefix}rate:{key}` — hash `{count, resetTime}` with native expiry
//!
//! The rate-limit increment runs as one Lua script (`HINCRBY` +
//! `HSETNX(resetTime)` + `PEXPIRE` on the opening increment), so the
//! counter cannot overshoot under contention and a window's `resetTime`
//! is never rewritten after the window opens.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::{Config as RedisConfig, Pool, Runtime};

use conveyor_core::{ChainId, TaskId};

use super::{
    sort_and_paginate, CleanupPolicy, RateLimitIncrement, RateLimitWindow, StorageAdapter,
    TaskFilter, TaskPatch,
};
use crate::error::{Error, Result};
use crate::task::{now_millis, Task, TaskStatus};

/// Atomic fixed-window increment.
///
/// KEYS[1] = rate key, ARGV[1] = proposed resetTime (ms epoch),
/// ARGV[2] = window length (ms). Returns `{count, resetTime}`.
const INCREMENT_RATE_LIMIT_SCRIPT: &str = r"
local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
if count == 1 then
  redis.call('HSETNX', KEYS[1], 'resetTime', ARGV[1])
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
local reset = redis.call('HGET', KEYS[1], 'resetTime')
return {count, reset}
";

/// Redis-backed storage adapter.
pub struct RedisStore {
    pool: Pool,
    prefix: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

fn redis_err(context: &str, err: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::storage_with_source(format!("redis {context} failed"), err)
}

impl RedisStore {
    /// Connects to Redis and builds the adapter.
    ///
    /// # Errors
    ///
    /// Returns a `Backend`-kind error when the pool cannot be created.
    pub async fn connect(url: &str, prefix: String) -> Result<Self> {
        let pool = RedisConfig::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| Error::storage(format!("failed to create redis pool: {e}")))?;

        Ok(Self { pool, prefix })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::storage(format!("redis connection unavailable: {e}")))
    }

    fn task_key(&self, task_id: &TaskId) -> String {
        format!("{}task:{task_id}", self.prefix)
    }

    fn queue_key(&self, queue_name: &str) -> String {
        format!("{}queue:{queue_name}", self.prefix)
    }

    fn chain_key(&self, chain_id: &ChainId) -> String {
        format!("{}chain:{chain_id}", self.prefix)
    }

    fn unique_key(&self, key: &str) -> String {
        format!("{}unique:{key}", self.prefix)
    }

    fn rate_key(&self, key: &str) -> String {
        format!("{}rate:{key}", self.prefix)
    }

    fn encode(task: &Task) -> Result<String> {
        serde_json::to_string(task).map_err(|e| Error::serialization(e.to_string()))
    }

    fn decode(blob: &str) -> Result<Task> {
        serde_json::from_str(blob).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Loads the task blobs for a set of IDs, skipping IDs whose blob has
    /// disappeared (index entries can outlive a concurrent delete).
    async fn load_tasks(&self, ids: &[String]) -> Result<Vec<Task>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = ids
            .iter()
            .map(|id| format!("{}task:{id}", self.prefix))
            .collect();

        let mut conn = self.conn().await?;
        let blobs: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("MGET", e))?;

        blobs
            .into_iter()
            .flatten()
            .map(|blob| Self::decode(&blob))
            .collect()
    }

    /// Collects every task ID via SCAN over the task keyspace.
    async fn scan_task_ids(&self) -> Result<Vec<String>> {
        let pattern = format!("{}task:*", self.prefix);
        let strip = format!("{}task:", self.prefix);
        let mut conn = self.conn().await?;

        let mut ids = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await
                .map_err(|e| redis_err("SCAN", e))?;

            ids.extend(
                batch
                    .into_iter()
                    .filter_map(|key| key.strip_prefix(&strip).map(str::to_string)),
            );

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(ids)
    }

    /// Fetches all tasks relevant to a filter, narrowing through the
    /// chain or queue index when possible.
    async fn fetch_candidates(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let ids: Vec<String> = if let Some(chain_id) = filter.chain_id {
            let mut conn = self.conn().await?;
            conn.zrange(self.chain_key(&chain_id), 0, -1)
                .await
                .map_err(|e| redis_err("ZRANGE", e))?
        } else if let Some(queue_name) = &filter.queue_name {
            let mut conn = self.conn().await?;
            conn.zrange(self.queue_key(queue_name), 0, -1)
                .await
                .map_err(|e| redis_err("ZRANGE", e))?
        } else {
            self.scan_task_ids().await?
        };

        let tasks = self.load_tasks(&ids).await?;
        Ok(tasks.into_iter().filter(|t| filter.matches(t)).collect())
    }

    /// Removes a task blob and its index entries.
    async fn delete_task_entry(&self, task: &Task) -> Result<bool> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.del(self.task_key(&task.id))
            .zrem(self.queue_key(&task.queue_name), task.id.to_string());
        if let Some(chain) = task.chain {
            pipe.zrem(self.chain_key(&chain.id), task.id.to_string());
        }

        let results: Vec<i64> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("DEL", e))?;
        Ok(results.first().copied().unwrap_or(0) > 0)
    }
}

#[async_trait]
impl StorageAdapter for RedisStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        let blob = Self::encode(task)?;
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        pipe.set(self.task_key(&task.id), blob).zadd(
            self.queue_key(&task.queue_name),
            task.id.to_string(),
            task.created_at.timestamp_millis(),
        );
        if let Some(chain) = task.chain {
            pipe.zadd(
                self.chain_key(&chain.id),
                task.id.to_string(),
                i64::from(chain.index),
            );
        }

        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| redis_err("SET", e))?;
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        let mut conn = self.conn().await?;
        let blob: Option<String> = conn
            .get(self.task_key(task_id))
            .await
            .map_err(|e| redis_err("GET", e))?;

        blob.map(|b| Self::decode(&b)).transpose()
    }

    async fn update_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        patch: TaskPatch,
    ) -> Result<Task> {
        // Read-modify-write; callers serialize conflicting transitions.
        let mut task = self
            .get_task(task_id)
            .await?
            .ok_or(Error::TaskNotFound { task_id: *task_id })?;

        patch.apply(&mut task, status, now_millis());

        let blob = Self::encode(&task)?;
        let mut conn = self.conn().await?;
        conn.set::<_, _, ()>(self.task_key(task_id), blob)
            .await
            .map_err(|e| redis_err("SET", e))?;

        Ok(task)
    }

    async fn delete_task(&self, task_id: &TaskId) -> Result<bool> {
        let Some(task) = self.get_task(task_id).await? else {
            return Ok(false);
        };
        self.delete_task_entry(&task).await
    }

    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let matching = self.fetch_candidates(filter).await?;
        Ok(sort_and_paginate(matching, filter))
    }

    async fn count_tasks(&self, filter: &TaskFilter) -> Result<u64> {
        let matching = self.fetch_candidates(filter).await?;
        Ok(matching.len() as u64)
    }

    async fn is_uniqueness_key_active(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn().await?;
        conn.exists(self.unique_key(key))
            .await
            .map_err(|e| redis_err("EXISTS", e))
    }

    async fn set_uniqueness_key_active(
        &self,
        key: &str,
        task_id: &TaskId,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.conn().await?;
        // SET NX PX is the atomic test-and-set; native TTL handles expiry.
        let outcome: Option<String> = redis::cmd("SET")
            .arg(self.unique_key(key))
            .arg(task_id.to_string())
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("SET NX", e))?;

        Ok(outcome.is_some())
    }

    async fn remove_uniqueness_key(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.unique_key(key))
            .await
            .map_err(|e| redis_err("DEL", e))?;
        Ok(())
    }

    async fn increment_rate_limit(
        &self,
        key: &str,
        window: Duration,
        max_requests: u32,
    ) -> Result<RateLimitIncrement> {
        let now = Utc::now();
        let window_ms = window.as_millis() as i64;
        let proposed_reset = now.timestamp_millis() + window_ms;

        let mut conn = self.conn().await?;
        let (count, reset_ms): (i64, i64) = redis::Script::new(INCREMENT_RATE_LIMIT_SCRIPT)
            .key(self.rate_key(key))
            .arg(proposed_reset)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_err("rate-limit script", e))?;

        let count = u64::try_from(count).unwrap_or(0);
        let reset_time = DateTime::from_timestamp_millis(reset_ms).unwrap_or(now);

        Ok(RateLimitIncrement {
            allowed: count <= u64::from(max_requests),
            count,
            reset_time,
        })
    }

    async fn get_rate_limit(&self, key: &str) -> Result<Option<RateLimitWindow>> {
        let mut conn = self.conn().await?;
        let (count, reset_ms): (Option<i64>, Option<i64>) = redis::cmd("HMGET")
            .arg(self.rate_key(key))
            .arg("count")
            .arg("resetTime")
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_err("HMGET", e))?;

        let (Some(count), Some(reset_ms)) = (count, reset_ms) else {
            return Ok(None);
        };

        let Some(reset_time) = DateTime::from_timestamp_millis(reset_ms) else {
            return Ok(None);
        };

        Ok(Some(RateLimitWindow {
            count: u64::try_from(count).unwrap_or(0),
            reset_time,
        }))
    }

    async fn delete_rate_limit(&self, key: &str) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.rate_key(key))
            .await
            .map_err(|e| redis_err("DEL", e))?;
        Ok(())
    }

    async fn has_active_task_in_chain(&self, chain_id: &ChainId) -> Result<bool> {
        let members = self.get_chain_tasks(chain_id).await?;
        Ok(members
            .iter()
            .any(|t| matches!(t.status, TaskStatus::Idle | TaskStatus::Active)))
    }

    async fn get_chain_tasks(&self, chain_id: &ChainId) -> Result<Vec<Task>> {
        let ids: Vec<String> = {
            let mut conn = self.conn().await?;
            conn.zrange(self.chain_key(chain_id), 0, -1)
                .await
                .map_err(|e| redis_err("ZRANGE", e))?
        };

        // ZRANGE returns members in index order already.
        self.load_tasks(&ids).await
    }

    async fn get_next_task_in_chain(
        &self,
        chain_id: &ChainId,
        index: u32,
    ) -> Result<Option<Task>> {
        let ids: Vec<String> = {
            let mut conn = self.conn().await?;
            redis::cmd("ZRANGEBYSCORE")
                .arg(self.chain_key(chain_id))
                .arg(i64::from(index))
                .arg(i64::from(index))
                .query_async(&mut conn)
                .await
                .map_err(|e| redis_err("ZRANGEBYSCORE", e))?
        };

        Ok(self.load_tasks(&ids).await?.into_iter().next())
    }

    async fn cleanup(&self, policy: &CleanupPolicy) -> Result<u64> {
        let ids = self.scan_task_ids().await?;
        let tasks = self.load_tasks(&ids).await?;

        let mut deleted = 0u64;
        for task in tasks.iter().filter(|t| policy.matches(t)) {
            if self.delete_task_entry(task).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn close(&self) -> Result<()> {
        self.pool.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_prefix(prefix: &str) -> RedisStore {
        // A pool handle is lazy: connections are only established on use,
        // so key construction is testable without a server.
        let pool = RedisConfig::from_url("redis://127.0.0.1:6379")
            .create_pool(Some(Runtime::Tokio1))
            .expect("pool config is valid");
        RedisStore {
            pool,
            prefix: prefix.to_string(),
        }
    }

    #[test]
    fn keys_are_prefixed_and_namespaced() {
        let store = store_with_prefix("cv:");
        let task_id = TaskId::generate();
        let chain_id = ChainId::generate();

        assert_eq!(store.task_key(&task_id), format!("cv:task:{task_id}"));
        assert_eq!(store.queue_key("emails"), "cv:queue:emails");
        assert_eq!(store.chain_key(&chain_id), format!("cv:chain:{chain_id}"));
        assert_eq!(store.unique_key("report-42"), "cv:unique:report-42");
        assert_eq!(store.rate_key("queue:emails"), "cv:rate:queue:emails");
    }

    #[test]
    fn task_blob_roundtrips() {
        let task = Task::new(
            TaskId::generate(),
            "emails",
            serde_json::json!({"n": 1}),
            crate::task::TaskOptions::default(),
            3,
        );

        let blob = RedisStore::encode(&task).unwrap();
        let decoded = RedisStore::decode(&blob).unwrap();
        assert_eq!(decoded.id, task.id);
        assert_eq!(decoded.created_at, task.created_at);
        assert_eq!(decoded.data, task.data);
    }

    #[test]
    fn increment_script_sets_reset_only_on_window_open() {
        // The script guards resetTime behind HSETNX and only arms the
        // expiry on the opening increment.
        assert!(INCREMENT_RATE_LIMIT_SCRIPT.contains("HSETNX"));
        assert!(INCREMENT_RATE_LIMIT_SCRIPT.contains("if count == 1"));
        assert!(INCREMENT_RATE_LIMIT_SCRIPT.contains("PEXPIRE"));
    }
}
