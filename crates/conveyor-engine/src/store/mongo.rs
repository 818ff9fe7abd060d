//! MongoDB document storage adapter.
//!
//! Layout: one collection per entity kind.
//!
//! - `tasks` — task documents keyed by `_id` (the task ID), indexed on
//!   `(queueName, status)` and `(chain.id, chain.index)`; timestamps are
//!   stored as millisecond integers, matching the task's JSON form
//! - `uniqueness` — `{_id: key, taskId, expiresAt}` with a TTL index on
//!   `expiresAt`; acquisition is an insert against the unique `_id`, so
//!   the test-and-set is atomic
//! - `ratelimit` — `{_id: key, count, resetTime}` with a TTL index on
//!   `resetTime`; the increment is `find_one_and_update` with `$inc` +
//!   `$setOnInsert`, preceded by a bulk reset of windows whose
//!   `resetTime` has passed, so a live window's `resetTime` is never
//!   rewritten

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{
    FindOneAndUpdateOptions, FindOptions, IndexOptions, ReplaceOptions, ReturnDocument,
};
use mongodb::{Client, Collection, IndexModel};

use conveyor_core::{ChainId, TaskId};

use super::{
    CleanupPolicy, RateLimitIncrement, RateLimitWindow, SortDirection, SortField, StorageAdapter,
    TaskFilter, TaskPatch,
};
use crate::error::{Error, Result};
use crate::task::{now_millis, Task, TaskStatus};

const TASKS: &str = "tasks";
const UNIQUENESS: &str = "uniqueness";
const RATELIMIT: &str = "ratelimit";

/// MongoDB-backed storage adapter.
pub struct MongoStore {
    tasks: Collection<Document>,
    uniqueness: Collection<Document>,
    ratelimit: Collection<Document>,
}

impl std::fmt::Debug for MongoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoStore").finish_non_exhaustive()
    }
}

fn mongo_err(context: &str, err: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::storage_with_source(format!("mongodb {context} failed"), err)
}

fn status_bson(status: TaskStatus) -> Bson {
    bson::to_bson(&status).unwrap_or_else(|_| Bson::String(status.to_string()))
}

impl MongoStore {
    /// Connects to MongoDB, ensures indexes, and builds the adapter.
    ///
    /// # Errors
    ///
    /// Returns a `Backend`-kind error when the connection or index
    /// creation fails.
    pub async fn connect(uri: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| mongo_err("connect", e))?;
        let db = client.database(database);

        let store = Self {
            tasks: db.collection(TASKS),
            uniqueness: db.collection(UNIQUENESS),
            ratelimit: db.collection(RATELIMIT),
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> Result<()> {
        let ttl = IndexOptions::builder()
            .expire_after(Duration::from_secs(0))
            .build();

        self.tasks
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "queueName": 1, "status": 1 })
                    .build(),
                None,
            )
            .await
            .map_err(|e| mongo_err("index creation", e))?;
        self.tasks
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "chain.id": 1, "chain.index": 1 })
                    .build(),
                None,
            )
            .await
            .map_err(|e| mongo_err("index creation", e))?;
        self.uniqueness
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "expiresAt": 1 })
                    .options(ttl.clone())
                    .build(),
                None,
            )
            .await
            .map_err(|e| mongo_err("index creation", e))?;
        self.ratelimit
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "resetTime": 1 })
                    .options(ttl)
                    .build(),
                None,
            )
            .await
            .map_err(|e| mongo_err("index creation", e))?;

        Ok(())
    }

    fn encode(task: &Task) -> Result<Document> {
        let mut document =
            bson::to_document(task).map_err(|e| Error::serialization(e.to_string()))?;
        document.insert("_id", task.id.to_string());
        Ok(document)
    }

    fn decode(mut document: Document) -> Result<Task> {
        document.remove("_id");
        bson::from_document(document).map_err(|e| Error::serialization(e.to_string()))
    }

    /// Builds the query document for a task filter (limit/offset/sort are
    /// handled by find options).
    fn filter_query(filter: &TaskFilter) -> Document {
        let mut query = Document::new();

        if !filter.statuses.is_empty() {
            let statuses: Vec<Bson> = filter.statuses.iter().map(|s| status_bson(*s)).collect();
            query.insert("status", doc! { "$in": statuses });
        }
        if let Some(queue_name) = &filter.queue_name {
            query.insert("queueName", queue_name.clone());
        }
        if let Some(chain_id) = filter.chain_id {
            query.insert("chain.id", chain_id.to_string());
        }
        if let Some(key) = &filter.uniqueness_key {
            query.insert("uniquenessKey", key.clone());
        }

        let mut created = Document::new();
        if let Some(after) = filter.created_after {
            created.insert("$gte", after.timestamp_millis());
        }
        if let Some(before) = filter.created_before {
            created.insert("$lte", before.timestamp_millis());
        }
        if !created.is_empty() {
            query.insert("createdAt", created);
        }

        query
    }

    fn find_options(filter: &TaskFilter) -> FindOptions {
        let sort = filter.sort.map(|sort| {
            let field = match sort.field {
                SortField::CreatedAt => "createdAt",
                SortField::UpdatedAt => "updatedAt",
            };
            let direction = match sort.direction {
                SortDirection::Ascending => 1,
                SortDirection::Descending => -1,
            };
            // _id tiebreak keeps the ordering stable.
            doc! { field: direction, "_id": direction }
        });

        FindOptions::builder()
            .sort(sort)
            .skip(u64::try_from(filter.offset).ok().filter(|o| *o > 0))
            .limit(filter.limit.and_then(|l| i64::try_from(l).ok()))
            .build()
    }

    async fn find_tasks(&self, query: Document, options: FindOptions) -> Result<Vec<Task>> {
        let cursor = self
            .tasks
            .find(query, options)
            .await
            .map_err(|e| mongo_err("find", e))?;
        let documents: Vec<Document> = cursor
            .try_collect()
            .await
            .map_err(|e| mongo_err("cursor", e))?;

        documents.into_iter().map(Self::decode).collect()
    }

    /// Builds the `$set` document for a status update.
    fn patch_document(status: TaskStatus, patch: &TaskPatch, now: DateTime<Utc>) -> Result<Document> {
        let mut set = doc! {
            "status": status_bson(status),
            "updatedAt": now.timestamp_millis(),
        };

        if let Some(attempts) = patch.attempts {
            set.insert("attempts", i64::from(attempts));
        }
        if let Some(result) = &patch.result {
            let value = bson::to_bson(result).map_err(|e| Error::serialization(e.to_string()))?;
            set.insert("result", value);
        }
        if let Some(error) = &patch.error {
            let value = bson::to_bson(error).map_err(|e| Error::serialization(e.to_string()))?;
            set.insert("error", value);
        }
        if let Some(progress) = &patch.progress {
            let value =
                bson::to_bson(progress).map_err(|e| Error::serialization(e.to_string()))?;
            set.insert("progress", value);
        }
        if let Some(active_at) = patch.active_at {
            set.insert("activeAt", active_at.timestamp_millis());
        }
        if let Some(completed_at) = patch.completed_at {
            set.insert("completedAt", completed_at.timestamp_millis());
        }
        if let Some(failed_at) = patch.failed_at {
            set.insert("failedAt", failed_at.timestamp_millis());
        }

        Ok(set)
    }
}

#[async_trait]
impl StorageAdapter for MongoStore {
    async fn save_task(&self, task: &Task) -> Result<()> {
        let document = Self::encode(task)?;
        self.tasks
            .replace_one(
                doc! { "_id": task.id.to_string() },
                document,
                ReplaceOptions::builder().upsert(true).build(),
            )
            .await
            .map_err(|e| mongo_err("replace_one", e))?;
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        let document = self
            .tasks
            .find_one(doc! { "_id": task_id.to_string() }, None)
            .await
            .map_err(|e| mongo_err("find_one", e))?;

        document.map(Self::decode).transpose()
    }

    async fn update_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        patch: TaskPatch,
    ) -> Result<Task> {
        let set = Self::patch_document(status, &patch, now_millis())?;

        let updated = self
            .tasks
            .find_one_and_update(
                doc! { "_id": task_id.to_string() },
                doc! { "$set": set },
                FindOneAndUpdateOptions::builder()
                    .return_document(ReturnDocument::After)
                    .build(),
            )
            .await
            .map_err(|e| mongo_err("find_one_and_update", e))?
            .ok_or(Error::TaskNotFound { task_id: *task_id })?;

        Self::decode(updated)
    }

    async fn delete_task(&self, task_id: &TaskId) -> Result<bool> {
        let outcome = self
            .tasks
            .delete_one(doc! { "_id": task_id.to_string() }, None)
            .await
            .map_err(|e| mongo_err("delete_one", e))?;
        Ok(outcome.deleted_count > 0)
    }

    async fn query_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.find_tasks(Self::filter_query(filter), Self::find_options(filter))
            .await
    }

    async fn count_tasks(&self, filter: &TaskFilter) -> Result<u64> {
        self.tasks
            .count_documents(Self::filter_query(filter), None)
            .await
            .map_err(|e| mongo_err("count_documents", e))
    }

    async fn is_uniqueness_key_active(&self, key: &str) -> Result<bool> {
        let now = bson::DateTime::from_chrono(Utc::now());
        let document = self
            .uniqueness
            .find_one(doc! { "_id": key, "expiresAt": { "$gt": now } }, None)
            .await
            .map_err(|e| mongo_err("find_one", e))?;
        Ok(document.is_some())
    }

    async fn set_uniqueness_key_active(
        &self,
        key: &str,
        task_id: &TaskId,
        ttl: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| Error::invalid_argument(format!("uniqueness ttl out of range: {e}")))?;

        // Drop an expired lock first; the TTL monitor only sweeps
        // periodically.
        self.uniqueness
            .delete_one(
                doc! { "_id": key, "expiresAt": { "$lte": bson::DateTime::from_chrono(now) } },
                None,
            )
            .await
            .map_err(|e| mongo_err("delete_one", e))?;

        // Insert against the unique _id is the atomic test-and-set.
        let outcome = self
            .uniqueness
            .insert_one(
                doc! {
                    "_id": key,
                    "taskId": task_id.to_string(),
                    "expiresAt": bson::DateTime::from_chrono(expires_at),
                },
                None,
            )
            .await;

        match outcome {
            Ok(_) => Ok(true),
            Err(err) => match err.kind.as_ref() {
                ErrorKind::Write(WriteFailure::WriteError(write_error))
                    if write_error.code == 11000 =>
                {
                    Ok(false)
                }
                _ => Err(mongo_err("insert_one", err)),
            },
        }
    }

    async fn remove_uniqueness_key(&self, key: &str) -> Result<()> {
        self.uniqueness
            .delete_one(doc! { "_id": key }, None)
            .await
            .map_err(|e| mongo_err("delete_one", e))?;
        Ok(())
    }

    async fn increment_rate_limit(
        &self,
        key: &str,
        window: Duration,
        max_requests: u32,
    ) -> Result<RateLimitIncrement> {
        let now = Utc::now();
        let window_len = chrono::Duration::from_std(window)
            .map_err(|e| Error::invalid_argument(format!("rate window out of range: {e}")))?;

        // Bulk-reset expired windows before incrementing.
        self.ratelimit
            .delete_many(
                doc! { "resetTime": { "$lte": bson::DateTime::from_chrono(now) } },
                None,
            )
            .await
            .map_err(|e| mongo_err("delete_many", e))?;

        let updated = self
            .ratelimit
            .find_one_and_update(
                doc! { "_id": key },
                doc! {
                    "$inc": { "count": 1_i64 },
                    "$setOnInsert": {
                        "resetTime": bson::DateTime::from_chrono(now + window_len),
                    },
                },
                FindOneAndUpdateOptions::builder()
                    .upsert(true)
                    .return_document(ReturnDocument::After)
                    .build(),
            )
            .await
            .map_err(|e| mongo_err("find_one_and_update", e))?
            .ok_or_else(|| Error::storage("rate-limit upsert returned no document"))?;

        let count = updated.get_i64("count").unwrap_or(0).max(0) as u64;
        let reset_time = updated
            .get_datetime("resetTime")
            .map(|dt| dt.to_chrono())
            .unwrap_or(now);

        Ok(RateLimitIncrement {
            allowed: count <= u64::from(max_requests),
            count,
            reset_time,
        })
    }

    async fn get_rate_limit(&self, key: &str) -> Result<Option<RateLimitWindow>> {
        let now = bson::DateTime::from_chrono(Utc::now());
        let document = self
            .ratelimit
            .find_one(doc! { "_id": key, "resetTime": { "$gt": now } }, None)
            .await
            .map_err(|e| mongo_err("find_one", e))?;

        Ok(document.map(|d| RateLimitWindow {
            count: d.get_i64("count").unwrap_or(0).max(0) as u64,
            reset_time: d
                .get_datetime("resetTime")
                .map(|dt| dt.to_chrono())
                .unwrap_or_else(|_| Utc::now()),
        }))
    }

    async fn delete_rate_limit(&self, key: &str) -> Result<()> {
        self.ratelimit
            .delete_one(doc! { "_id": key }, None)
            .await
            .map_err(|e| mongo_err("delete_one", e))?;
        Ok(())
    }

    async fn has_active_task_in_chain(&self, chain_id: &ChainId) -> Result<bool> {
        let live = [TaskStatus::Idle, TaskStatus::Active]
            .iter()
            .map(|s| status_bson(*s))
            .collect::<Vec<_>>();
        let count = self
            .tasks
            .count_documents(
                doc! { "chain.id": chain_id.to_string(), "status": { "$in": live } },
                None,
            )
            .await
            .map_err(|e| mongo_err("count_documents", e))?;
        Ok(count > 0)
    }

    async fn get_chain_tasks(&self, chain_id: &ChainId) -> Result<Vec<Task>> {
        self.find_tasks(
            doc! { "chain.id": chain_id.to_string() },
            FindOptions::builder().sort(doc! { "chain.index": 1 }).build(),
        )
        .await
    }

    async fn get_next_task_in_chain(
        &self,
        chain_id: &ChainId,
        index: u32,
    ) -> Result<Option<Task>> {
        let document = self
            .tasks
            .find_one(
                doc! { "chain.id": chain_id.to_string(), "chain.index": i64::from(index) },
                None,
            )
            .await
            .map_err(|e| mongo_err("find_one", e))?;

        document.map(Self::decode).transpose()
    }

    async fn cleanup(&self, policy: &CleanupPolicy) -> Result<u64> {
        let mut clauses: Vec<Document> = Vec::new();
        if !policy.statuses.is_empty() {
            let statuses: Vec<Bson> = policy.statuses.iter().map(|s| status_bson(*s)).collect();
            clauses.push(doc! { "status": { "$in": statuses } });
        }
        if policy.remove_completed {
            clauses.push(doc! { "status": status_bson(TaskStatus::Completed) });
        }
        if policy.remove_failed {
            clauses.push(doc! { "status": status_bson(TaskStatus::Failed) });
        }

        let mut query = Document::new();
        if let Some(gate) = policy.older_than {
            query.insert("createdAt", doc! { "$lt": gate.timestamp_millis() });
        } else if clauses.is_empty() {
            // Nothing enabled: delete nothing.
            return Ok(0);
        }
        if !clauses.is_empty() {
            query.insert("$or", clauses);
        }

        let outcome = self
            .tasks
            .delete_many(query, None)
            .await
            .map_err(|e| mongo_err("delete_many", e))?;
        Ok(outcome.deleted_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TaskSort;
    use crate::task::TaskOptions;

    fn make_task() -> Task {
        Task::new(
            TaskId::generate(),
            "emails",
            serde_json::json!({"n": 1}),
            TaskOptions::default(),
            3,
        )
    }

    #[test]
    fn task_document_roundtrips() {
        let task = make_task();
        let document = MongoStore::encode(&task).unwrap();

        assert_eq!(
            document.get_str("_id").unwrap(),
            task.id.to_string().as_str()
        );
        assert_eq!(document.get_str("queueName").unwrap(), "emails");

        let decoded = MongoStore::decode(document).unwrap();
        assert_eq!(decoded.id, task.id);
        assert_eq!(decoded.created_at, task.created_at);
    }

    #[test]
    fn filter_query_builds_clauses() {
        let chain_id = ChainId::generate();
        let filter = TaskFilter {
            statuses: vec![TaskStatus::Idle, TaskStatus::Active],
            queue_name: Some("emails".into()),
            chain_id: Some(chain_id),
            ..TaskFilter::default()
        };

        let query = MongoStore::filter_query(&filter);
        assert!(query.get_document("status").unwrap().contains_key("$in"));
        assert_eq!(query.get_str("queueName").unwrap(), "emails");
        assert_eq!(
            query.get_str("chain.id").unwrap(),
            chain_id.to_string().as_str()
        );
    }

    #[test]
    fn filter_query_date_range() {
        let now = now_millis();
        let filter = TaskFilter {
            created_after: Some(now - chrono::Duration::seconds(60)),
            created_before: Some(now),
            ..TaskFilter::default()
        };

        let query = MongoStore::filter_query(&filter);
        let created = query.get_document("createdAt").unwrap();
        assert!(created.contains_key("$gte"));
        assert!(created.contains_key("$lte"));
    }

    #[test]
    fn find_options_map_sort_and_pagination() {
        let filter = TaskFilter {
            sort: Some(TaskSort {
                field: SortField::CreatedAt,
                direction: SortDirection::Descending,
            }),
            limit: Some(10),
            offset: 5,
            ..TaskFilter::default()
        };

        let options = MongoStore::find_options(&filter);
        assert_eq!(options.limit, Some(10));
        assert_eq!(options.skip, Some(5));
        let sort = options.sort.unwrap();
        assert_eq!(sort.get_i32("createdAt").unwrap(), -1);
    }

    #[test]
    fn patch_document_includes_only_populated_fields() {
        let now = now_millis();
        let patch = TaskPatch {
            attempts: Some(2),
            completed_at: Some(now),
            ..TaskPatch::default()
        };

        let set = MongoStore::patch_document(TaskStatus::Completed, &patch, now).unwrap();
        assert_eq!(set.get_i64("attempts").unwrap(), 2);
        assert!(set.contains_key("completedAt"));
        assert!(set.contains_key("updatedAt"));
        assert!(!set.contains_key("error"));
        assert!(!set.contains_key("progress"));
    }
}
