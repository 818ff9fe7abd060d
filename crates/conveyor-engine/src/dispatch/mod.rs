//! Dispatcher abstraction and the delivery wire contract.
//!
//! This module provides:
//!
//! - [`DeliveryPayload`]: The JSON body the dispatcher delivers to the
//!   callback URL
//! - [`DispatcherClient`]: Trait for registering tasks with the external
//!   managed dispatch service
//! - [`InMemoryDispatcher`]: In-memory client for testing
//!
//! ## Design Principles
//!
//! - **Backend agnostic**: Same interface for Cloud Tasks or a local double
//! - **Stable wire contract**: The payload shape is preserved
//!   bit-compatibly across implementations
//! - **Durable enqueue elsewhere**: The dispatcher owns durability and
//!   timed delivery; this library owns everything else

pub mod cloud_tasks;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use conveyor_core::{ChainId, TaskId};

use crate::error::Result;
use crate::task::Task;

/// Chain membership as carried on the wire.
///
/// Deliberately narrower than the persisted chain position: the wire
/// contract carries only `{id, index, total}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainRef {
    /// Chain identifier.
    pub id: ChainId,
    /// Zero-based position of this task.
    pub index: u32,
    /// Number of tasks in the chain.
    pub total: u32,
}

/// The JSON body delivered by the dispatcher to the callback URL.
///
/// This is the stable wire contract between dispatcher and consumer.
/// `chain` and `uniquenessKey` serialize as explicit `null` when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPayload {
    /// Task identifier.
    pub task_id: TaskId,
    /// Logical queue name.
    pub queue_name: String,
    /// Opaque caller payload.
    pub data: Value,
    /// Attempts consumed before this delivery.
    pub attempts: u32,
    /// Attempt cap.
    pub max_attempts: u32,
    /// Chain membership, or null.
    pub chain: Option<ChainRef>,
    /// Deduplication key, or null.
    pub uniqueness_key: Option<String>,
}

impl DeliveryPayload {
    /// Builds the payload for a task.
    #[must_use]
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            queue_name: task.queue_name.clone(),
            data: task.data.clone(),
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            chain: task.chain.map(|c| ChainRef {
                id: c.id,
                index: c.index,
                total: c.total,
            }),
            uniqueness_key: task.uniqueness_key.clone(),
        }
    }
}

/// Where a payload should be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTarget {
    /// Fully-qualified dispatcher queue path.
    pub queue_path: String,
    /// Callback URL for the HTTP delivery.
    pub url: String,
    /// OIDC subject for dispatcher-to-callback authentication.
    pub service_account_email: Option<String>,
}

/// Options for registering a task with the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Delay before the dispatcher delivers the payload.
    pub delay: Option<Duration>,
}

impl EnqueueOptions {
    /// Creates default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the delivery delay.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Client for the external managed dispatch service.
///
/// The dispatcher is responsible only for durable enqueue and timed HTTP
/// delivery; the engine owns all orchestration semantics. Implementations
/// may target Google Cloud Tasks or an in-memory double for tests.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent producers.
#[async_trait]
pub trait DispatcherClient: Send + Sync {
    /// Registers one HTTP task with the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns a `Backend`-kind error when the dispatcher rejects the
    /// task or cannot be reached. The producer treats this as
    /// recoverable: the task stays persisted locally.
    async fn enqueue_http(
        &self,
        target: &DeliveryTarget,
        payload: &DeliveryPayload,
        options: EnqueueOptions,
    ) -> Result<()>;

    /// Creates (or updates) a dispatcher-side queue.
    ///
    /// Called at engine build when `auto_create_queues` is enabled.
    async fn create_queue(
        &self,
        queue_path: &str,
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<()>;
}
