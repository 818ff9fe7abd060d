//! # conveyor-engine
//!
//! Orchestration engine for the Conveyor distributed task-queue library.
//!
//! Conveyor layers higher-level semantics over an external managed
//! dispatch service (Google Cloud Tasks in production): the dispatcher
//! owns durable enqueue and timed HTTP delivery, and this crate owns
//! everything else:
//!
//! - **Producer**: validation, deduplication, rate limiting, persistence,
//!   dispatcher registration (`add_task`, `add_chain`)
//! - **Consumer**: delivery processing with atomic state transitions,
//!   retry accounting, and lifecycle events (`process_delivery`)
//! - **Storage adapters**: one consistent contract across in-memory,
//!   Redis (feature `redis`), and MongoDB (feature `mongo`) backends
//! - **Rate limiter & uniqueness**: fixed-window counters and
//!   cross-process deduplication locks built on the adapter contract
//!
//! ## Guarantees
//!
//! - **At-least-once**: deliveries may repeat; uniqueness keys and
//!   handler idempotency bound the damage, exactly-once is a non-goal
//! - **Attempt accounting**: a task never records more attempts than its
//!   cap, and a failed task always has `attempts == max_attempts`
//! - **Single mutator**: all persistent state flows through the storage
//!   adapter
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use conveyor_engine::config::{EngineConfig, QueueConfig};
//! use conveyor_engine::engine::Engine;
//! use conveyor_engine::registry::{FnHandler, HandlerContext, ProcessorEntry};
//! use conveyor_engine::task::TaskOptions;
//!
//! # async fn run() -> conveyor_engine::error::Result<()> {
//! let config = EngineConfig::new("my-project", "us-central1").with_queue(
//!     QueueConfig::new("emails").with_processor_url("https://worker.example.com/deliver"),
//! );
//!
//! let engine = Engine::builder(config)
//!     .register(ProcessorEntry::new("emails").with_handler(Arc::new(FnHandler::new(
//!         |ctx: HandlerContext| async move { Ok(serde_json::json!({"sent": ctx.task().id})) },
//!     ))))?
//!     .build()
//!     .await?;
//!
//! let outcome = engine
//!     .add_task("emails", serde_json::json!({"to": "user@example.com"}), TaskOptions::default())
//!     .await?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod producer;
pub mod rate_limit;
pub mod registry;
pub mod store;
pub mod task;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{EngineConfig, QueueConfig, RateLimitConfig, StorageConfig};
    pub use crate::consumer::Consumer;
    pub use crate::dispatch::{DeliveryPayload, DispatcherClient};
    pub use crate::engine::{Engine, EngineBuilder};
    pub use crate::error::{Error, ErrorKind, Result};
    pub use crate::events::{EngineEvent, EventBus, EventKind, Subscription};
    pub use crate::producer::{AddTaskOutcome, ChainEntry, ChainOptions, ChainOutcome, Producer};
    pub use crate::rate_limit::{RateLimitDecision, RateLimitKey, RateLimiter};
    pub use crate::registry::{
        FnHandler, HandlerContext, HandlerRegistry, LifecycleHooks, ProcessorEntry, TaskHandler,
    };
    pub use crate::store::{CleanupPolicy, StorageAdapter, TaskFilter, TaskPatch};
    pub use crate::task::{Task, TaskOptions, TaskProgress, TaskStatus};
    pub use conveyor_core::{ChainId, TaskId};
}
