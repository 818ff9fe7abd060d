//! # conveyor-core
//!
//! Core primitives for the Conveyor distributed task-queue library.
//!
//! This crate provides the foundational types shared across all Conveyor
//! components:
//!
//! - **Identifiers**: Strongly-typed IDs for tasks and chains
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span constructors
//!
//! ## Crate Boundary
//!
//! `conveyor-core` is the only crate allowed to define shared primitives.
//! The engine crate and any application code build on the types defined
//! here.
//!
//! ## Example
//!
//! ```rust
//! use conveyor_core::prelude::*;
//!
//! let task_id = TaskId::generate();
//! let chain_id = ChainId::generate();
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use conveyor_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{ChainId, TaskId};
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{ChainId, TaskId};
pub use observability::{init_logging, LogFormat};
