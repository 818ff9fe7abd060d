//! Observability infrastructure for Conveyor.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors so every component logs
//! with the same field names.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `conveyor_engine=debug`)
///
/// # Example
///
/// ```rust
/// use conveyor_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for producer operations with standard fields.
///
/// # Example
///
/// ```rust
/// use conveyor_core::observability::queue_span;
///
/// let span = queue_span("add_task", "email-queue");
/// let _guard = span.enter();
/// // ... enqueue the task
/// ```
#[must_use]
pub fn queue_span(operation: &str, queue: &str) -> Span {
    tracing::info_span!("queue", op = operation, queue = queue)
}

/// Creates a span for delivery processing.
///
/// # Example
///
/// ```rust
/// use conveyor_core::observability::delivery_span;
///
/// let span = delivery_span("process_delivery", "01H...", "email-queue");
/// let _guard = span.enter();
/// // ... run the handler
/// ```
#[must_use]
pub fn delivery_span(operation: &str, task_id: &str, queue: &str) -> Span {
    tracing::info_span!(
        "delivery",
        op = operation,
        task_id = task_id,
        queue = queue,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        // Should not panic (uses Once internally)
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty); // Second call should be no-op
    }

    #[test]
    fn queue_span_creates_span() {
        let span = queue_span("add_task", "email-queue");
        let _guard = span.enter();
        tracing::info!("test message in span");
    }

    #[test]
    fn delivery_span_creates_span() {
        let span = delivery_span("process_delivery", "task-1", "email-queue");
        let _guard = span.enter();
        tracing::info!("delivery message");
    }
}
