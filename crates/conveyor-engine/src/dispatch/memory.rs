//! In-memory dispatcher client for testing.
//!
//! This module provides [`InMemoryDispatcher`], a test double for the
//! [`DispatcherClient`] trait that records registrations instead of
//! calling an external service.
//!
//! ## Limitations
//!
//! - **No delivery**: Recorded payloads must be fed to the consumer by
//!   the test itself
//! - **No delay handling**: The delay option is recorded but not acted on

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use super::{DeliveryPayload, DeliveryTarget, DispatcherClient, EnqueueOptions};
use crate::error::{Error, Result};

/// A recorded dispatcher registration.
#[derive(Debug, Clone)]
pub struct RecordedEnqueue {
    /// Where the payload was addressed.
    pub target: DeliveryTarget,
    /// The payload itself.
    pub payload: DeliveryPayload,
    /// Options used when enqueuing.
    pub options: EnqueueOptions,
}

/// In-memory dispatcher client for testing.
///
/// Records every `enqueue_http` call; tests drain the recorded payloads
/// and feed them to the consumer to simulate deliveries. A failure toggle
/// lets tests exercise the producer's dispatcher-outage path.
#[derive(Debug, Default)]
pub struct InMemoryDispatcher {
    enqueued: RwLock<VecDeque<RecordedEnqueue>>,
    created_queues: RwLock<Vec<String>>,
    fail_enqueues: AtomicBool,
}

/// Converts a lock poison error to a dispatch error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::dispatch("dispatcher lock poisoned")
}

impl InMemoryDispatcher {
    /// Creates a new in-memory dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent `enqueue_http` calls fail with a dispatch error.
    pub fn set_fail_enqueues(&self, fail: bool) {
        self.fail_enqueues.store(fail, Ordering::SeqCst);
    }

    /// Takes the next recorded registration, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn take(&self) -> Result<Option<RecordedEnqueue>> {
        let mut enqueued = self.enqueued.write().map_err(poison_err)?;
        Ok(enqueued.pop_front())
    }

    /// Returns all recorded registrations, clearing the record.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn drain(&self) -> Result<Vec<RecordedEnqueue>> {
        let mut enqueued = self.enqueued.write().map_err(poison_err)?;
        Ok(enqueued.drain(..).collect())
    }

    /// Returns the number of recorded registrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn len(&self) -> Result<usize> {
        let enqueued = self.enqueued.read().map_err(poison_err)?;
        Ok(enqueued.len())
    }

    /// Returns true if nothing has been recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Returns the queue paths created through this client.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn created_queues(&self) -> Result<Vec<String>> {
        let created = self.created_queues.read().map_err(poison_err)?;
        Ok(created.clone())
    }
}

#[async_trait]
impl DispatcherClient for InMemoryDispatcher {
    async fn enqueue_http(
        &self,
        target: &DeliveryTarget,
        payload: &DeliveryPayload,
        options: EnqueueOptions,
    ) -> Result<()> {
        if self.fail_enqueues.load(Ordering::SeqCst) {
            return Err(Error::dispatch("simulated dispatcher outage"));
        }

        let mut enqueued = self.enqueued.write().map_err(poison_err)?;
        enqueued.push_back(RecordedEnqueue {
            target: target.clone(),
            payload: payload.clone(),
            options,
        });
        Ok(())
    }

    async fn create_queue(
        &self,
        queue_path: &str,
        _max_retries: u32,
        _retry_delay: Duration,
    ) -> Result<()> {
        let mut created = self.created_queues.write().map_err(poison_err)?;
        created.push(queue_path.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskOptions};
    use conveyor_core::TaskId;

    fn make_target() -> DeliveryTarget {
        DeliveryTarget {
            queue_path: "projects/p/locations/l/queues/emails".into(),
            url: "https://worker.example.com/deliver".into(),
            service_account_email: None,
        }
    }

    fn make_payload() -> DeliveryPayload {
        let task = Task::new(
            TaskId::generate(),
            "emails",
            serde_json::json!({}),
            TaskOptions::default(),
            3,
        );
        DeliveryPayload::from_task(&task)
    }

    #[tokio::test]
    async fn records_enqueues_in_order() -> Result<()> {
        let dispatcher = InMemoryDispatcher::new();
        let target = make_target();

        let first = make_payload();
        let second = make_payload();
        dispatcher
            .enqueue_http(&target, &first, EnqueueOptions::new())
            .await?;
        dispatcher
            .enqueue_http(&target, &second, EnqueueOptions::new())
            .await?;

        assert_eq!(dispatcher.len()?, 2);
        let taken = dispatcher.take()?.expect("should have entry");
        assert_eq!(taken.payload.task_id, first.task_id);

        let drained = dispatcher.drain()?;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload.task_id, second.task_id);
        assert!(dispatcher.is_empty()?);

        Ok(())
    }

    #[tokio::test]
    async fn failure_toggle() -> Result<()> {
        let dispatcher = InMemoryDispatcher::new();
        dispatcher.set_fail_enqueues(true);

        let result = dispatcher
            .enqueue_http(&make_target(), &make_payload(), EnqueueOptions::new())
            .await;
        assert!(matches!(result, Err(Error::Dispatch { .. })));
        assert!(dispatcher.is_empty()?);

        dispatcher.set_fail_enqueues(false);
        dispatcher
            .enqueue_http(&make_target(), &make_payload(), EnqueueOptions::new())
            .await?;
        assert_eq!(dispatcher.len()?, 1);

        Ok(())
    }

    #[tokio::test]
    async fn records_created_queues() -> Result<()> {
        let dispatcher = InMemoryDispatcher::new();
        dispatcher
            .create_queue(
                "projects/p/locations/l/queues/emails",
                5,
                Duration::from_secs(10),
            )
            .await?;

        assert_eq!(
            dispatcher.created_queues()?,
            vec!["projects/p/locations/l/queues/emails".to_string()]
        );

        Ok(())
    }
}
