//! End-to-end lifecycle scenarios driven through the public engine API,
//! with the in-memory dispatcher standing in for the managed service.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conveyor_engine::config::{EngineConfig, QueueConfig, RateLimitConfig};
use conveyor_engine::dispatch::memory::InMemoryDispatcher;
use conveyor_engine::engine::Engine;
use conveyor_engine::error::{Error, Result};
use conveyor_engine::events::{EngineEvent, EventKind};
use conveyor_engine::producer::{ChainEntry, ChainOptions};
use conveyor_engine::registry::{FnHandler, HandlerContext, ProcessorEntry, TaskHandler};
use conveyor_engine::store::TaskFilter;
use conveyor_engine::task::{TaskOptions, TaskStatus};

fn echo_handler() -> Arc<dyn TaskHandler> {
    Arc::new(FnHandler::new(|ctx: HandlerContext| async move {
        Ok(serde_json::json!({ "echo": ctx.task().data.clone() }))
    }))
}

fn failing_handler() -> Arc<dyn TaskHandler> {
    Arc::new(FnHandler::new(|_ctx: HandlerContext| async move {
        Err::<serde_json::Value, Box<dyn std::error::Error + Send + Sync>>(
            "smtp unreachable".into(),
        )
    }))
}

async fn build_engine(
    queue: QueueConfig,
    handler: Arc<dyn TaskHandler>,
) -> Result<(Engine, Arc<InMemoryDispatcher>)> {
    let dispatcher = Arc::new(InMemoryDispatcher::new());
    let engine = Engine::builder(EngineConfig::new("p", "l").with_queue(queue))
        .register(ProcessorEntry::new("emails").with_handler(handler))?
        .with_dispatcher(Arc::<InMemoryDispatcher>::clone(&dispatcher))
        .build()
        .await?;
    Ok((engine, dispatcher))
}

fn email_queue() -> QueueConfig {
    QueueConfig::new("emails").with_processor_url("https://worker.example.com/deliver")
}

#[tokio::test]
async fn single_success() -> Result<()> {
    let (engine, dispatcher) = build_engine(email_queue(), echo_handler()).await?;

    let completed_events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&completed_events);
    let _sub = engine.subscribe(EventKind::TaskCompleted, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let outcome = engine
        .add_task(
            "emails",
            serde_json::json!({"msg": "hi"}),
            TaskOptions {
                max_attempts: Some(3),
                ..TaskOptions::default()
            },
        )
        .await?;
    assert!(outcome.success);
    let task_id = outcome.task_id.unwrap();

    let delivery = dispatcher.take()?.expect("one registration recorded");
    let result = engine.process_delivery(&delivery.payload).await?;
    assert_eq!(result["echo"], serde_json::json!({"msg": "hi"}));

    let task = engine.get_task(&task_id).await?.expect("task persisted");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 1);
    assert!(task.result.is_some());
    assert!(task.completed_at.unwrap() >= task.created_at);
    assert_eq!(completed_events.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn retry_then_fail() -> Result<()> {
    let (engine, dispatcher) = build_engine(email_queue(), failing_handler()).await?;

    let failed_events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&failed_events);
    let _sub = engine.subscribe(EventKind::TaskFailed, move |event| {
        if let EngineEvent::TaskFailed {
            is_final_attempt,
            attempts,
            max_attempts,
            ..
        } = event
        {
            assert!(*is_final_attempt);
            assert_eq!(*attempts, 3);
            assert_eq!(*max_attempts, 3);
        }
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let outcome = engine
        .add_task(
            "emails",
            serde_json::json!({}),
            TaskOptions {
                max_attempts: Some(3),
                ..TaskOptions::default()
            },
        )
        .await?;
    let task_id = outcome.task_id.unwrap();
    let delivery = dispatcher.take()?.expect("registered");

    // First and second deliveries: back to idle, no failure event.
    for expected_attempts in 1..=2u32 {
        let result = engine.process_delivery(&delivery.payload).await;
        assert!(matches!(result, Err(Error::Handler { .. })));

        let task = engine.get_task(&task_id).await?.unwrap();
        assert_eq!(task.status, TaskStatus::Idle);
        assert_eq!(task.attempts, expected_attempts);
        assert!(task.error.is_none());
        assert_eq!(failed_events.load(Ordering::SeqCst), 0);
    }

    // Third delivery exhausts attempts.
    let result = engine.process_delivery(&delivery.payload).await;
    assert!(result.is_err());

    let task = engine.get_task(&task_id).await?.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.attempts, 3);
    assert!(task.error.is_some());
    assert_eq!(failed_events.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn uniqueness_key_lifecycle() -> Result<()> {
    let (engine, dispatcher) = build_engine(email_queue(), echo_handler()).await?;

    let options = |remove_on_complete| TaskOptions {
        uniqueness_key: Some("report-42".into()),
        remove_on_complete,
        ..TaskOptions::default()
    };

    let first = engine
        .add_task("emails", serde_json::json!({}), options(true))
        .await?;
    assert!(first.success);
    let task_a = first.task_id.unwrap();

    // Same key again: skipped, pointing at the live holder.
    let second = engine
        .add_task("emails", serde_json::json!({}), options(true))
        .await?;
    assert!(!second.success);
    assert!(second.skipped);
    assert_eq!(second.task_id, Some(task_a));

    // Complete A; removal policy drops the task and its lock.
    let delivery = dispatcher.take()?.expect("registered");
    engine.process_delivery(&delivery.payload).await?;
    assert!(engine.get_task(&task_a).await?.is_none());

    // The key is free again.
    let third = engine
        .add_task("emails", serde_json::json!({}), options(false))
        .await?;
    assert!(third.success);
    let task_b = third.task_id.unwrap();
    assert_ne!(task_b, task_a);

    Ok(())
}

#[tokio::test]
async fn queue_rate_limit_window() -> Result<()> {
    let window = Duration::from_millis(150);
    let queue = email_queue().with_rate_limiter(RateLimitConfig::new(3, window));
    let (engine, _dispatcher) = build_engine(queue, echo_handler()).await?;

    let mut outcomes = Vec::new();
    for n in 0..5 {
        outcomes.push(
            engine
                .add_task("emails", serde_json::json!({ "n": n }), TaskOptions::default())
                .await?,
        );
    }

    assert!(outcomes[..3].iter().all(|o| o.success));
    for denied in &outcomes[3..] {
        assert!(!denied.success);
        assert!(denied.error.as_deref().unwrap().contains("rate limit"));
    }

    // After the window elapses a fresh one opens.
    tokio::time::sleep(window + Duration::from_millis(50)).await;

    let sixth = engine
        .add_task("emails", serde_json::json!({ "n": 5 }), TaskOptions::default())
        .await?;
    assert!(sixth.success);

    let status = engine
        .rate_limit_status("emails")
        .await?
        .expect("window is live");
    assert_eq!(status.count, 1);

    Ok(())
}

#[tokio::test]
async fn chain_completes_in_order() -> Result<()> {
    let (engine, dispatcher) = build_engine(email_queue(), echo_handler()).await?;

    let outcome = engine
        .add_chain(
            "emails",
            (0..3)
                .map(|step| ChainEntry::new(serde_json::json!({ "step": step })))
                .collect(),
            ChainOptions::default(),
        )
        .await?;

    assert_eq!(outcome.results.len(), 3);
    assert!(outcome.results.iter().all(|r| r.success));

    // All three steps share the chain and cover indices 0..3.
    let members = engine
        .query_tasks(&TaskFilter::new().with_chain(outcome.chain_id))
        .await?;
    let mut indices: Vec<u32> = members
        .iter()
        .map(|t| t.chain.unwrap().index)
        .collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2]);
    assert!(members
        .iter()
        .all(|t| t.chain.unwrap().id == outcome.chain_id && t.chain.unwrap().total == 3));

    for delivery in dispatcher.drain()? {
        engine.process_delivery(&delivery.payload).await?;
    }

    let completed = engine
        .count_tasks(
            &TaskFilter::new()
                .with_chain(outcome.chain_id)
                .with_status(TaskStatus::Completed),
        )
        .await?;
    assert_eq!(completed, 3);

    Ok(())
}

#[tokio::test]
async fn concurrency_guard_rejects_overlapping_deliveries() -> Result<()> {
    // A handler that stalls until released so the first delivery is
    // still in flight when the duplicate arrives.
    let (release_tx, release_rx) = tokio::sync::watch::channel(false);
    let slow: Arc<dyn TaskHandler> = Arc::new(FnHandler::new(move |_ctx: HandlerContext| {
        let mut release = release_rx.clone();
        async move {
            while !*release.borrow_and_update() {
                if release.changed().await.is_err() {
                    break;
                }
            }
            Ok(serde_json::json!({"done": true}))
        }
    }));

    let (engine, dispatcher) = build_engine(email_queue(), slow).await?;
    let engine = Arc::new(engine);

    let outcome = engine
        .add_task("emails", serde_json::json!({}), TaskOptions::default())
        .await?;
    let task_id = outcome.task_id.unwrap();
    let delivery = dispatcher.take()?.expect("registered");

    let racing = {
        let engine = Arc::clone(&engine);
        let payload = delivery.payload.clone();
        tokio::spawn(async move { engine.process_delivery(&payload).await })
    };

    // Wait until the first delivery holds the guard.
    while engine.in_flight() == 0 {
        tokio::task::yield_now().await;
    }

    let duplicate = engine.process_delivery(&delivery.payload).await;
    assert!(matches!(duplicate, Err(Error::Conflict { .. })));

    release_tx.send(true).ok();
    let first = racing.await.expect("join");
    assert!(first.is_ok());

    // Stored state reflects the completing delivery only.
    let task = engine.get_task(&task_id).await?.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.attempts, 1);

    engine.close().await?;

    Ok(())
}

#[tokio::test]
async fn progress_events_reach_subscribers() -> Result<()> {
    let reporting: Arc<dyn TaskHandler> = Arc::new(FnHandler::new(|ctx: HandlerContext| async move {
        ctx.update_progress(conveyor_engine::task::TaskProgress::new(25.0))
            .await
            .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.to_string().into() })?;
        ctx.update_progress(conveyor_engine::task::TaskProgress::new(75.0))
            .await
            .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.to_string().into() })?;
        Ok(serde_json::json!({}))
    }));

    let (engine, dispatcher) = build_engine(email_queue(), reporting).await?;

    let percentages = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&percentages);
    let _sub = engine.subscribe(EventKind::TaskProgress, move |event| {
        if let EngineEvent::TaskProgress { progress, .. } = event {
            sink.lock().unwrap().push(progress.percentage);
        }
    });

    engine
        .add_task("emails", serde_json::json!({}), TaskOptions::default())
        .await?;
    let delivery = dispatcher.take()?.expect("registered");
    engine.process_delivery(&delivery.payload).await?;

    assert_eq!(*percentages.lock().unwrap(), vec![25.0, 75.0]);

    Ok(())
}

#[tokio::test]
async fn chain_advancement_events_are_emitted_for_non_terminal_steps() -> Result<()> {
    let (engine, dispatcher) = build_engine(email_queue(), echo_handler()).await?;

    let advanced = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&advanced);
    let _sub = engine.subscribe(EventKind::ChainAdvanced, move |event| {
        if let EngineEvent::ChainAdvanced {
            completed_index,
            next_index,
            ..
        } = event
        {
            sink.lock().unwrap().push((*completed_index, *next_index));
        }
    });

    engine
        .add_chain(
            "emails",
            (0..3)
                .map(|step| ChainEntry::new(serde_json::json!({ "step": step })))
                .collect(),
            ChainOptions::default(),
        )
        .await?;

    for delivery in dispatcher.drain()? {
        engine.process_delivery(&delivery.payload).await?;
    }

    // The last step emits no advancement.
    assert_eq!(*advanced.lock().unwrap(), vec![(0, 1), (1, 2)]);

    Ok(())
}
