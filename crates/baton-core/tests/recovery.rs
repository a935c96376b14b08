//! Restart on top of a file-backed store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use baton_core::app::{DiscardReason, EventDisposition};
use baton_core::domain::{StageEvent, TaskStatus};
use baton_core::impls::{FileTaskStore, InMemoryChannel};
use baton_core::ports::{SystemClock, TaskStore, UlidGenerator};
use common::{next_start, onboarding_graph, start_with_store};

const TIMEOUT: Duration = Duration::from_millis(300);

async fn open(path: &std::path::Path) -> Arc<dyn TaskStore> {
    let clock = Arc::new(SystemClock);
    let ids = Arc::new(UlidGenerator::new(clock.clone()));
    Arc::new(FileTaskStore::open(path, clock, ids).await.unwrap())
}

#[tokio::test]
async fn in_flight_task_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    // first run: conversation done, kyc dispatched, then the process stops
    let first = start_with_store(
        onboarding_graph(TIMEOUT),
        open(&path).await,
        Arc::new(InMemoryChannel::new()),
    )
    .await;
    let mut conversation = first.subscribe("conversation").await;
    let mut kyc = first.subscribe("kyc").await;
    let task_id = first.orchestrator.submit("u1").await.unwrap();
    next_start(&mut conversation).await;
    let done = StageEvent::done(first.event_id(), task_id, "conversation".into(), serde_json::Value::Null);
    first.send(&done).await;
    next_start(&mut kyc).await;
    first.orchestrator.shutdown().await;

    // second run: the kyc agent never answered, so the watcher re-dispatches
    let second = start_with_store(
        onboarding_graph(TIMEOUT),
        open(&path).await,
        Arc::new(InMemoryChannel::new()),
    )
    .await;
    let mut kyc = second.subscribe("kyc").await;
    let mut advisor = second.subscribe("advisor").await;

    let restored = second.task(task_id).await;
    assert_eq!(restored.current_stage.as_str(), "kyc");
    assert_eq!(restored.status, TaskStatus::InProgress);

    let retry = next_start(&mut kyc).await;
    assert_eq!(retry.task_id, task_id);
    assert_eq!(retry.attempt, 2);

    let replay = second.orchestrator.engine().handle_event(&done).await.unwrap();
    assert_eq!(replay, EventDisposition::Discarded(DiscardReason::Duplicate));

    second.done(task_id, "kyc").await;
    assert_eq!(next_start(&mut advisor).await.task_id, task_id);

    second.orchestrator.shutdown().await;
}

#[tokio::test]
async fn terminal_tasks_are_not_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let first = start_with_store(
        onboarding_graph(TIMEOUT),
        open(&path).await,
        Arc::new(InMemoryChannel::new()),
    )
    .await;
    let mut subs = Vec::new();
    for topic in ["conversation", "kyc", "advisor", "audit"] {
        subs.push((topic, first.subscribe(topic).await));
    }
    let task_id = first.orchestrator.submit("u1").await.unwrap();
    for (topic, sub) in subs.iter_mut() {
        next_start(sub).await;
        first.done(task_id, *topic).await;
    }
    first.wait_for(task_id, |t| t.status == TaskStatus::Completed).await;
    first.orchestrator.shutdown().await;

    let second = start_with_store(
        onboarding_graph(TIMEOUT),
        open(&path).await,
        Arc::new(InMemoryChannel::new()),
    )
    .await;

    assert!(second.store.list_in_flight().await.unwrap().is_empty());
    assert_eq!(second.orchestrator.engine().timeouts().pending().await, 0);
    let counts = second.orchestrator.counts().await.unwrap();
    assert_eq!(counts.completed, 1);

    second.orchestrator.shutdown().await;
}
