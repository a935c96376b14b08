#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use baton_core::app::{Orchestrator, OrchestratorBuilder};
use baton_core::domain::stage::FailureRoute;
use baton_core::domain::{EventId, StageEvent, StageStart, Task, TaskId};
use baton_core::impls::{InMemoryChannel, InMemoryTaskStore, MemoryEventSink};
use baton_core::ports::{
    Channel, Clock, IdGenerator, Subscription, SystemClock, TaskStore, UlidGenerator, WireCodec,
    publish_json,
};
use baton_core::{StageDefinition, StageGraph};

pub const EVENTS: &str = "orchestrator";

/// `conversation -> kyc -> advisor -> audit -> terminal`, kyc retries once
/// on failure.
pub fn onboarding_graph(timeout: Duration) -> StageGraph {
    StageGraph::new(
        "conversation",
        vec![
            StageDefinition::new("conversation", "conversation")
                .then("kyc")
                .max_attempts(3)
                .timeout(timeout),
            StageDefinition::new("kyc", "kyc")
                .then("advisor")
                .on_failure(FailureRoute::RetrySame)
                .max_attempts(2)
                .timeout(timeout),
            StageDefinition::new("advisor", "advisor")
                .then("audit")
                .timeout(timeout),
            StageDefinition::new("audit", "audit").timeout(timeout),
        ],
    )
    .expect("onboarding graph is valid")
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub channel: Arc<InMemoryChannel>,
    pub store: Arc<dyn TaskStore>,
    pub sink: Arc<MemoryEventSink>,
    pub ids: Arc<dyn IdGenerator>,
}

pub async fn start(graph: StageGraph) -> Harness {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(clock.clone()));
    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new(clock.clone(), ids.clone()));
    start_with_store(graph, store, Arc::new(InMemoryChannel::new())).await
}

pub async fn start_with_store(
    graph: StageGraph,
    store: Arc<dyn TaskStore>,
    channel: Arc<InMemoryChannel>,
) -> Harness {
    let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::new(SystemClock)));
    let sink = Arc::new(MemoryEventSink::new());
    let mut orchestrator = OrchestratorBuilder::new(graph)
        .store(store.clone())
        .channel(channel.clone())
        .event_sink(sink.clone())
        .id_generator(ids.clone())
        .build()
        .expect("orchestrator builds");
    orchestrator.start().await.expect("orchestrator starts");

    Harness {
        orchestrator,
        channel,
        store,
        sink,
        ids,
    }
}

impl Harness {
    pub async fn subscribe(&self, topic: &str) -> Subscription {
        self.channel.subscribe(topic).await.expect("subscribe")
    }

    pub fn event_id(&self) -> EventId {
        self.ids.generate_event_id()
    }

    pub async fn send(&self, event: &StageEvent) {
        publish_json(&*self.channel, EVENTS, event)
            .await
            .expect("publish event");
    }

    pub async fn send_raw(&self, bytes: Vec<u8>) {
        self.channel.publish(EVENTS, bytes).await.expect("publish raw event");
    }

    pub async fn done(&self, task_id: TaskId, stage: &str) {
        let event = StageEvent::done(self.event_id(), task_id, stage.into(), serde_json::Value::Null);
        self.send(&event).await;
    }

    pub async fn failed(&self, task_id: TaskId, stage: &str, error: &str) {
        let event = StageEvent::failed(self.event_id(), task_id, stage.into(), error);
        self.send(&event).await;
    }

    pub async fn task(&self, task_id: TaskId) -> Task {
        self.store.get(task_id).await.expect("task exists")
    }

    /// Poll the store until `done` holds (10ms steps, 2s cap).
    pub async fn wait_for(&self, task_id: TaskId, done: impl Fn(&Task) -> bool) -> Task {
        for _ in 0..200 {
            let task = self.task(task_id).await;
            if done(&task) {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached for {task_id}: {:?}", self.task(task_id).await);
    }
}

pub async fn next_start(sub: &mut Subscription) -> StageStart {
    let bytes = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("stage-start arrives in time")
        .expect("subscription open");
    WireCodec::decode(&bytes).expect("valid stage-start")
}

/// A stage-start that is already queued, without waiting.
pub fn try_next_start(sub: &mut Subscription) -> Option<StageStart> {
    sub.try_recv()
        .map(|bytes| WireCodec::decode(&bytes).expect("valid stage-start"))
}
