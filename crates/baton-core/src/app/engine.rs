//! Engine - ステージイベントを受けてタスクを進める
//!
//! # フロー（イベント 1 件）
//! 1. `record_event_seen` で重複排除
//! 2. タスクを読む（未知なら破棄）
//! 3. イベントの stage が current_stage と一致するか確認（不一致は stale として破棄）
//! 4. `decide` で次の行動を決める
//! 5. `compare_and_update` で確定（VersionConflict なら 2 から再実行、上限あり）
//! 6. 非終端なら timeout watcher を張ってから stage-start を publish
//!
//! タイムアウトは合成失敗イベントとして同じ 2〜6 を通ります。

use std::sync::Arc;

use tokio::sync::mpsc;

use super::timeout::{TimeoutScheduler, WatchKey};
use crate::domain::decision::{Decision, Trigger, decide};
use crate::domain::errors::{ChannelError, EngineError, StoreError};
use crate::domain::events::{DomainEvent, EventOutcome, StageEvent, StageStart};
use crate::domain::ids::TaskId;
use crate::domain::stage::StageName;
use crate::domain::task::{FailureCause, Task, TaskStatus};
use crate::graph::StageGraph;
use crate::ports::{Channel, Clock, EventSink, Mutation, TaskStore, publish_json};

/// Bounded retries for `VersionConflict` when none is configured.
pub const DEFAULT_CONFLICT_RETRY_LIMIT: u32 = 5;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub conflict_retry_limit: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            conflict_retry_limit: DEFAULT_CONFLICT_RETRY_LIMIT,
        }
    }
}

/// Why an event (or timeout) had no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// `event_id` already in the dedup ledger.
    Duplicate,
    UnknownTask,
    /// Stage mismatch, terminal task, or a superseded watcher.
    Stale,
    /// `started` for a task that is already in progress; nothing to record.
    AlreadyStarted,
}

/// The committed change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// A `started` event moved the task from pending to in progress.
    Acknowledged,
    Advanced { from: StageName, to: StageName },
    Retried { stage: StageName, attempt: u32 },
    Completed,
    Failed { cause: FailureCause },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDisposition {
    Applied(Transition),
    Discarded(DiscardReason),
}

enum Loaded {
    Current(Task),
    Discard(DiscardReason),
}

/// The orchestrator engine.
///
/// Holds only immutable configuration and handles to the injected ports, so
/// any number of workers can share one `Arc<Engine>`.
pub struct Engine {
    graph: Arc<StageGraph>,
    store: Arc<dyn TaskStore>,
    channel: Arc<dyn Channel>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    timeouts: TimeoutScheduler,
    settings: EngineSettings,
}

impl Engine {
    /// Build an engine; the returned receiver yields fired watchers and is
    /// meant for [`run_timeout_loop`](super::timeout::run_timeout_loop).
    pub fn new(
        graph: Arc<StageGraph>,
        store: Arc<dyn TaskStore>,
        channel: Arc<dyn Channel>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> (Self, mpsc::UnboundedReceiver<WatchKey>) {
        let (timeouts, fired_rx) = TimeoutScheduler::new();
        let engine = Self {
            graph,
            store,
            channel,
            events,
            clock,
            timeouts,
            settings,
        };
        (engine, fired_rx)
    }

    pub fn graph(&self) -> &StageGraph {
        &self.graph
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn timeouts(&self) -> &TimeoutScheduler {
        &self.timeouts
    }

    pub(crate) fn emit(&self, event: DomainEvent) {
        self.events.emit(event);
    }

    /// Handle one inbound stage event.
    ///
    /// Discards are `Ok(EventDisposition::Discarded(..))`. An `Err` means
    /// nothing was committed; the dedup mark is released so a redelivery of
    /// the same event is processed again.
    #[tracing::instrument(
        skip(self, event),
        fields(event_id = %event.event_id, task_id = %event.task_id, stage = %event.stage)
    )]
    pub async fn handle_event(&self, event: &StageEvent) -> Result<EventDisposition, EngineError> {
        if !self.store.record_event_seen(event.event_id).await? {
            tracing::debug!("duplicate event discarded");
            return Ok(EventDisposition::Discarded(DiscardReason::Duplicate));
        }

        let result = match event.outcome {
            EventOutcome::Started => self.acknowledge_started(event).await,
            EventOutcome::Done => {
                let trigger = Trigger::Done {
                    payload: event.payload.clone(),
                };
                self.transition(event.task_id, &trigger, |t| t.current_stage == event.stage)
                    .await
            }
            EventOutcome::Failed => {
                let trigger = Trigger::AgentFailed {
                    detail: event.error.clone(),
                };
                self.transition(event.task_id, &trigger, |t| t.current_stage == event.stage)
                    .await
            }
        };

        if let Err(e) = &result {
            tracing::error!(error = %e, kind = ?e.kind(), "event handling failed");
            if let Err(release) = self.store.forget_event(event.event_id).await {
                tracing::warn!(error = %release, "could not release dedup mark");
            }
        }
        result
    }

    /// Handle a fired timeout watcher. A key that no longer matches the
    /// task's current dispatch is a no-op.
    #[tracing::instrument(
        skip(self, key),
        fields(task_id = %key.task_id, stage = %key.stage, dispatch_version = key.dispatch_version)
    )]
    pub async fn handle_timeout(&self, key: &WatchKey) -> Result<EventDisposition, EngineError> {
        self.transition(key.task_id, &Trigger::TimedOut, |t| {
            t.current_stage == key.stage && t.dispatch_version == key.dispatch_version
        })
        .await
    }

    /// Re-arm a watcher for every in-flight task (after a restart).
    ///
    /// The stage-start is not re-sent right away: the agent may still be
    /// working. If it is not, the watcher retries the stage.
    pub async fn recover_in_flight(&self) -> Result<usize, EngineError> {
        let tasks = self.store.list_in_flight().await?;
        let mut armed = 0;
        for task in tasks {
            let Some(timeout) = self.graph.timeout_for(&task.current_stage) else {
                tracing::warn!(
                    task_id = %task.task_id,
                    stage = %task.current_stage,
                    "in-flight task is at a stage missing from the graph, not recovered"
                );
                continue;
            };
            self.timeouts.arm(watch_key(&task), timeout).await;
            armed += 1;
        }
        tracing::info!(armed, "recovered in-flight tasks");
        Ok(armed)
    }

    /// Arm the watcher for the task's current dispatch, then publish its
    /// stage-start.
    ///
    /// The watcher is armed first so a failed or lost publish is retried
    /// once the stage times out.
    pub(crate) async fn dispatch(&self, task: &Task) -> Result<(), ChannelError> {
        let stage = &task.current_stage;
        let (Some(topic), Some(timeout)) = (self.graph.topic_for(stage), self.graph.timeout_for(stage))
        else {
            tracing::warn!(task_id = %task.task_id, %stage, "no stage definition, nothing dispatched");
            return Ok(());
        };

        self.timeouts.arm(watch_key(task), timeout).await;

        let attempt = task.current_attempt();
        let start = StageStart {
            task_id: task.task_id,
            subject_id: task.subject_id.clone(),
            stage: stage.clone(),
            attempt,
            payload: task.payload.clone(),
            dispatched_at: self.clock.now(),
        };
        publish_json(self.channel.as_ref(), topic, &start).await?;

        self.emit(DomainEvent::StageDispatched {
            task_id: task.task_id,
            stage: stage.clone(),
            attempt,
        });
        Ok(())
    }

    async fn load_current(
        &self,
        task_id: TaskId,
        is_current: impl Fn(&Task) -> bool,
    ) -> Result<Loaded, EngineError> {
        let task = match self.store.get(task_id).await {
            Ok(task) => task,
            Err(StoreError::NotFound(_)) => {
                tracing::warn!("event for unknown task discarded");
                return Ok(Loaded::Discard(DiscardReason::UnknownTask));
            }
            Err(e) => return Err(e.into()),
        };

        if task.is_terminal() || !is_current(&task) {
            tracing::debug!(
                current_stage = %task.current_stage,
                status = %task.status,
                version = task.version,
                "stale event discarded"
            );
            return Ok(Loaded::Discard(DiscardReason::Stale));
        }
        Ok(Loaded::Current(task))
    }

    fn note_conflict(&self, task_id: TaskId, conflicts: &mut u32) -> Result<(), EngineError> {
        *conflicts += 1;
        if *conflicts > self.settings.conflict_retry_limit {
            return Err(EngineError::ConflictRetriesExhausted {
                task_id,
                attempts: *conflicts,
            });
        }
        tracing::debug!(conflicts = *conflicts, "version conflict, re-reading task");
        Ok(())
    }

    async fn acknowledge_started(&self, event: &StageEvent) -> Result<EventDisposition, EngineError> {
        let mut conflicts = 0;
        loop {
            let task = match self
                .load_current(event.task_id, |t| t.current_stage == event.stage)
                .await?
            {
                Loaded::Current(task) => task,
                Loaded::Discard(reason) => return Ok(EventDisposition::Discarded(reason)),
            };

            if task.status != TaskStatus::Pending {
                tracing::debug!(status = %task.status, "task already started");
                return Ok(EventDisposition::Discarded(DiscardReason::AlreadyStarted));
            }

            let mutation: Mutation = Box::new(|t| t.status = TaskStatus::InProgress);
            match self
                .store
                .compare_and_update(task.task_id, task.version, mutation)
                .await
            {
                Ok(updated) => {
                    tracing::info!(version = updated.version, "stage started");
                    return Ok(EventDisposition::Applied(Transition::Acknowledged));
                }
                Err(StoreError::VersionConflict { .. }) => {
                    self.note_conflict(task.task_id, &mut conflicts)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn transition(
        &self,
        task_id: TaskId,
        trigger: &Trigger,
        is_current: impl Fn(&Task) -> bool,
    ) -> Result<EventDisposition, EngineError> {
        let mut conflicts = 0;
        loop {
            let task = match self.load_current(task_id, &is_current).await? {
                Loaded::Current(task) => task,
                Loaded::Discard(reason) => return Ok(EventDisposition::Discarded(reason)),
            };

            let Some(decision) = decide(&self.graph, &task, trigger) else {
                tracing::warn!(
                    current_stage = %task.current_stage,
                    "task is at a stage missing from the graph, discarded"
                );
                return Ok(EventDisposition::Discarded(DiscardReason::Stale));
            };

            let now = self.clock.now();
            let mutation: Mutation = {
                let decision = decision.clone();
                let trigger = trigger.clone();
                Box::new(move |t| decision.apply(t, &trigger, now))
            };

            match self
                .store
                .compare_and_update(task.task_id, task.version, mutation)
                .await
            {
                Ok(updated) => return Ok(self.after_commit(&task, decision, &updated).await),
                Err(StoreError::VersionConflict { .. }) => {
                    self.note_conflict(task.task_id, &mut conflicts)?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn after_commit(&self, before: &Task, decision: Decision, updated: &Task) -> EventDisposition {
        let task_id = updated.task_id;
        let from = before.current_stage.clone();

        let transition = match decision {
            Decision::Advance { to } => {
                tracing::info!(%from, %to, version = updated.version, "stage advanced");
                self.emit(DomainEvent::StageAdvanced {
                    task_id,
                    from: from.clone(),
                    to: to.clone(),
                });
                Transition::Advanced { from, to }
            }
            Decision::Retry { attempt, cause } => {
                tracing::info!(stage = %from, attempt, %cause, "stage retried");
                self.emit(DomainEvent::StageRetried {
                    task_id,
                    stage: from.clone(),
                    attempt,
                    cause,
                });
                Transition::Retried {
                    stage: from,
                    attempt,
                }
            }
            Decision::Complete => {
                tracing::info!(version = updated.version, "task completed");
                self.emit(DomainEvent::TaskCompleted { task_id });
                return EventDisposition::Applied(Transition::Completed);
            }
            Decision::Fail { cause } => {
                tracing::warn!(stage = %from, %cause, "task failed");
                self.emit(DomainEvent::TaskFailed {
                    task_id,
                    stage: from,
                    cause,
                });
                return EventDisposition::Applied(Transition::Failed { cause });
            }
        };

        if let Err(e) = self.dispatch(updated).await {
            tracing::error!(
                stage = %updated.current_stage,
                error = %e,
                "stage-start publish failed, the timeout watcher will retry it"
            );
        }
        EventDisposition::Applied(transition)
    }
}

fn watch_key(task: &Task) -> WatchKey {
    WatchKey {
        task_id: task.task_id,
        stage: task.current_stage.clone(),
        dispatch_version: task.dispatch_version,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use ulid::Ulid;

    use super::*;
    use crate::domain::ids::EventId;
    use crate::domain::stage::FailureRoute;
    use crate::domain::task::{StageOutcome, SubjectId};
    use crate::graph::StageDefinition;
    use crate::impls::{InMemoryChannel, InMemoryTaskStore, MemoryEventSink};
    use crate::ports::{StatusCounts, Subscription, SystemClock, WireCodec};

    /// Delegates to an in-memory store, with injectable faults.
    struct FaultyStore {
        inner: InMemoryTaskStore,
        failing_gets: AtomicU32,
        always_conflict: AtomicBool,
        /// Committed by a competing writer right before the next CAS.
        competing_write: Mutex<Option<Mutation>>,
        conflicts: AtomicU32,
    }

    impl FaultyStore {
        fn new() -> Self {
            Self {
                inner: InMemoryTaskStore::default(),
                failing_gets: AtomicU32::new(0),
                always_conflict: AtomicBool::new(false),
                competing_write: Mutex::new(None),
                conflicts: AtomicU32::new(0),
            }
        }

        fn race_next_update(&self, mutation: Mutation) {
            *self.competing_write.lock().unwrap() = Some(mutation);
        }
    }

    #[async_trait]
    impl TaskStore for FaultyStore {
        async fn create(
            &self,
            subject_id: SubjectId,
            entry: StageName,
            payload: serde_json::Value,
        ) -> Result<Task, StoreError> {
            self.inner.create(subject_id, entry, payload).await
        }

        async fn get(&self, task_id: TaskId) -> Result<Task, StoreError> {
            let remaining = self.failing_gets.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_gets.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("injected".into()));
            }
            self.inner.get(task_id).await
        }

        async fn compare_and_update(
            &self,
            task_id: TaskId,
            expected_version: u64,
            mutate: Mutation,
        ) -> Result<Task, StoreError> {
            if self.always_conflict.load(Ordering::SeqCst) {
                return Err(StoreError::VersionConflict {
                    task_id,
                    expected: expected_version,
                    actual: expected_version + 1,
                });
            }
            let competing = self.competing_write.lock().unwrap().take();
            if let Some(competing) = competing {
                self.inner
                    .compare_and_update(task_id, expected_version, competing)
                    .await?;
            }
            let result = self
                .inner
                .compare_and_update(task_id, expected_version, mutate)
                .await;
            if matches!(result, Err(StoreError::VersionConflict { .. })) {
                self.conflicts.fetch_add(1, Ordering::SeqCst);
            }
            result
        }

        async fn record_event_seen(&self, event_id: EventId) -> Result<bool, StoreError> {
            self.inner.record_event_seen(event_id).await
        }

        async fn forget_event(&self, event_id: EventId) -> Result<(), StoreError> {
            self.inner.forget_event(event_id).await
        }

        async fn purge_expired_events(&self) -> Result<usize, StoreError> {
            self.inner.purge_expired_events().await
        }

        async fn list_in_flight(&self) -> Result<Vec<Task>, StoreError> {
            self.inner.list_in_flight().await
        }

        async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
            self.inner.counts_by_status().await
        }
    }

    struct Harness {
        engine: Engine,
        store: Arc<FaultyStore>,
        sink: Arc<MemoryEventSink>,
        kyc: Subscription,
    }

    async fn harness() -> Harness {
        harness_with(onboarding()).await
    }

    fn onboarding() -> StageGraph {
        StageGraph::new(
            "conversation",
            vec![
                StageDefinition::new("conversation", "conversation").then("kyc"),
                StageDefinition::new("kyc", "kyc")
                    .then("audit")
                    .on_failure(FailureRoute::RetrySame)
                    .max_attempts(2)
                    .timeout(Duration::from_secs(5)),
                StageDefinition::new("audit", "audit"),
            ],
        )
        .unwrap()
    }

    async fn harness_with(graph: StageGraph) -> Harness {
        let store = Arc::new(FaultyStore::new());
        let channel = Arc::new(InMemoryChannel::new());
        let sink = Arc::new(MemoryEventSink::new());
        let kyc = channel.subscribe("kyc").await.unwrap();
        let (engine, _fired) = Engine::new(
            Arc::new(graph),
            store.clone(),
            channel,
            sink.clone(),
            Arc::new(SystemClock),
            EngineSettings::default(),
        );
        Harness {
            engine,
            store,
            sink,
            kyc,
        }
    }

    impl Harness {
        async fn task(&self) -> Task {
            self.store
                .create(
                    SubjectId::parse("u1").unwrap(),
                    "conversation".into(),
                    serde_json::json!({"user_id": "u1"}),
                )
                .await
                .unwrap()
        }

        async fn reload(&self, task: &Task) -> Task {
            self.store.get(task.task_id).await.unwrap()
        }
    }

    fn eid() -> EventId {
        EventId::from_ulid(Ulid::new())
    }

    fn done(task: &Task, stage: &str) -> StageEvent {
        StageEvent::done(eid(), task.task_id, stage.into(), serde_json::Value::Null)
    }

    fn failed(task: &Task, stage: &str) -> StageEvent {
        StageEvent::failed(eid(), task.task_id, stage.into(), "rejected")
    }

    #[tokio::test]
    async fn done_advances_and_dispatches_next_stage() {
        let mut h = harness().await;
        let task = h.task().await;
        let event = StageEvent::done(
            eid(),
            task.task_id,
            "conversation".into(),
            serde_json::json!({"user_id": "u1", "intent": "credit_card"}),
        );

        let disposition = h.engine.handle_event(&event).await.unwrap();

        assert_eq!(
            disposition,
            EventDisposition::Applied(Transition::Advanced {
                from: "conversation".into(),
                to: "kyc".into()
            })
        );
        let task = h.reload(&task).await;
        assert_eq!(task.current_stage.as_str(), "kyc");
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.dispatch_version, task.version);

        let start: StageStart = WireCodec::decode(&h.kyc.recv().await.unwrap()).unwrap();
        assert_eq!(start.task_id, task.task_id);
        assert_eq!(start.attempt, 1);
        assert_eq!(start.payload["intent"], "credit_card");
        assert_eq!(h.sink.names(), vec!["stage_advanced", "stage_dispatched"]);
        assert_eq!(h.engine.timeouts().pending().await, 1);
    }

    #[tokio::test]
    async fn duplicate_event_is_discarded() {
        let h = harness().await;
        let task = h.task().await;
        let event = done(&task, "conversation");

        h.engine.handle_event(&event).await.unwrap();
        let again = h.engine.handle_event(&event).await.unwrap();

        assert_eq!(again, EventDisposition::Discarded(DiscardReason::Duplicate));
        assert_eq!(h.reload(&task).await.version, 1);
    }

    #[tokio::test]
    async fn event_for_unknown_task_is_discarded() {
        let h = harness().await;
        let event = StageEvent::done(
            eid(),
            TaskId::from_ulid(Ulid::new()),
            "conversation".into(),
            serde_json::Value::Null,
        );
        assert_eq!(
            h.engine.handle_event(&event).await.unwrap(),
            EventDisposition::Discarded(DiscardReason::UnknownTask)
        );
    }

    #[tokio::test]
    async fn event_for_other_stage_is_stale() {
        let h = harness().await;
        let task = h.task().await;
        assert_eq!(
            h.engine.handle_event(&done(&task, "audit")).await.unwrap(),
            EventDisposition::Discarded(DiscardReason::Stale)
        );
        assert_eq!(h.reload(&task).await.version, 0);
    }

    #[tokio::test]
    async fn started_moves_pending_to_in_progress_once() {
        let h = harness().await;
        let task = h.task().await;
        let started = |t: &Task| StageEvent::started(eid(), t.task_id, "conversation".into());

        let first = h.engine.handle_event(&started(&task)).await.unwrap();
        let second = h.engine.handle_event(&started(&task)).await.unwrap();

        assert_eq!(first, EventDisposition::Applied(Transition::Acknowledged));
        assert_eq!(second, EventDisposition::Discarded(DiscardReason::AlreadyStarted));
        let task = h.reload(&task).await;
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.version, 1);
        assert_eq!(task.dispatch_version, 0);
        assert!(task.stage_history.is_empty());
    }

    #[tokio::test]
    async fn retry_same_then_exhaustion_fails_with_agent_failure() {
        let mut h = harness().await;
        let task = h.task().await;
        h.engine.handle_event(&done(&task, "conversation")).await.unwrap();
        h.kyc.recv().await.unwrap();

        let first = h.engine.handle_event(&failed(&task, "kyc")).await.unwrap();
        assert_eq!(
            first,
            EventDisposition::Applied(Transition::Retried {
                stage: "kyc".into(),
                attempt: 2
            })
        );
        let retry: StageStart = WireCodec::decode(&h.kyc.recv().await.unwrap()).unwrap();
        assert_eq!(retry.attempt, 2);

        let second = h.engine.handle_event(&failed(&task, "kyc")).await.unwrap();
        assert_eq!(
            second,
            EventDisposition::Applied(Transition::Failed {
                cause: FailureCause::AgentFailure
            })
        );

        let task = h.reload(&task).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.current_stage.as_str(), "kyc");
        assert_eq!(task.attempt_count(&"kyc".into()), 2);
        assert_eq!(
            h.engine.handle_event(&done(&task, "kyc")).await.unwrap(),
            EventDisposition::Discarded(DiscardReason::Stale)
        );
    }

    #[tokio::test]
    async fn superseded_watcher_is_a_no_op() {
        let h = harness().await;
        let task = h.task().await;
        let old_key = watch_key(&task);
        h.engine.handle_event(&done(&task, "conversation")).await.unwrap();

        assert_eq!(
            h.engine.handle_timeout(&old_key).await.unwrap(),
            EventDisposition::Discarded(DiscardReason::Stale)
        );
    }

    #[tokio::test]
    async fn current_watcher_retries_stage() {
        let mut h = harness().await;
        let task = h.task().await;
        h.engine.handle_event(&done(&task, "conversation")).await.unwrap();
        h.kyc.recv().await.unwrap();
        let at_kyc = h.reload(&task).await;

        let disposition = h.engine.handle_timeout(&watch_key(&at_kyc)).await.unwrap();

        assert_eq!(
            disposition,
            EventDisposition::Applied(Transition::Retried {
                stage: "kyc".into(),
                attempt: 2
            })
        );
        let record = h.reload(&task).await.stage_history.pop().unwrap();
        assert_eq!(record.cause, Some(FailureCause::TimeoutExceeded));
        let retry: StageStart = WireCodec::decode(&h.kyc.recv().await.unwrap()).unwrap();
        assert_eq!(retry.attempt, 2);
    }

    #[tokio::test]
    async fn store_outage_releases_dedup_mark() {
        let h = harness().await;
        let task = h.task().await;
        let event = done(&task, "conversation");
        h.store.failing_gets.store(1, Ordering::SeqCst);

        let err = h.engine.handle_event(&event).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Unavailable(_))));

        // redelivery after recovery is processed
        let retry = h.engine.handle_event(&event).await.unwrap();
        assert!(matches!(retry, EventDisposition::Applied(Transition::Advanced { .. })));
    }

    #[tokio::test]
    async fn endless_conflicts_give_up_after_limit() {
        let h = harness().await;
        let task = h.task().await;
        h.store.always_conflict.store(true, Ordering::SeqCst);

        let err = h
            .engine
            .handle_event(&done(&task, "conversation"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::ConflictRetriesExhausted { attempts, .. }
                if attempts == DEFAULT_CONFLICT_RETRY_LIMIT + 1
        ));
    }

    #[tokio::test]
    async fn recovery_arms_one_watcher_per_in_flight_task() {
        let h = harness().await;
        let a = h.task().await;
        let _b = h.task().await;
        h.store
            .compare_and_update(a.task_id, 0, Box::new(|t| t.status = TaskStatus::Completed))
            .await
            .unwrap();

        assert_eq!(h.engine.recover_in_flight().await.unwrap(), 1);
        assert_eq!(h.engine.timeouts().pending().await, 1);
    }

    #[tokio::test]
    async fn conflict_loser_rereads_and_discards_as_stale() {
        let h = harness().await;
        let task = h.task().await;
        // another handler advances the task between our read and our write
        h.store.race_next_update(Box::new(|t| {
            t.current_stage = "kyc".into();
            t.status = TaskStatus::InProgress;
        }));

        let disposition = h
            .engine
            .handle_event(&done(&task, "conversation"))
            .await
            .unwrap();

        assert_eq!(disposition, EventDisposition::Discarded(DiscardReason::Stale));
        assert_eq!(h.store.conflicts.load(Ordering::SeqCst), 1);
        let after = h.reload(&task).await;
        assert_eq!(after.version, 1);
        assert_eq!(after.current_stage.as_str(), "kyc");
        assert!(after.stage_history.is_empty());
        assert!(h.sink.names().is_empty());
        assert_eq!(h.engine.timeouts().pending().await, 0);
    }

    #[tokio::test]
    async fn review_loop_only_repeats_revisitable_stages() {
        let graph = StageGraph::new(
            "conversation",
            vec![
                StageDefinition::new("conversation", "conversation")
                    .then("kyc")
                    .allow_revisit(true),
                StageDefinition::new("kyc", "kyc")
                    .then("advisor")
                    .allow_revisit(true),
                StageDefinition::new("advisor", "advisor")
                    .then("audit")
                    .on_failure(FailureRoute::Stage("conversation".into()))
                    .allow_revisit(true),
                StageDefinition::new("audit", "audit"),
            ],
        )
        .unwrap();
        let h = harness_with(graph).await;
        let task = h.task().await;

        for event in [
            done(&task, "conversation"),
            done(&task, "kyc"),
            failed(&task, "advisor"),
            done(&task, "conversation"),
            done(&task, "kyc"),
            done(&task, "advisor"),
            done(&task, "audit"),
        ] {
            let disposition = h.engine.handle_event(&event).await.unwrap();
            assert!(matches!(disposition, EventDisposition::Applied(_)), "{disposition:?}");
        }

        let task = h.reload(&task).await;
        assert_eq!(task.status, TaskStatus::Completed);
        for def in h.engine.graph().stages() {
            let completed = task
                .stage_history
                .iter()
                .filter(|r| r.stage == def.name && r.outcome == StageOutcome::Done)
                .count();
            assert!(
                completed <= 1 || def.allow_revisit,
                "{} completed {completed} times",
                def.name
            );
        }
        assert_eq!(task.attempt_count(&"advisor".into()), 1);
    }
}
