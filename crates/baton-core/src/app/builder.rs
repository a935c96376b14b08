//! OrchestratorBuilder - オーケストレータの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターン（未指定の port はインメモリ実装で埋める）
//! - 起動時検証（Fail-fast 設計）
//! - 明示的な起動と停止（グローバル状態なし）

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::agent::{Agent, AgentRegistry, AgentRunner, RegistryError};
use super::engine::{Engine, EngineSettings};
use super::gc_loop::run_gc_loop;
use super::intake::Intake;
use super::status::{TaskStatusView, query_status};
use super::timeout::{WatchKey, run_timeout_loop};
use super::worker_loop::WorkerGroup;
use crate::config::{ConfigError, OrchestratorConfig};
use crate::domain::errors::{ChannelError, EngineError, IntakeError, StoreError};
use crate::domain::ids::TaskId;
use crate::graph::StageGraph;
use crate::impls::{InMemoryChannel, InMemoryTaskStore, TracingEventSink};
use crate::ports::{
    Channel, Clock, EventSink, IdGenerator, StatusCounts, SystemClock, TaskStore, UlidGenerator,
};

/// OrchestratorBuilder はオーケストレータを構築
///
/// # 使用例
/// ```ignore
/// let mut orchestrator = OrchestratorBuilder::new(graph)
///     .store(store)
///     .channel(channel)
///     .agent(Arc::new(KycAgent))?
///     .require_agents()
///     .build()?;
/// orchestrator.start().await?;
/// let task_id = orchestrator.submit("u1").await?;
/// ```
///
/// # Fail-fast 設計
/// - `require_agents()` を指定すると、グラフの全トピックにエージェントが
///   登録されているかを build() でチェックする
/// - 設定値の検証も build() で行う
pub struct OrchestratorBuilder {
    graph: StageGraph,
    settings: OrchestratorConfig,
    store: Option<Arc<dyn TaskStore>>,
    channel: Option<Arc<dyn Channel>>,
    events: Option<Arc<dyn EventSink>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    agents: AgentRegistry,
    require_agents: bool,
}

/// BuildError はオーケストレータ構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("no agent registered for topics {0:?}")]
    MissingAgents(Vec<String>),
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("orchestrator already started")]
    AlreadyStarted,

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl OrchestratorBuilder {
    pub fn new(graph: StageGraph) -> Self {
        Self {
            graph,
            settings: OrchestratorConfig::default(),
            store: None,
            channel: None,
            events: None,
            clock: None,
            ids: None,
            agents: AgentRegistry::new(),
            require_agents: false,
        }
    }

    /// Worker count, topics, retry limit and loop intervals.
    ///
    /// `dedup_retention_secs` only applies to the default store; an explicit
    /// `store()` carries its own retention.
    pub fn settings(mut self, settings: OrchestratorConfig) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn channel(mut self, channel: Arc<dyn Channel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Run `agent` in-process next to the engine.
    pub fn agent(mut self, agent: Arc<dyn Agent>) -> Result<Self, BuildError> {
        self.agents.register(agent)?;
        Ok(self)
    }

    /// Fail `build()` unless every graph topic has an in-process agent.
    pub fn require_agents(mut self) -> Self {
        self.require_agents = true;
        self
    }

    pub fn build(self) -> Result<Orchestrator, BuildError> {
        self.settings.validate()?;

        if self.require_agents {
            let missing = self.agents.missing_topics(&self.graph);
            if !missing.is_empty() {
                return Err(BuildError::MissingAgents(missing));
            }
        }

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let store = self.store.unwrap_or_else(|| {
            Arc::new(
                InMemoryTaskStore::new(Arc::clone(&clock), Arc::clone(&ids))
                    .with_retention(self.settings.dedup_retention()),
            )
        });
        let channel = self
            .channel
            .unwrap_or_else(|| Arc::new(InMemoryChannel::new()));
        let events = self.events.unwrap_or_else(|| Arc::new(TracingEventSink));

        let (engine, fired_rx) = Engine::new(
            Arc::new(self.graph),
            store,
            Arc::clone(&channel),
            events,
            clock,
            EngineSettings {
                conflict_retry_limit: self.settings.conflict_retry_limit,
            },
        );
        let engine = Arc::new(engine);

        Ok(Orchestrator {
            intake: Intake::new(Arc::clone(&engine)),
            engine,
            channel,
            ids,
            settings: self.settings,
            agents: self.agents,
            fired_rx: Some(fired_rx),
            running: None,
        })
    }
}

struct Running {
    workers: WorkerGroup,
    shutdown_tx: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

/// A wired orchestrator instance.
///
/// Everything it owns is torn down by `shutdown()`; nothing is global.
pub struct Orchestrator {
    engine: Arc<Engine>,
    intake: Intake,
    channel: Arc<dyn Channel>,
    ids: Arc<dyn IdGenerator>,
    settings: OrchestratorConfig,
    agents: AgentRegistry,
    fired_rx: Option<mpsc::UnboundedReceiver<WatchKey>>,
    running: Option<Running>,
}

impl Orchestrator {
    /// Subscribe to the events topic, start agents, workers, timeout and GC
    /// loops, then re-arm watchers for tasks left in flight by a previous run.
    /// Re-arm watchers for in-flight tasks, then spawn the workers, agents,
    /// timeout loop and GC loop.
    ///
    /// Nothing is left running when this fails, so `start` may be called
    /// again.
    pub async fn start(&mut self) -> Result<(), StartError> {
        let fired_rx = self.fired_rx.take().ok_or(StartError::AlreadyStarted)?;
        let inbox = match self.channel.subscribe(&self.settings.events_topic).await {
            Ok(inbox) => inbox,
            Err(e) => {
                self.fired_rx = Some(fired_rx);
                return Err(e.into());
            }
        };

        // fired watchers queue up until the timeout loop runs
        if let Err(e) = self.engine.recover_in_flight().await {
            self.engine.timeouts().cancel_all().await;
            self.fired_rx = Some(fired_rx);
            return Err(e.into());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut loops = Vec::new();

        let runner = AgentRunner::new(
            Arc::clone(&self.channel),
            Arc::clone(&self.ids),
            self.settings.events_topic.clone(),
        );
        for agent in self.agents.agents() {
            match runner.spawn(Arc::clone(agent), shutdown_rx.clone()).await {
                Ok(handle) => loops.push(handle),
                Err(e) => {
                    let _ = shutdown_tx.send(true);
                    for handle in loops {
                        let _ = handle.await;
                    }
                    self.engine.timeouts().cancel_all().await;
                    self.fired_rx = Some(fired_rx);
                    return Err(e.into());
                }
            }
        }

        let workers = WorkerGroup::spawn(self.settings.workers, inbox, Arc::clone(&self.engine));
        loops.push(tokio::spawn(run_timeout_loop(
            Arc::clone(&self.engine),
            fired_rx,
            shutdown_rx.clone(),
        )));
        loops.push(tokio::spawn(run_gc_loop(
            Arc::clone(self.engine.store()),
            self.settings.gc_interval(),
            shutdown_rx,
        )));

        tracing::info!(
            workers = workers.len(),
            agents = self.agents.len(),
            events_topic = %self.settings.events_topic,
            "orchestrator started"
        );
        self.running = Some(Running {
            workers,
            shutdown_tx,
            loops,
        });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn intake(&self) -> &Intake {
        &self.intake
    }

    pub async fn submit(&self, subject_id: &str) -> Result<TaskId, IntakeError> {
        self.intake.submit(subject_id).await
    }

    pub async fn submit_with_payload(
        &self,
        subject_id: &str,
        payload: serde_json::Value,
    ) -> Result<TaskId, IntakeError> {
        self.intake.submit_with_payload(subject_id, payload).await
    }

    pub async fn status(&self, task_id: TaskId) -> Result<TaskStatusView, StoreError> {
        query_status(self.engine.store().as_ref(), task_id).await
    }

    pub async fn counts(&self) -> Result<StatusCounts, StoreError> {
        self.engine.store().counts_by_status().await
    }

    /// Stop taking events, let in-flight handlers finish, stop the loops and
    /// agents, and drop pending watchers.
    pub async fn shutdown(mut self) {
        if let Some(running) = self.running.take() {
            running.workers.shutdown_and_join().await;
            let _ = running.shutdown_tx.send(true);
            for handle in running.loops {
                let _ = handle.await;
            }
        }
        self.engine.timeouts().cancel_all().await;
        tracing::info!("orchestrator stopped");
    }
}
