//! Agent adapter - ワーカーエージェント側の契約と実行ランタイム
//!
//! # 契約
//! - stage-start を 1 件受け取ったら、done / failed をちょうど 1 件 publish する
//! - 任意で、処理開始時に started を publish できる
//! - エージェントは TaskStore に触れない（状態変更は必ずイベント経由）
//!
//! クラッシュして何も返さなかった場合の回復はエンジン側のタイムアウトが担います。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::domain::errors::ChannelError;
use crate::domain::events::{StageEvent, StageStart};
use crate::graph::StageGraph;
use crate::ports::{Channel, IdGenerator, Subscription, WireCodec, publish_json};

/// Failure reported by an agent; becomes the `error` of a `failed` event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct AgentError(pub String);

impl AgentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Agent はステージの実処理を行う（エンジンからは不透明）
///
/// # 使用例
/// ```ignore
/// struct KycAgent;
///
/// #[async_trait]
/// impl Agent for KycAgent {
///     fn topic(&self) -> &str { "kyc" }
///
///     async fn handle(&self, start: &StageStart) -> Result<serde_json::Value, AgentError> {
///         Ok(start.payload.clone())
///     }
/// }
/// ```
#[async_trait]
pub trait Agent: Send + Sync {
    fn topic(&self) -> &str;

    /// Publish a `started` event before `handle` runs.
    fn reports_started(&self) -> bool {
        true
    }

    /// `Ok(payload)` becomes a `done` event, `Err` a `failed` event.
    async fn handle(&self, start: &StageStart) -> Result<serde_json::Value, AgentError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("an agent for topic '{0}' is already registered")]
    AlreadyRegistered(String),
}

/// One agent per topic.
#[derive(Default)]
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, agent: Arc<dyn Agent>) -> Result<(), RegistryError> {
        let topic = agent.topic().to_string();
        if self.agents.contains_key(&topic) {
            return Err(RegistryError::AlreadyRegistered(topic));
        }
        self.agents.insert(topic, agent);
        Ok(())
    }

    pub fn get(&self, topic: &str) -> Option<Arc<dyn Agent>> {
        self.agents.get(topic).cloned()
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.agents.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Topics used by `graph` that have no registered agent.
    pub fn missing_topics(&self, graph: &StageGraph) -> Vec<String> {
        graph
            .topics()
            .into_iter()
            .filter(|topic| !self.agents.contains_key(*topic))
            .map(str::to_string)
            .collect()
    }

    pub fn agents(&self) -> impl Iterator<Item = &Arc<dyn Agent>> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Runs agents against a channel: stage-starts in, stage events out.
#[derive(Clone)]
pub struct AgentRunner {
    channel: Arc<dyn Channel>,
    ids: Arc<dyn IdGenerator>,
    events_topic: String,
}

impl AgentRunner {
    pub fn new(
        channel: Arc<dyn Channel>,
        ids: Arc<dyn IdGenerator>,
        events_topic: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            ids,
            events_topic: events_topic.into(),
        }
    }

    /// Subscribe to the agent's topic and serve it until shutdown.
    ///
    /// The subscription exists when this returns, so stage-starts published
    /// afterwards are not missed.
    pub async fn spawn(
        &self,
        agent: Arc<dyn Agent>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, ChannelError> {
        let inbox = self.channel.subscribe(agent.topic()).await?;
        let runner = self.clone();
        Ok(tokio::spawn(runner.serve(agent, inbox, shutdown_rx)))
    }

    async fn serve(
        self,
        agent: Arc<dyn Agent>,
        mut inbox: Subscription,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let topic = agent.topic().to_string();
        // stage-starts run concurrently; dropping the set aborts them
        let mut running = JoinSet::new();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                message = inbox.recv() => {
                    let Some(bytes) = message else {
                        break;
                    };
                    let start: StageStart = match WireCodec::decode(&bytes) {
                        Ok(start) => start,
                        Err(e) => {
                            tracing::warn!(%topic, error = %e, "undecodable stage-start dropped");
                            continue;
                        }
                    };
                    let runner = self.clone();
                    let agent = Arc::clone(&agent);
                    running.spawn(async move {
                        if let Err(e) = runner.run_once(agent.as_ref(), &start).await {
                            tracing::warn!(task_id = %start.task_id, stage = %start.stage, error = %e, "agent could not report");
                        }
                    });
                }
                Some(_) = running.join_next(), if !running.is_empty() => {}
            }
        }
        tracing::debug!(%topic, in_flight = running.len(), "agent runner stopped");
    }

    /// Handle one stage-start: optional `started`, then exactly one of
    /// `done` / `failed`.
    pub async fn run_once(&self, agent: &dyn Agent, start: &StageStart) -> Result<(), ChannelError> {
        if agent.reports_started() {
            let started = StageEvent::started(
                self.ids.generate_event_id(),
                start.task_id,
                start.stage.clone(),
            );
            publish_json(self.channel.as_ref(), &self.events_topic, &started).await?;
        }

        let event = match agent.handle(start).await {
            Ok(payload) => StageEvent::done(
                self.ids.generate_event_id(),
                start.task_id,
                start.stage.clone(),
                payload,
            ),
            Err(e) => {
                tracing::info!(task_id = %start.task_id, stage = %start.stage, error = %e, "agent reported failure");
                StageEvent::failed(
                    self.ids.generate_event_id(),
                    start.task_id,
                    start.stage.clone(),
                    e.0,
                )
            }
        };
        publish_json(self.channel.as_ref(), &self.events_topic, &event).await
    }
}
