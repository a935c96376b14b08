//! Stage Graph: the static routing table of the pipeline.
//!
//! The graph is immutable once built and is validated at construction time,
//! so routing lookups never fail for stages that came from the graph itself.

mod config;
mod validate;

pub use config::{PipelineConfig, StageConfig};

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::domain::errors::ConfigurationError;
use crate::domain::stage::{FailureRoute, StageName, SuccessRoute};
use crate::domain::task::StageOutcome;

/// Definition of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageDefinition {
    pub name: StageName,
    /// Agent channel that handles this stage.
    pub target_topic: String,
    pub next_on_success: SuccessRoute,
    pub next_on_failure: FailureRoute,
    pub max_attempts: u32,
    pub timeout: Duration,
    /// The stage may be entered again after it completed. Every stage on a
    /// loop must set this.
    pub allow_revisit: bool,
}

impl StageDefinition {
    /// Stage that ends the pipeline on success and fails it on failure,
    /// with one attempt and a 30s timeout.
    pub fn new(name: impl Into<StageName>, target_topic: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_topic: target_topic.into(),
            next_on_success: SuccessRoute::Terminal,
            next_on_failure: FailureRoute::Terminal,
            max_attempts: 1,
            timeout: Duration::from_secs(30),
            allow_revisit: false,
        }
    }

    pub fn on_success(mut self, route: SuccessRoute) -> Self {
        self.next_on_success = route;
        self
    }

    /// Shorthand for `on_success(SuccessRoute::Stage(..))`.
    pub fn then(self, next: impl Into<StageName>) -> Self {
        self.on_success(SuccessRoute::Stage(next.into()))
    }

    pub fn on_failure(mut self, route: FailureRoute) -> Self {
        self.next_on_failure = route;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn allow_revisit(mut self, allow: bool) -> Self {
        self.allow_revisit = allow;
        self
    }
}

/// Result of looking up `(stage, outcome)` in the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Move to another stage.
    Next(StageName),
    /// Dispatch the same stage again.
    RetrySame,
    /// Success path ended: the task is completed.
    Complete,
    /// Failure path ended: the task is failed.
    Fail,
}

/// The validated pipeline.
#[derive(Debug, Clone)]
pub struct StageGraph {
    entry: StageName,
    stages: HashMap<StageName, StageDefinition>,
    /// Declaration order, for deterministic iteration.
    order: Vec<StageName>,
}

impl StageGraph {
    /// Build and validate a graph.
    ///
    /// # Errors
    /// `ConfigurationError` for duplicate/undefined/unreachable stages, bad
    /// limits, or a cycle through a stage that is not `allow_revisit`.
    pub fn new(
        entry: impl Into<StageName>,
        definitions: Vec<StageDefinition>,
    ) -> Result<Self, ConfigurationError> {
        let entry = entry.into();
        if definitions.is_empty() {
            return Err(ConfigurationError::EmptyGraph);
        }

        let mut stages = HashMap::with_capacity(definitions.len());
        let mut order = Vec::with_capacity(definitions.len());
        for def in definitions {
            if stages.contains_key(&def.name) {
                return Err(ConfigurationError::DuplicateStage(def.name));
            }
            order.push(def.name.clone());
            stages.insert(def.name.clone(), def);
        }

        let graph = Self {
            entry,
            stages,
            order,
        };
        validate::validate(&graph)?;
        Ok(graph)
    }

    pub fn entry_stage(&self) -> &StageName {
        &self.entry
    }

    pub fn stage(&self, name: &StageName) -> Option<&StageDefinition> {
        self.stages.get(name)
    }

    pub fn contains(&self, name: &StageName) -> bool {
        self.stages.contains_key(name)
    }

    /// Stage definitions in declaration order.
    pub fn stages(&self) -> impl Iterator<Item = &StageDefinition> {
        self.order.iter().filter_map(|name| self.stages.get(name))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Next step for `stage` given a finished attempt's outcome.
    /// `None` only for a stage that is not part of the graph.
    pub fn resolve(&self, stage: &StageName, outcome: StageOutcome) -> Option<Resolution> {
        let def = self.stages.get(stage)?;
        let resolution = match outcome {
            StageOutcome::Done => match &def.next_on_success {
                SuccessRoute::Stage(next) => Resolution::Next(next.clone()),
                SuccessRoute::Terminal => Resolution::Complete,
            },
            StageOutcome::Failed => match &def.next_on_failure {
                FailureRoute::Stage(next) => Resolution::Next(next.clone()),
                FailureRoute::RetrySame => Resolution::RetrySame,
                FailureRoute::Terminal => Resolution::Fail,
            },
        };
        Some(resolution)
    }

    pub fn topic_for(&self, stage: &StageName) -> Option<&str> {
        self.stages.get(stage).map(|d| d.target_topic.as_str())
    }

    pub fn timeout_for(&self, stage: &StageName) -> Option<Duration> {
        self.stages.get(stage).map(|d| d.timeout)
    }

    pub fn max_attempts_for(&self, stage: &StageName) -> Option<u32> {
        self.stages.get(stage).map(|d| d.max_attempts)
    }

    /// Every agent topic referenced by the graph.
    pub fn topics(&self) -> BTreeSet<&str> {
        self.stages
            .values()
            .map(|d| d.target_topic.as_str())
            .collect()
    }

    /// Stages on the plain success path, starting at the entry stage.
    pub fn success_path(&self) -> Vec<&StageName> {
        let mut path = Vec::new();
        let mut current = Some(&self.entry);
        while let Some(name) = current {
            if path.contains(&name) {
                break;
            }
            path.push(name);
            current = self.stages.get(name).and_then(|d| d.next_on_success.stage());
        }
        path
    }
}
