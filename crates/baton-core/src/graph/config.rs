//! Serialisable pipeline description (the `[pipeline]` table of `baton.toml`).
//!
//! Routes are plain strings in the file: a stage name, `"terminal"`, or (for
//! failures only) `"retry-same"`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{StageDefinition, StageGraph};
use crate::domain::errors::ConfigurationError;
use crate::domain::stage::{FailureRoute, StageName, SuccessRoute, TERMINAL};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub entry: String,

    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    pub topic: String,

    #[serde(default = "default_route")]
    pub on_success: String,

    #[serde(default = "default_route")]
    pub on_failure: String,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub allow_revisit: bool,
}

fn default_route() -> String {
    TERMINAL.to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl StageConfig {
    fn to_definition(&self) -> Result<StageDefinition, ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidStage {
            stage: StageName::new(self.name.clone()),
            reason,
        };

        let on_success: SuccessRoute = self
            .on_success
            .parse()
            .map_err(|e| invalid(format!("on_success: {e}")))?;
        let on_failure: FailureRoute = self
            .on_failure
            .parse()
            .map_err(|e| invalid(format!("on_failure: {e}")))?;

        Ok(StageDefinition::new(self.name.as_str(), self.topic.clone())
            .on_success(on_success)
            .on_failure(on_failure)
            .max_attempts(self.max_attempts)
            .timeout(Duration::from_millis(self.timeout_ms))
            .allow_revisit(self.allow_revisit))
    }
}

impl PipelineConfig {
    /// Convert and validate into a `StageGraph`.
    pub fn build(&self) -> Result<StageGraph, ConfigurationError> {
        let definitions = self
            .stages
            .iter()
            .map(StageConfig::to_definition)
            .collect::<Result<Vec<_>, _>>()?;
        StageGraph::new(self.entry.as_str(), definitions)
    }
}
