//! File configuration (`baton.toml`).
//!
//! Every table except `[pipeline]` is optional and falls back to defaults.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::engine::DEFAULT_CONFLICT_RETRY_LIMIT;
use crate::domain::errors::{ConfigurationError, ErrorKind, StoreError};
use crate::graph::{PipelineConfig, StageGraph};
use crate::impls::{DEFAULT_DEDUP_RETENTION, FileTaskStore, InMemoryTaskStore};
use crate::ports::{Clock, IdGenerator, TaskStore};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Graph(#[from] ConfigurationError),
}

impl ConfigError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConfigError::Io { .. } => ErrorKind::Infrastructure,
            ConfigError::Parse(_) | ConfigError::Invalid(_) | ConfigError::Graph(_) => {
                ErrorKind::Permanent
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatonConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub store: StoreConfig,

    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Topic agents publish stage events to.
    pub events_topic: String,
    /// Concurrent event handlers.
    pub workers: usize,
    pub conflict_retry_limit: u32,
    pub dedup_retention_secs: u64,
    pub gc_interval_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            events_topic: "orchestrator".to_string(),
            workers: 4,
            conflict_retry_limit: DEFAULT_CONFLICT_RETRY_LIMIT,
            dedup_retention_secs: DEFAULT_DEDUP_RETENTION.as_secs(),
            gc_interval_secs: 60,
        }
    }
}

impl OrchestratorConfig {
    pub fn dedup_retention(&self) -> Duration {
        Duration::from_secs(self.dedup_retention_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.events_topic.trim().is_empty() {
            return Err(ConfigError::Invalid("orchestrator.events_topic must not be empty".into()));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("orchestrator.workers must be > 0".into()));
        }
        if self.dedup_retention_secs == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.dedup_retention_secs must be > 0".into(),
            ));
        }
        if self.gc_interval_secs == 0 {
            return Err(ConfigError::Invalid("orchestrator.gc_interval_secs must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing` filter directive used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Snapshot file for `kind = "file"`.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Memory,
            path: PathBuf::from("baton-state.json"),
        }
    }
}

impl StoreConfig {
    pub async fn open(
        &self,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        retention: Duration,
    ) -> Result<Arc<dyn TaskStore>, StoreError> {
        match self.kind {
            StoreKind::Memory => Ok(Arc::new(
                InMemoryTaskStore::new(clock, ids).with_retention(retention),
            )),
            StoreKind::File => {
                let store =
                    FileTaskStore::open_with_retention(&self.path, clock, ids, retention).await?;
                Ok(Arc::new(store))
            }
        }
    }
}

impl BatonConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.orchestrator.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Build and validate the stage graph.
    pub fn graph(&self) -> Result<StageGraph, ConfigError> {
        Ok(self.pipeline.build()?)
    }
}
