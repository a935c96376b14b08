//! Task record: the unit of work tracked through the pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TaskId;
use super::stage::StageName;

const MAX_SUBJECT_LEN: usize = 128;

/// External identifier of whoever the task is about (e.g. an end-user).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

/// Rejection reason for a malformed subject identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubjectIdError {
    #[error("subject id must not be empty")]
    Empty,
    #[error("subject id exceeds 128 characters")]
    TooLong,
    #[error("subject id contains whitespace or control characters")]
    InvalidCharacter,
}

impl SubjectId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, SubjectIdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(SubjectIdError::Empty);
        }
        if raw.chars().count() > MAX_SUBJECT_LEN {
            return Err(SubjectIdError::TooLong);
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(SubjectIdError::InvalidCharacter);
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Task status.
///
/// State transitions:
/// - Pending -> InProgress -> Completed
/// - Pending -> InProgress -> Failed
/// - InProgress -> InProgress (next stage, or same-stage retry)
/// - Pending -> Completed / Failed (single-stage pipelines)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created; no event for the task has been handled yet.
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Is this a terminal status (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of one finished stage attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Done,
    Failed,
}

/// Why a stage attempt (or the whole task) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The agent emitted a `failed` event.
    AgentFailure,
    /// No `done`/`failed` arrived within the stage timeout.
    TimeoutExceeded,
    /// The failure route pointed at a stage with no attempts left.
    MaxAttemptsExhausted,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureCause::AgentFailure => "agent_failure",
            FailureCause::TimeoutExceeded => "timeout_exceeded",
            FailureCause::MaxAttemptsExhausted => "max_attempts_exhausted",
        };
        f.write_str(s)
    }
}

/// One append-only entry of `stage_history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: StageName,
    pub outcome: StageOutcome,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<FailureCause>,

    /// Agent-provided failure detail, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// 1-based attempt number this entry closes.
    pub attempt: u32,

    pub at: DateTime<Utc>,
}

/// Terminal failure summary exposed to status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub stage: StageName,
    pub cause: FailureCause,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The task record.
///
/// Design:
/// - The Task Store holds these; only the engine mutates them, and only through
///   `TaskStore::compare_and_update`.
/// - `version` is bumped by the store on every successful mutation.
/// - `dispatch_version` is the version at which the current stage-start was
///   sent; timeout watchers are keyed to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub subject_id: SubjectId,
    pub current_stage: StageName,
    pub status: TaskStatus,
    pub stage_history: Vec<StageRecord>,

    /// Failed attempts per stage (agent failures and timeouts).
    #[serde(default)]
    pub attempts: BTreeMap<StageName, u32>,

    pub version: u64,
    pub dispatch_version: u64,

    /// Payload handed to the current stage-start.
    #[serde(default)]
    pub payload: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        task_id: TaskId,
        subject_id: SubjectId,
        entry: StageName,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            subject_id,
            current_stage: entry,
            status: TaskStatus::Pending,
            stage_history: Vec::new(),
            attempts: BTreeMap::new(),
            version: 0,
            dispatch_version: 0,
            payload,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Failed attempts recorded for `stage` so far.
    pub fn attempt_count(&self, stage: &StageName) -> u32 {
        self.attempts.get(stage).copied().unwrap_or(0)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Has `stage` been recorded as done at least once?
    pub fn has_completed(&self, stage: &StageName) -> bool {
        self.stage_history
            .iter()
            .any(|r| &r.stage == stage && r.outcome == StageOutcome::Done)
    }

    /// Number of the attempt currently running for `current_stage` (1-based).
    pub fn current_attempt(&self) -> u32 {
        self.attempt_count(&self.current_stage) + 1
    }
}
