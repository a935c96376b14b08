//! Events - チャネル上を流れるメッセージとドメインイベント
//!
//! - `StageEvent`: エージェント → オーケストレータ（started / done / failed）
//! - `StageStart`: オーケストレータ → エージェント（ステージ開始指示）
//! - `DomainEvent`: 状態遷移の記録（EventSink へ送る）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{EventId, TaskId};
use super::stage::StageName;
use super::task::{FailureCause, SubjectId};

/// What an inbound event reports about a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Started,
    Done,
    Failed,
}

/// Inbound event emitted by an agent for one stage of one task.
///
/// `event_id` must be unique per publish; redeliveries of the same publish
/// keep the same `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub event_id: EventId,
    pub task_id: TaskId,
    pub stage: StageName,
    pub outcome: EventOutcome,

    /// Opaque to the engine; a `done` payload is forwarded to the next stage.
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Failure detail for `failed` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageEvent {
    pub fn started(event_id: EventId, task_id: TaskId, stage: StageName) -> Self {
        Self {
            event_id,
            task_id,
            stage,
            outcome: EventOutcome::Started,
            payload: serde_json::Value::Null,
            error: None,
        }
    }

    pub fn done(
        event_id: EventId,
        task_id: TaskId,
        stage: StageName,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id,
            task_id,
            stage,
            outcome: EventOutcome::Done,
            payload,
            error: None,
        }
    }

    pub fn failed(
        event_id: EventId,
        task_id: TaskId,
        stage: StageName,
        error: impl Into<String>,
    ) -> Self {
        Self {
            event_id,
            task_id,
            stage,
            outcome: EventOutcome::Failed,
            payload: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Outbound stage-start sent to the agent topic that owns `stage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStart {
    pub task_id: TaskId,
    pub subject_id: SubjectId,
    pub stage: StageName,

    /// 1-based attempt number of this dispatch.
    pub attempt: u32,

    #[serde(default)]
    pub payload: serde_json::Value,

    pub dispatched_at: DateTime<Utc>,
}

/// DomainEvent は状態遷移ごとに発生するイベント
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    TaskCreated {
        task_id: TaskId,
        subject_id: SubjectId,
        entry: StageName,
    },
    StageDispatched {
        task_id: TaskId,
        stage: StageName,
        attempt: u32,
    },
    StageRetried {
        task_id: TaskId,
        stage: StageName,
        attempt: u32,
        cause: FailureCause,
    },
    StageAdvanced {
        task_id: TaskId,
        from: StageName,
        to: StageName,
    },
    TaskCompleted {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        stage: StageName,
        cause: FailureCause,
    },
}

impl DomainEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            DomainEvent::TaskCreated { task_id, .. }
            | DomainEvent::StageDispatched { task_id, .. }
            | DomainEvent::StageRetried { task_id, .. }
            | DomainEvent::StageAdvanced { task_id, .. }
            | DomainEvent::TaskCompleted { task_id }
            | DomainEvent::TaskFailed { task_id, .. } => *task_id,
        }
    }

    /// Short name used as a log field.
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::TaskCreated { .. } => "task_created",
            DomainEvent::StageDispatched { .. } => "stage_dispatched",
            DomainEvent::StageRetried { .. } => "stage_retried",
            DomainEvent::StageAdvanced { .. } => "stage_advanced",
            DomainEvent::TaskCompleted { .. } => "task_completed",
            DomainEvent::TaskFailed { .. } => "task_failed",
        }
    }
}
