//! EventSink の実装
//!
//! - **TracingEventSink**: 本番用。ドメインイベントを構造化ログとして出す
//! - **MemoryEventSink**: テスト用。発生順に蓄積する

use std::sync::Mutex;

use crate::domain::events::DomainEvent;
use crate::ports::EventSink;

#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: DomainEvent) {
        let task_id = event.task_id();
        let name = event.name();
        match &event {
            DomainEvent::TaskCreated {
                subject_id, entry, ..
            } => {
                tracing::info!(event = name, %task_id, %subject_id, stage = %entry, "task created");
            }
            DomainEvent::StageDispatched { stage, attempt, .. } => {
                tracing::info!(event = name, %task_id, %stage, attempt, "stage dispatched");
            }
            DomainEvent::StageRetried {
                stage,
                attempt,
                cause,
                ..
            } => {
                tracing::warn!(event = name, %task_id, %stage, attempt, %cause, "stage retried");
            }
            DomainEvent::StageAdvanced { from, to, .. } => {
                tracing::info!(event = name, %task_id, %from, %to, "stage advanced");
            }
            DomainEvent::TaskCompleted { .. } => {
                tracing::info!(event = name, %task_id, "task completed");
            }
            DomainEvent::TaskFailed { stage, cause, .. } => {
                tracing::warn!(event = name, %task_id, %stage, %cause, "task failed");
            }
        }
    }
}

/// Records every event in order.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Event names, handy for asserting on a sequence.
    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(DomainEvent::name).collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: DomainEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}
