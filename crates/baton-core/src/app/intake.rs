//! Intake - タスク投入
//!
//! subject_id を検証してタスクを作成し、entry ステージの stage-start を
//! publish して task_id を返します。

use std::sync::Arc;

use super::engine::Engine;
use crate::domain::errors::IntakeError;
use crate::domain::events::DomainEvent;
use crate::domain::ids::TaskId;
use crate::domain::task::SubjectId;

#[derive(Clone)]
pub struct Intake {
    engine: Arc<Engine>,
}

impl Intake {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Submit a task whose first payload is `{"user_id": <subject>}`.
    pub async fn submit(&self, subject_id: &str) -> Result<TaskId, IntakeError> {
        let payload = serde_json::json!({ "user_id": subject_id });
        self.submit_with_payload(subject_id, payload).await
    }

    /// # Errors
    /// - `InvalidSubject`: nothing was created
    /// - `StoreUnavailable`: nothing was created
    /// - `Dispatch`: the task exists and is re-dispatched by its watcher
    pub async fn submit_with_payload(
        &self,
        subject_id: &str,
        payload: serde_json::Value,
    ) -> Result<TaskId, IntakeError> {
        let subject = SubjectId::parse(subject_id).inspect_err(|e| {
            tracing::debug!(error = %e, "rejected malformed subject id");
        })?;

        let entry = self.engine.graph().entry_stage().clone();
        let task = self
            .engine
            .store()
            .create(subject.clone(), entry.clone(), payload)
            .await
            .inspect_err(|e| tracing::error!(%subject, error = %e, "task creation failed"))?;

        self.engine.emit(DomainEvent::TaskCreated {
            task_id: task.task_id,
            subject_id: subject,
            entry,
        });

        self.engine
            .dispatch(&task)
            .await
            .map_err(|source| IntakeError::Dispatch {
                task_id: task.task_id,
                source,
            })?;
        Ok(task.task_id)
    }
}
