//! Status - タスク状態の読み取り専用ビュー
//!
//! TaskStore から直接読みます。失敗したタスクは終端原因を含みます。

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::errors::StoreError;
use crate::domain::ids::TaskId;
use crate::domain::stage::StageName;
use crate::domain::task::{StageRecord, SubjectId, Task, TaskFailure, TaskStatus};
use crate::ports::TaskStore;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusView {
    pub task_id: TaskId,
    pub subject_id: SubjectId,
    pub status: TaskStatus,
    pub current_stage: StageName,
    pub stage_history: Vec<StageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TaskFailure>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Task> for TaskStatusView {
    fn from(task: Task) -> Self {
        Self {
            task_id: task.task_id,
            subject_id: task.subject_id,
            status: task.status,
            current_stage: task.current_stage,
            stage_history: task.stage_history,
            failure: task.failure,
            version: task.version,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

pub async fn query_status(
    store: &dyn TaskStore,
    task_id: TaskId,
) -> Result<TaskStatusView, StoreError> {
    store.get(task_id).await.map(TaskStatusView::from)
}
