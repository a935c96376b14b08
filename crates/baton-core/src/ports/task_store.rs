//! TaskStore port - タスク状態の正本（source of truth）
//!
//! TaskStore は以下を管理します：
//! - タスクレコード（状態・ステージ履歴・試行回数・version）
//! - dedup ledger（処理済み event_id と保持期限）
//!
//! # 設計原則
//! - 変更経路は `compare_and_update` のみ（version による楽観的排他）
//! - 各操作はアトミック
//! - 永続化実装はプロセス再起動を跨いで状態を保持する

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::errors::StoreError;
use crate::domain::ids::{EventId, TaskId};
use crate::domain::stage::StageName;
use crate::domain::task::{SubjectId, Task, TaskStatus};

/// Mutation applied by `compare_and_update`.
///
/// The store bumps `version` and `updated_at` after the closure runs; the
/// closure must not touch them.
pub type Mutation = Box<dyn FnOnce(&mut Task) + Send>;

/// Number of tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed
    }
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Allocate a new task at `entry`, status `pending`, version 0.
    async fn create(
        &self,
        subject_id: SubjectId,
        entry: StageName,
        payload: serde_json::Value,
    ) -> Result<Task, StoreError>;

    async fn get(&self, task_id: TaskId) -> Result<Task, StoreError>;

    /// Apply `mutate` only if the stored version equals `expected_version`.
    ///
    /// # Errors
    /// - `VersionConflict` if the task changed since it was read; the caller
    ///   re-reads and re-runs its decision logic.
    /// - `NotFound` for an unknown task.
    async fn compare_and_update(
        &self,
        task_id: TaskId,
        expected_version: u64,
        mutate: Mutation,
    ) -> Result<Task, StoreError>;

    /// Returns `false` if `event_id` was already recorded and has not expired;
    /// otherwise records it and returns `true`.
    async fn record_event_seen(&self, event_id: EventId) -> Result<bool, StoreError>;

    /// Remove a ledger entry so a redelivery of the event is processed again.
    async fn forget_event(&self, event_id: EventId) -> Result<(), StoreError>;

    /// Drop ledger entries older than the retention window; returns how many.
    async fn purge_expired_events(&self) -> Result<usize, StoreError>;

    /// All tasks that are not terminal.
    async fn list_in_flight(&self) -> Result<Vec<Task>, StoreError>;

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError>;
}
