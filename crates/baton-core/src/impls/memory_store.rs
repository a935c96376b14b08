//! InMemoryTaskStore - テスト・開発用の正本
//!
//! プロセス内の HashMap にタスクと dedup ledger を保持します。
//! `set_available(false)` でストア障害を再現できます。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::store_state::{DEFAULT_DEDUP_RETENTION, StoreState};
use crate::domain::errors::StoreError;
use crate::domain::ids::{EventId, TaskId};
use crate::domain::stage::StageName;
use crate::domain::task::{SubjectId, Task};
use crate::ports::{Clock, IdGenerator, Mutation, StatusCounts, SystemClock, TaskStore, UlidGenerator};

pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    retention: Duration,
    available: AtomicBool,
}

impl InMemoryTaskStore {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            clock,
            ids,
            retention: DEFAULT_DEDUP_RETENTION,
            available: AtomicBool::new(true),
        }
    }

    /// How long a recorded event id suppresses redeliveries.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Simulate an outage: while unavailable every call fails with
    /// `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live dedup ledger entries.
    pub async fn ledger_len(&self) -> usize {
        self.state.lock().await.ledger_len()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store marked unavailable".into()))
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Self::new(clock, ids)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(
        &self,
        subject_id: SubjectId,
        entry: StageName,
        payload: serde_json::Value,
    ) -> Result<Task, StoreError> {
        self.check_available()?;
        let task = Task::new(
            self.ids.generate_task_id(),
            subject_id,
            entry,
            payload,
            self.clock.now(),
        );
        self.state.lock().await.insert_new(task.clone());
        Ok(task)
    }

    async fn get(&self, task_id: TaskId) -> Result<Task, StoreError> {
        self.check_available()?;
        self.state.lock().await.get(task_id)
    }

    async fn compare_and_update(
        &self,
        task_id: TaskId,
        expected_version: u64,
        mutate: Mutation,
    ) -> Result<Task, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        self.state
            .lock()
            .await
            .compare_and_update(task_id, expected_version, mutate, now)
    }

    async fn record_event_seen(&self, event_id: EventId) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(self
            .state
            .lock()
            .await
            .record_event_seen(event_id, now, self.retention))
    }

    async fn forget_event(&self, event_id: EventId) -> Result<(), StoreError> {
        self.check_available()?;
        self.state.lock().await.forget_event(event_id);
        Ok(())
    }

    async fn purge_expired_events(&self) -> Result<usize, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(self
            .state
            .lock()
            .await
            .purge_expired_events(now, self.retention))
    }

    async fn list_in_flight(&self) -> Result<Vec<Task>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.in_flight())
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.counts())
    }
}
