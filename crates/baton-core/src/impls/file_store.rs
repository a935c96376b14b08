//! FileTaskStore - JSON スナップショットによる永続ストア
//!
//! # 保証
//! - **Atomicity**: 一時ファイルに書いて rename する（途中状態は見えない）
//! - **Durability**: rename 前に fsync
//! - 書き込みに失敗した変更はメモリ上でもロールバックする
//!
//! 変更のたびに全体を書き出すので、単一プロセス・小規模向けです。

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::store_state::{DEFAULT_DEDUP_RETENTION, Snapshot, StoreState};
use crate::domain::errors::StoreError;
use crate::domain::ids::{EventId, TaskId};
use crate::domain::stage::StageName;
use crate::domain::task::{SubjectId, Task};
use crate::ports::{Clock, IdGenerator, Mutation, StatusCounts, TaskStore};

pub struct FileTaskStore {
    path: PathBuf,
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    retention: Duration,
}

impl FileTaskStore {
    /// Open (or create on first write) the snapshot at `path`.
    ///
    /// # Errors
    /// `StoreError::Unavailable` if the file exists but cannot be read or
    /// parsed.
    pub async fn open(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, StoreError> {
        Self::open_with_retention(path, clock, ids, DEFAULT_DEDUP_RETENTION).await
    }

    pub async fn open_with_retention(
        path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        retention: Duration,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let load_path = path.clone();
        let snapshot = tokio::task::spawn_blocking(move || load_snapshot(&load_path))
            .await
            .map_err(|e| StoreError::Unavailable(format!("load task panicked: {e}")))??;

        let state = StoreState::from_snapshot(snapshot, clock.now(), retention);
        tracing::debug!(path = %path.display(), "opened file task store");
        Ok(Self {
            path,
            state: Mutex::new(state),
            clock,
            ids,
            retention,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the current state. Called with the state lock held so writes
    /// land in mutation order.
    async fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&state.to_snapshot())
            .map_err(|e| StoreError::Unavailable(format!("encode snapshot: {e}")))?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| StoreError::Unavailable(format!("write task panicked: {e}")))?
    }
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> StoreError {
    StoreError::Unavailable(format!("{action} {}: {err}", path.display()))
}

fn load_snapshot(path: &Path) -> Result<Snapshot, StoreError> {
    if !path.exists() {
        return Ok(Snapshot::default());
    }
    let content = fs::read_to_string(path).map_err(|e| io_error("read", path, e))?;
    if content.trim().is_empty() {
        return Ok(Snapshot::default());
    }
    serde_json::from_str(&content)
        .map_err(|e| StoreError::Unavailable(format!("corrupt snapshot {}: {e}", path.display())))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| io_error("create dir", parent, e))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = File::create(&tmp).map_err(|e| io_error("create", &tmp, e))?;
    file.write_all(bytes).map_err(|e| io_error("write", &tmp, e))?;
    file.sync_all().map_err(|e| io_error("sync", &tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| io_error("rename", path, e))
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn create(
        &self,
        subject_id: SubjectId,
        entry: StageName,
        payload: serde_json::Value,
    ) -> Result<Task, StoreError> {
        let task = Task::new(
            self.ids.generate_task_id(),
            subject_id,
            entry,
            payload,
            self.clock.now(),
        );

        let mut state = self.state.lock().await;
        state.insert_new(task.clone());
        if let Err(e) = self.persist(&state).await {
            state.remove(task.task_id);
            return Err(e);
        }
        Ok(task)
    }

    async fn get(&self, task_id: TaskId) -> Result<Task, StoreError> {
        self.state.lock().await.get(task_id)
    }

    async fn compare_and_update(
        &self,
        task_id: TaskId,
        expected_version: u64,
        mutate: Mutation,
    ) -> Result<Task, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let previous = state.get(task_id)?;
        let updated = state.compare_and_update(task_id, expected_version, mutate, now)?;

        if let Err(e) = self.persist(&state).await {
            state.restore(previous);
            return Err(e);
        }
        Ok(updated)
    }

    async fn record_event_seen(&self, event_id: EventId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        if !state.record_event_seen(event_id, now, self.retention) {
            return Ok(false);
        }
        if let Err(e) = self.persist(&state).await {
            state.forget_event(event_id);
            return Err(e);
        }
        Ok(true)
    }

    async fn forget_event(&self, event_id: EventId) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.forget_event(event_id) {
            self.persist(&state).await?;
        }
        Ok(())
    }

    async fn purge_expired_events(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let purged = state.purge_expired_events(now, self.retention);
        if purged > 0 {
            self.persist(&state).await?;
        }
        Ok(purged)
    }

    async fn list_in_flight(&self) -> Result<Vec<Task>, StoreError> {
        Ok(self.state.lock().await.in_flight())
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        Ok(self.state.lock().await.counts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::TaskStatus;
    use crate::ports::{FixedClock, UlidGenerator};
    use tempfile::TempDir;
    use ulid::Ulid;

    async fn open(path: &Path, clock: Arc<FixedClock>) -> FileTaskStore {
        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        FileTaskStore::open_with_retention(path, clock, ids, Duration::from_secs(60))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reopened_store_sees_previous_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));

        let event = EventId::from_ulid(Ulid::new());
        let task_id = {
            let store = open(&path, clock.clone()).await;
            let task = store
                .create(SubjectId::parse("u1").unwrap(), "conversation".into(), serde_json::Value::Null)
                .await
                .unwrap();
            store
                .compare_and_update(task.task_id, 0, Box::new(|t| t.status = TaskStatus::InProgress))
                .await
                .unwrap();
            store.record_event_seen(event).await.unwrap();
            task.task_id
        };

        let store = open(&path, clock).await;
        let task = store.get(task_id).await.unwrap();
        assert_eq!(task.version, 1);
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(!store.record_event_seen(event).await.unwrap());
        assert_eq!(store.list_in_flight().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_file_opens_empty() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let store = open(&dir.path().join("nested/state.json"), clock).await;
        assert_eq!(store.counts_by_status().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn corrupt_file_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, "{ not json").unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(chrono::Utc::now()));
        let ids = Arc::new(UlidGenerator::new(clock.clone()));

        let result = FileTaskStore::open(&path, clock, ids).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn expired_ledger_entries_are_dropped_on_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let event = EventId::from_ulid(Ulid::new());

        open(&path, clock.clone()).await.record_event_seen(event).await.unwrap();
        clock.advance(chrono::Duration::seconds(120));

        let store = open(&path, clock).await;
        assert!(store.record_event_seen(event).await.unwrap());
    }

    #[tokio::test]
    async fn write_leaves_no_temp_file_behind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let clock = Arc::new(FixedClock::new(chrono::Utc::now()));
        let store = open(&path, clock).await;

        store
            .create(SubjectId::parse("u1").unwrap(), "a".into(), serde_json::Value::Null)
            .await
            .unwrap();

        assert!(path.exists());
        assert!(!dir.path().join("state.json.tmp").exists());
    }
}
