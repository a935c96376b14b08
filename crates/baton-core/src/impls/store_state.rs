//! Task Store の共有ステート（InMemory / File の両実装で使う）
//!
//! ロックは呼び出し側（各ストア実装）が持ち、ここは同期的な操作だけを提供します。

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::StoreError;
use crate::domain::ids::{EventId, TaskId};
use crate::domain::task::Task;
use crate::ports::{Mutation, StatusCounts};

/// Ledger entries are kept for a day unless configured otherwise.
pub const DEFAULT_DEDUP_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Default)]
pub(crate) struct StoreState {
    tasks: HashMap<TaskId, Task>,
    seen: HashMap<EventId, DateTime<Utc>>,
}

/// On-disk form of `StoreState`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    #[serde(default)]
    tasks: Vec<Task>,
    #[serde(default)]
    seen_events: Vec<SeenEvent>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SeenEvent {
    event_id: EventId,
    seen_at: DateTime<Utc>,
}

fn expired(seen_at: DateTime<Utc>, now: DateTime<Utc>, retention: Duration) -> bool {
    // A clock that moved backwards yields a negative age: never expired.
    (now - seen_at)
        .to_std()
        .map(|age| age >= retention)
        .unwrap_or(false)
}

impl StoreState {
    pub(crate) fn insert_new(&mut self, task: Task) {
        self.tasks.insert(task.task_id, task);
    }

    pub(crate) fn get(&self, task_id: TaskId) -> Result<Task, StoreError> {
        self.tasks
            .get(&task_id)
            .cloned()
            .ok_or(StoreError::NotFound(task_id))
    }

    pub(crate) fn remove(&mut self, task_id: TaskId) {
        self.tasks.remove(&task_id);
    }

    /// Replace a task wholesale (rollback after a failed persist).
    pub(crate) fn restore(&mut self, task: Task) {
        self.tasks.insert(task.task_id, task);
    }

    pub(crate) fn compare_and_update(
        &mut self,
        task_id: TaskId,
        expected_version: u64,
        mutate: Mutation,
        now: DateTime<Utc>,
    ) -> Result<Task, StoreError> {
        let current = self
            .tasks
            .get(&task_id)
            .ok_or(StoreError::NotFound(task_id))?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                task_id,
                expected: expected_version,
                actual: current.version,
            });
        }

        let mut next = current.clone();
        mutate(&mut next);
        // identity and bookkeeping stay under store control
        next.task_id = task_id;
        next.created_at = current.created_at;
        next.version = expected_version + 1;
        next.updated_at = now;

        self.tasks.insert(task_id, next.clone());
        Ok(next)
    }

    pub(crate) fn record_event_seen(
        &mut self,
        event_id: EventId,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> bool {
        match self.seen.get(&event_id) {
            Some(seen_at) if !expired(*seen_at, now, retention) => false,
            _ => {
                self.seen.insert(event_id, now);
                true
            }
        }
    }

    pub(crate) fn forget_event(&mut self, event_id: EventId) -> bool {
        self.seen.remove(&event_id).is_some()
    }

    pub(crate) fn purge_expired_events(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let before = self.seen.len();
        self.seen
            .retain(|_, seen_at| !expired(*seen_at, now, retention));
        before - self.seen.len()
    }

    /// Non-terminal tasks, oldest first.
    pub(crate) fn in_flight(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .values()
            .filter(|t| !t.is_terminal())
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.task_id));
        tasks
    }

    pub(crate) fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in self.tasks.values() {
            counts.add(task.status);
        }
        counts
    }

    pub(crate) fn ledger_len(&self) -> usize {
        self.seen.len()
    }

    pub(crate) fn to_snapshot(&self) -> Snapshot {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.task_id);
        let mut seen_events: Vec<SeenEvent> = self
            .seen
            .iter()
            .map(|(event_id, seen_at)| SeenEvent {
                event_id: *event_id,
                seen_at: *seen_at,
            })
            .collect();
        seen_events.sort_by_key(|e| e.event_id);
        Snapshot { tasks, seen_events }
    }

    /// Rebuild from disk, dropping ledger entries that already expired.
    pub(crate) fn from_snapshot(
        snapshot: Snapshot,
        now: DateTime<Utc>,
        retention: Duration,
    ) -> Self {
        let tasks = snapshot
            .tasks
            .into_iter()
            .map(|t| (t.task_id, t))
            .collect();
        let seen = snapshot
            .seen_events
            .into_iter()
            .filter(|e| !expired(e.seen_at, now, retention))
            .map(|e| (e.event_id, e.seen_at))
            .collect();
        Self { tasks, seen }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::stage::StageName;
    use crate::domain::task::{SubjectId, TaskStatus};
    use ulid::Ulid;

    fn task(now: DateTime<Utc>) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            SubjectId::parse("u1").unwrap(),
            StageName::new("conversation"),
            serde_json::Value::Null,
            now,
        )
    }

    #[test]
    fn cas_keeps_identity_even_if_mutation_tampers() {
        let now = Utc::now();
        let mut state = StoreState::default();
        let t = task(now);
        let id = t.task_id;
        state.insert_new(t);

        let updated = state
            .compare_and_update(
                id,
                0,
                Box::new(|t| {
                    t.version = 99;
                    t.task_id = TaskId::from_ulid(Ulid::new());
                    t.status = TaskStatus::InProgress;
                }),
                now,
            )
            .unwrap();

        assert_eq!(updated.task_id, id);
        assert_eq!(updated.version, 1);
        assert_eq!(updated.status, TaskStatus::InProgress);
    }

    #[test]
    fn ledger_entry_expires_after_retention() {
        let now = Utc::now();
        let retention = Duration::from_secs(60);
        let mut state = StoreState::default();
        let event = EventId::from_ulid(Ulid::new());

        assert!(state.record_event_seen(event, now, retention));
        assert!(!state.record_event_seen(event, now + chrono::Duration::seconds(59), retention));
        assert!(state.record_event_seen(event, now + chrono::Duration::seconds(61), retention));
    }

    #[test]
    fn purge_drops_only_expired_entries() {
        let now = Utc::now();
        let retention = Duration::from_secs(60);
        let mut state = StoreState::default();
        state.record_event_seen(EventId::from_ulid(Ulid::new()), now, retention);
        state.record_event_seen(
            EventId::from_ulid(Ulid::new()),
            now + chrono::Duration::seconds(30),
            retention,
        );

        let purged = state.purge_expired_events(now + chrono::Duration::seconds(70), retention);

        assert_eq!(purged, 1);
        assert_eq!(state.ledger_len(), 1);
    }

    #[test]
    fn snapshot_restores_tasks_and_live_ledger() {
        let now = Utc::now();
        let retention = Duration::from_secs(60);
        let mut state = StoreState::default();
        let t = task(now);
        let id = t.task_id;
        state.insert_new(t);
        state.record_event_seen(EventId::from_ulid(Ulid::new()), now, retention);

        let json = serde_json::to_string(&state.to_snapshot()).unwrap();
        let snapshot: Snapshot = serde_json::from_str(&json).unwrap();

        let live = StoreState::from_snapshot(snapshot, now, retention);
        assert!(live.get(id).is_ok());
        assert_eq!(live.ledger_len(), 1);

        let snapshot: Snapshot = serde_json::from_str(&json).unwrap();
        let later =
            StoreState::from_snapshot(snapshot, now + chrono::Duration::seconds(120), retention);
        assert_eq!(later.ledger_len(), 0);
    }
}
