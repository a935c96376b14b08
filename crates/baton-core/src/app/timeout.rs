//! Timeout watchers - ステージ応答待ちの期限管理
//!
//! # 設計
//! - watcher は `(task_id, stage, dispatch_version)` をキーにした単発タイマー
//! - 発火したキーは mpsc で timeout loop に渡し、Engine が判定する
//! - 明示的なキャンセルはしない。古いキーの発火は Engine 側で no-op になる
//! - watcher 自身はロックを持たない（ストアへの再入は timeout loop から）

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;

use super::engine::Engine;
use crate::domain::ids::TaskId;
use crate::domain::stage::StageName;

/// Identity of one dispatch of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchKey {
    pub task_id: TaskId,
    pub stage: StageName,
    /// Task version at which the stage-start was dispatched.
    pub dispatch_version: u64,
}

/// Arms watchers and forwards the ones that fire.
pub struct TimeoutScheduler {
    fired_tx: mpsc::UnboundedSender<WatchKey>,
    watchers: Mutex<JoinSet<()>>,
}

impl TimeoutScheduler {
    /// Create a scheduler and the receiving end of fired keys.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WatchKey>) {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            fired_tx,
            watchers: Mutex::new(JoinSet::new()),
        };
        (scheduler, fired_rx)
    }

    pub async fn arm(&self, key: WatchKey, after: Duration) {
        let tx = self.fired_tx.clone();
        let mut watchers = self.watchers.lock().await;
        while watchers.try_join_next().is_some() {}

        tracing::trace!(task_id = %key.task_id, stage = %key.stage, ?after, "timeout watcher armed");
        watchers.spawn(async move {
            tokio::time::sleep(after).await;
            // receiver gone means the orchestrator is shutting down
            let _ = tx.send(key);
        });
    }

    /// Watchers that have not fired yet.
    pub async fn pending(&self) -> usize {
        let mut watchers = self.watchers.lock().await;
        while watchers.try_join_next().is_some() {}
        watchers.len()
    }

    /// Abort every pending watcher.
    pub async fn cancel_all(&self) {
        let mut watchers = self.watchers.lock().await;
        watchers.abort_all();
        while watchers.join_next().await.is_some() {}
    }
}

/// Feed fired watchers to the engine until shutdown.
pub async fn run_timeout_loop(
    engine: Arc<Engine>,
    mut fired_rx: mpsc::UnboundedReceiver<WatchKey>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let key = tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender dropped counts as shutdown
                if changed.is_err() {
                    break;
                }
                continue;
            }
            key = fired_rx.recv() => key,
        };
        let Some(key) = key else {
            break;
        };

        match engine.handle_timeout(&key).await {
            Ok(disposition) => {
                tracing::debug!(task_id = %key.task_id, stage = %key.stage, ?disposition, "timeout handled");
            }
            Err(e) => {
                tracing::error!(task_id = %key.task_id, stage = %key.stage, error = %e, "timeout handling failed");
            }
        }
    }
    tracing::debug!("timeout loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn key(version: u64) -> WatchKey {
        WatchKey {
            task_id: TaskId::from_ulid(Ulid::new()),
            stage: "kyc".into(),
            dispatch_version: version,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn watcher_fires_after_its_duration() {
        let (scheduler, mut rx) = TimeoutScheduler::new();
        let k = key(3);
        scheduler.arm(k.clone(), Duration::from_secs(5)).await;

        tokio::time::sleep(Duration::from_millis(4_999)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(rx.recv().await, Some(k));
    }

    #[tokio::test(start_paused = true)]
    async fn watchers_fire_in_deadline_order() {
        let (scheduler, mut rx) = TimeoutScheduler::new();
        let late = key(1);
        let early = key(2);
        scheduler.arm(late.clone(), Duration::from_secs(10)).await;
        scheduler.arm(early.clone(), Duration::from_secs(1)).await;

        assert_eq!(rx.recv().await, Some(early));
        assert_eq!(rx.recv().await, Some(late));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_stops_pending_watchers() {
        let (scheduler, mut rx) = TimeoutScheduler::new();
        scheduler.arm(key(0), Duration::from_secs(1)).await;
        assert_eq!(scheduler.pending().await, 1);

        scheduler.cancel_all().await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(scheduler.pending().await, 0);
        assert!(rx.try_recv().is_err());
    }
}
