//! Event workers - 受信イベントを並行に処理するワーカー群
//!
//! 全ワーカーが 1 つの購読（orchestrator トピック）を共有し、受信だけを
//! 直列化します。受信後の処理（Engine::handle_event）は並行に走ります。
//! 同一タスクへの競合は TaskStore の CAS と dedup ledger だけで解決します。

use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use super::engine::Engine;
use crate::domain::events::StageEvent;
use crate::ports::{Subscription, WireCodec};

/// Worker group handle.
/// - `request_shutdown()` で新しいイベントの受信を止める
/// - `shutdown_and_join()` で処理中のイベントが終わるまで待つ
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers reading from `inbox`.
    pub fn spawn(n: usize, inbox: Subscription, engine: Arc<Engine>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inbox = Arc::new(Mutex::new(inbox));

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let inbox = Arc::clone(&inbox);
            let engine = Arc::clone(&engine);
            let mut rx = shutdown_rx.clone();

            joins.push(tokio::spawn(async move {
                worker_loop(worker_id, inbox, engine, &mut rx).await;
            }));
        }

        Self { shutdown_tx, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Stop taking new events. Handlers already running are not cancelled.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for join in self.joins {
            let _ = join.await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    inbox: Arc<Mutex<Subscription>>,
    engine: Arc<Engine>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        // the inbox lock is only held while waiting for the next message
        let message = tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            message = async { inbox.lock().await.recv().await } => message,
        };

        let Some(bytes) = message else {
            tracing::info!(worker_id, "event subscription closed, worker exiting");
            break;
        };

        let event: StageEvent = match WireCodec::decode(&bytes) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(worker_id, error = %e, "undecodable event dropped");
                continue;
            }
        };

        match engine.handle_event(&event).await {
            Ok(disposition) => {
                tracing::debug!(worker_id, event_id = %event.event_id, ?disposition, "event handled");
            }
            Err(e) => {
                // already logged by the engine; the worker keeps serving other tasks
                tracing::debug!(worker_id, event_id = %event.event_id, error = %e, "event not applied");
            }
        }
    }
    tracing::debug!(worker_id, "worker stopped");
}
