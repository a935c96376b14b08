//! GC loop - dedup ledger の期限切れエントリを定期的に削除
//!
//! `record_event_seen` 自体も期限切れを無視するので、この loop は
//! ledger の肥大化を防ぐためのものです。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::ports::TaskStore;

pub async fn run_gc_loop(
    store: Arc<dyn TaskStore>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                match store.purge_expired_events().await {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "purged expired dedup entries"),
                    Err(e) => tracing::warn!(error = %e, "dedup ledger purge failed"),
                }
            }
        }
    }
    tracing::debug!("gc loop stopped");
}
