//! InMemoryChannel - 開発・テスト用の pub/sub
//!
//! # 実装詳細
//! - トピックごとに購読者（mpsc Sender）のリストを持つ
//! - publish は全購読者へコピーを送る（fan-out）
//! - 購読者のいないトピックへの publish は捨てる
//! - `drop_next` でメッセージ消失を再現できる（タイムアウト経路のテスト用）

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::domain::errors::ChannelError;
use crate::ports::{Channel, Subscription};

#[derive(Default)]
struct ChannelState {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
    /// Messages still to be swallowed per topic.
    drops: HashMap<String, usize>,
}

#[derive(Default)]
pub struct InMemoryChannel {
    state: Mutex<ChannelState>,
    closed: AtomicBool,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Silently lose the next `count` messages published to `topic`.
    pub async fn drop_next(&self, topic: &str, count: usize) {
        let mut state = self.state.lock().await;
        *state.drops.entry(topic.to_string()).or_default() += count;
    }

    /// Close the channel: every subscription ends and publishes fail.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.state.lock().await.subscribers.clear();
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        let state = self.state.lock().await;
        state
            .subscribers
            .get(topic)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Channel for InMemoryChannel {
    async fn publish(&self, topic: &str, message: Vec<u8>) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed(topic.to_string()));
        }

        let mut state = self.state.lock().await;
        if let Some(remaining) = state.drops.get_mut(topic)
            && *remaining > 0
        {
            *remaining -= 1;
            tracing::debug!(topic, "in-memory channel dropped message");
            return Ok(());
        }

        let Some(subs) = state.subscribers.get_mut(topic) else {
            tracing::trace!(topic, "no subscriber, message discarded");
            return Ok(());
        };
        subs.retain(|tx| tx.send(message.clone()).is_ok());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, ChannelError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelError::Closed(topic.to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        state
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(Subscription::new(topic, rx))
    }
}
