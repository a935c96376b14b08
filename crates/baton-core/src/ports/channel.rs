//! Channel port - publish/subscribe トランスポートの抽象化
//!
//! # 前提
//! - at-least-once 配送（重複あり）
//! - トピックを跨いだ順序保証なし
//! - 購読者がいないトピックへの publish は捨てられる（Redis pub/sub と同じ）
//!
//! メッセージはバイト列で流し、型付きの変換は `WireCodec` が担います。

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::domain::errors::ChannelError;

/// A stream of raw messages for one topic.
///
/// Backends pump whatever their transport delivers into the inner queue,
/// so consumers only ever see this type.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message, or `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// A message that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
pub trait Channel: Send + Sync {
    async fn publish(&self, topic: &str, message: Vec<u8>) -> Result<(), ChannelError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, ChannelError>;
}

/// JSON wire format for everything that crosses a channel.
pub struct WireCodec;

impl WireCodec {
    pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ChannelError> {
        serde_json::to_vec(message).map_err(|e| ChannelError::Codec(format!("encode: {e}")))
    }

    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ChannelError> {
        serde_json::from_slice(bytes).map_err(|e| ChannelError::Codec(format!("decode: {e}")))
    }
}

/// Encode and publish in one step.
pub async fn publish_json<T: Serialize + Sync>(
    channel: &dyn Channel,
    topic: &str,
    message: &T,
) -> Result<(), ChannelError> {
    let bytes = WireCodec::encode(message)?;
    channel.publish(topic, bytes).await
}
