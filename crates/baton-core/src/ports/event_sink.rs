//! EventSink port - ドメインイベント記録の抽象化
//!
//! # 実装
//! - `TracingEventSink`: tracing に構造化ログとして出す（デフォルト）
//! - `MemoryEventSink`: テスト用に蓄積する

use crate::domain::events::DomainEvent;

/// EventSink はドメインイベントを記録
///
/// 記録は fire-and-forget。失敗してもタスク処理には影響させない。
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}
