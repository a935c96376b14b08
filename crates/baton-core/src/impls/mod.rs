//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryChannel**: プロセス内 pub/sub（開発・テスト用）
//! - **InMemoryTaskStore**: プロセス内の正本（テスト用）
//! - **FileTaskStore**: JSON スナップショットによる永続ストア
//! - **TracingEventSink / MemoryEventSink**: ドメインイベントの記録
//!
//! Redis pub/sub や DB ベースのストアは同じ trait を実装すれば差し替えられます。

pub mod event_sink;
pub mod file_store;
pub mod memory_channel;
pub mod memory_store;
mod store_state;

pub use self::event_sink::{MemoryEventSink, TracingEventSink};
pub use self::file_store::FileTaskStore;
pub use self::memory_channel::InMemoryChannel;
pub use self::memory_store::InMemoryTaskStore;
pub use self::store_state::DEFAULT_DEDUP_RETENTION;
