//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」を定義します。エンジンはこれらの trait
//! だけに依存し、ストアやトランスポートの実装は `impls` で差し替えます。
//!
//! # 設計原則
//! - TaskStore が source of truth（正本）
//! - Channel は at-least-once の pub/sub（重複・順不同を前提にする）

pub mod channel;
pub mod clock;
pub mod event_sink;
pub mod id_generator;
pub mod task_store;

pub use self::channel::{Channel, Subscription, WireCodec, publish_json};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::EventSink;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{Mutation, StatusCounts, TaskStore};
