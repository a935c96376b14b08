//! App - アプリケーション層
//!
//! ports を組み合わせてオーケストレーションを実装します。
//!
//! # 主要コンポーネント
//! - **Engine**: ステージイベント・タイムアウトを受けてタスクを進める
//! - **TimeoutScheduler / timeout loop**: ステージ応答待ちの期限
//! - **WorkerGroup**: 受信イベントを並行処理するワーカー群
//! - **GC loop**: dedup ledger の掃除
//! - **Intake**: タスク投入
//! - **Status**: 読み取り専用の状態照会
//! - **Agent / AgentRunner**: エージェント側の契約と実行ランタイム
//! - **OrchestratorBuilder / Orchestrator**: ワイヤリングと起動・停止

pub mod agent;
pub mod builder;
pub mod engine;
pub mod gc_loop;
pub mod intake;
pub mod status;
pub mod timeout;
pub mod worker_loop;

pub use self::agent::{Agent, AgentError, AgentRegistry, AgentRunner, RegistryError};
pub use self::builder::{BuildError, Orchestrator, OrchestratorBuilder, StartError};
pub use self::engine::{DiscardReason, Engine, EngineSettings, EventDisposition, Transition};
pub use self::intake::Intake;
pub use self::status::{TaskStatusView, query_status};
pub use self::timeout::{TimeoutScheduler, WatchKey};
pub use self::worker_loop::WorkerGroup;
