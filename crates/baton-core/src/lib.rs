//! baton-core
//!
//! Core building blocks for the Baton stage orchestrator: tasks are driven
//! through a fixed graph of stages by independent agents that talk to the
//! engine only through a publish/subscribe channel.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, stage, task, events, decision, errors）
//! - **graph**: Stage Graph（定義・TOML 設定・起動時検証）
//! - **ports**: 抽象化レイヤー（TaskStore, Channel, EventSink, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryChannel, InMemoryTaskStore, FileTaskStore, EventSink）
//! - **app**: アプリケーションロジック（engine, timeout, worker_loop, intake, builder など）
//! - **config**: `baton.toml` の読み込み

pub mod app;
pub mod config;
pub mod domain;
pub mod graph;
pub mod impls;
pub mod ports;

pub use app::{Orchestrator, OrchestratorBuilder};
pub use config::BatonConfig;
pub use graph::{StageDefinition, StageGraph};
