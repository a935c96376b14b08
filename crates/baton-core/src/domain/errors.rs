//! Errors - エラー型と分類
//!
//! 関心ごとに `thiserror` の enum を分け、運用上の分類は `ErrorKind` で表します。
//!
//! - 破棄（重複・未知タスク・古いイベント）はエラーではなく
//!   `EventDisposition::Discarded` として返す
//! - 失敗原因（agent failure / timeout）は `FailureCause` としてタスクに記録する

use thiserror::Error;

use super::ids::TaskId;
use super::stage::StageName;

/// ErrorKind は実行エラーの運用分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: インフラエラー（ストア・トランスポートの障害）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Stage Graph の検証エラー（起動時に fatal）
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("stage graph has no stages")]
    EmptyGraph,

    #[error("stage '{0}' is defined more than once")]
    DuplicateStage(StageName),

    #[error("entry stage '{0}' is not defined")]
    UndefinedEntry(StageName),

    #[error("stage '{from}' routes to undefined stage '{to}'")]
    UndefinedStage { from: StageName, to: StageName },

    #[error("stage '{0}' is unreachable from the entry stage")]
    Unreachable(StageName),

    #[error("cycle not marked as a retry loop: {}", render_path(.0))]
    Cycle(Vec<StageName>),

    #[error("stage '{stage}' is invalid: {reason}")]
    InvalidStage { stage: StageName, reason: String },
}

fn render_path(path: &[StageName]) -> String {
    path.iter()
        .map(StageName::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// TaskStore の操作エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("version conflict on task {task_id}: expected {expected}, found {actual}")]
    VersionConflict {
        task_id: TaskId,
        expected: u64,
        actual: u64,
    },

    #[error("task store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::Permanent,
            StoreError::VersionConflict { .. } => ErrorKind::Transient,
            StoreError::Unavailable(_) => ErrorKind::Infrastructure,
        }
    }
}

/// Channel の操作エラー
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel closed for topic '{0}'")]
    Closed(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("channel unavailable: {0}")]
    Unavailable(String),
}

impl ChannelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChannelError::Codec(_) => ErrorKind::Permanent,
            ChannelError::Closed(_) | ChannelError::Unavailable(_) => ErrorKind::Infrastructure,
        }
    }
}

/// Intake（タスク投入）のエラー。呼び出し元へそのまま返す
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("invalid subject id: {0}")]
    InvalidSubject(#[from] super::task::SubjectIdError),

    #[error("service unavailable: {0}")]
    StoreUnavailable(String),

    /// The task exists and its timeout watcher is armed, so the entry stage
    /// is re-dispatched once the timeout fires.
    #[error("task {task_id} created but the first dispatch failed: {source}")]
    Dispatch {
        task_id: TaskId,
        #[source]
        source: ChannelError,
    },
}

impl IntakeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IntakeError::InvalidSubject(_) => ErrorKind::Permanent,
            IntakeError::StoreUnavailable(_) | IntakeError::Dispatch { .. } => {
                ErrorKind::Infrastructure
            }
        }
    }
}

impl From<StoreError> for IntakeError {
    fn from(err: StoreError) -> Self {
        IntakeError::StoreUnavailable(err.to_string())
    }
}

/// Engine 内部のエラー
///
/// イベント単位のエラーはワーカー内で処理され、他タスクの処理を止めません。
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("gave up on task {task_id} after {attempts} version conflicts")]
    ConflictRetriesExhausted { task_id: TaskId, attempts: u32 },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Store(e) => e.kind(),
            EngineError::Channel(e) => e.kind(),
            EngineError::ConflictRetriesExhausted { .. } => ErrorKind::Transient,
        }
    }
}
