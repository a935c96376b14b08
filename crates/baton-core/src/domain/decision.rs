//! Decision model: what happens to a task after something happened to its
//! current stage.
//!
//! `decide` is a pure function of (graph, task, trigger). Applying the
//! decision to the record is a separate step (`Decision::apply`) that runs
//! inside `TaskStore::compare_and_update`, so a decision made on a stale read
//! is never written.

use chrono::{DateTime, Utc};

use super::stage::StageName;
use super::task::{FailureCause, StageOutcome, StageRecord, Task, TaskFailure, TaskStatus};
use crate::graph::{Resolution, StageGraph};

/// What happened to the current stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// The agent reported `done`.
    Done { payload: serde_json::Value },
    /// The agent reported `failed`.
    AgentFailed { detail: Option<String> },
    /// The timeout watcher fired for the current dispatch.
    TimedOut,
}

impl Trigger {
    fn failure_cause(&self) -> Option<FailureCause> {
        match self {
            Trigger::Done { .. } => None,
            Trigger::AgentFailed { .. } => Some(FailureCause::AgentFailure),
            Trigger::TimedOut => Some(FailureCause::TimeoutExceeded),
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            Trigger::AgentFailed { detail } => detail.clone(),
            Trigger::Done { .. } | Trigger::TimedOut => None,
        }
    }
}

/// The next action for a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Move to `to` and dispatch it.
    Advance { to: StageName },

    /// Dispatch the current stage again as attempt number `attempt`.
    Retry { attempt: u32, cause: FailureCause },

    /// The success path ended.
    Complete,

    /// The task is failed (terminal).
    Fail { cause: FailureCause },
}

impl Decision {
    /// Does this decision dispatch a stage-start?
    pub fn dispatches(&self) -> bool {
        matches!(self, Decision::Advance { .. } | Decision::Retry { .. })
    }

    /// Apply the decision to `task` (history, attempts, stage, status).
    ///
    /// `dispatch_version` is set to the version the store will assign on
    /// commit (`version + 1`), so watchers armed after the commit match it.
    pub fn apply(&self, task: &mut Task, trigger: &Trigger, now: DateTime<Utc>) {
        let stage = task.current_stage.clone();

        match trigger.failure_cause() {
            None => {
                task.stage_history.push(StageRecord {
                    stage: stage.clone(),
                    outcome: StageOutcome::Done,
                    cause: None,
                    detail: None,
                    attempt: task.current_attempt(),
                    at: now,
                });
            }
            Some(cause) => {
                let failures = task.attempt_count(&stage) + 1;
                task.attempts.insert(stage.clone(), failures);
                task.stage_history.push(StageRecord {
                    stage: stage.clone(),
                    outcome: StageOutcome::Failed,
                    cause: Some(cause),
                    detail: trigger.detail(),
                    attempt: failures,
                    at: now,
                });
            }
        }

        match self {
            Decision::Advance { to } => {
                if let Trigger::Done { payload } = trigger
                    && !payload.is_null()
                {
                    task.payload = payload.clone();
                }
                task.current_stage = to.clone();
                task.status = TaskStatus::InProgress;
                task.dispatch_version = task.version + 1;
            }
            Decision::Retry { .. } => {
                task.status = TaskStatus::InProgress;
                task.dispatch_version = task.version + 1;
            }
            Decision::Complete => {
                task.status = TaskStatus::Completed;
            }
            Decision::Fail { cause } => {
                let detail = match cause {
                    FailureCause::MaxAttemptsExhausted => Some(format!(
                        "failure route out of '{stage}' leads to a stage with no attempts left"
                    )),
                    _ => trigger.detail(),
                };
                task.status = TaskStatus::Failed;
                task.failure = Some(TaskFailure {
                    stage,
                    cause: *cause,
                    detail,
                });
            }
        }
    }
}

/// Decide the next action for `task` given `trigger` on its current stage.
///
/// Returns `None` if the current stage is not part of `graph` (a task
/// persisted under a different pipeline definition).
///
/// Rules:
/// - done: follow `next_on_success`
/// - agent failure: retry while `next_on_failure = retry-same` and attempts
///   remain, otherwise follow `next_on_failure`
/// - timeout: retry while attempts remain, otherwise follow `next_on_failure`
///   (`retry-same` then means failed)
/// - a failure route into a stage with no attempts left fails the task with
///   `MaxAttemptsExhausted`
pub fn decide(graph: &StageGraph, task: &Task, trigger: &Trigger) -> Option<Decision> {
    let stage = &task.current_stage;
    let max_attempts = graph.max_attempts_for(stage)?;

    let Some(cause) = trigger.failure_cause() else {
        return match graph.resolve(stage, StageOutcome::Done)? {
            Resolution::Next(to) => Some(Decision::Advance { to }),
            Resolution::Complete | Resolution::Fail | Resolution::RetrySame => {
                Some(Decision::Complete)
            }
        };
    };

    let failures = task.attempt_count(stage) + 1;
    let has_attempts_left = failures < max_attempts;
    let resolution = graph.resolve(stage, StageOutcome::Failed)?;

    if has_attempts_left
        && (cause == FailureCause::TimeoutExceeded || resolution == Resolution::RetrySame)
    {
        return Some(Decision::Retry {
            attempt: failures + 1,
            cause,
        });
    }

    let decision = match resolution {
        Resolution::Next(to) => {
            let target_max = graph.max_attempts_for(&to)?;
            if task.attempt_count(&to) >= target_max {
                Decision::Fail {
                    cause: FailureCause::MaxAttemptsExhausted,
                }
            } else {
                Decision::Advance { to }
            }
        }
        Resolution::RetrySame | Resolution::Fail | Resolution::Complete => {
            Decision::Fail { cause }
        }
    };
    Some(decision)
}
