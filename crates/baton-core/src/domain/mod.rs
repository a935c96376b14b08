//! Domain model (ids, stages, task record, events, decisions, errors).

pub mod decision;
pub mod errors;
pub mod events;
pub mod ids;
pub mod stage;
pub mod task;

pub use decision::{Decision, Trigger, decide};
pub use errors::{
    ChannelError, ConfigurationError, EngineError, ErrorKind, IntakeError, StoreError,
};
pub use events::{DomainEvent, EventOutcome, StageEvent, StageStart};
pub use ids::{EventId, TaskId};
pub use stage::{FailureRoute, StageName, SuccessRoute};
pub use task::{
    FailureCause, StageOutcome, StageRecord, SubjectId, SubjectIdError, Task, TaskFailure,
    TaskStatus,
};
