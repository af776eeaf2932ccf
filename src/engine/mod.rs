//! Execution machinery: condition evaluation, action dispatch, the
//! per-instance scheduler, the engine facade, the execution log, and
//! outbound notifications.

pub mod actions;
pub mod evaluator;
pub mod executor;
pub mod instance;
pub mod journal;
pub mod notify;
pub(crate) mod scheduler;

pub use actions::{ActionError, ActionHandler, ActionRegistry, InMemoryActionRegistry};
pub use evaluator::{evaluate, EvalWarning, Evaluation};
pub use executor::{EngineError, WorkflowEngine};
pub use instance::{
    ApprovalResponse, BranchRef, ExecutionInstance, ExecutionStatus, FrontierEntry, InstanceId,
    JoinBarrier, WaitState,
};
pub use journal::{ExecutionLog, LogEntry, LogLevel};
pub use notify::{ChannelHook, EngineNotification, NotificationHook};
