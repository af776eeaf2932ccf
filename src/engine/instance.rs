//! Runtime state of one executing workflow instance.
//!
//! The instance owns everything the scheduler mutates: status, the
//! frontier of active steps, join barriers of open parallel forks,
//! approval responses, retry counters, breakpoints, and the execution
//! log. All of it except the log and the graph reference is captured
//! by checkpoints.

use crate::engine::journal::{ExecutionLog, LogLevel};
use crate::model::graph::StepGraph;
use crate::model::step::{JoinPolicy, StepId, StepTarget};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Identifier of a running instance, derived from the graph id.
pub type InstanceId = String;

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Submitted, not yet started.
    Pending,

    /// Actively scheduling steps.
    Running,

    /// Suspended by the caller, a breakpoint, or a restore.
    Paused,

    /// Terminal: the workflow finished successfully.
    Completed,

    /// Terminal: a step failed with retries exhausted.
    Failed,

    /// Terminal: the proof was rejected.
    Rejected,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Rejected
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Rejected => "rejected",
        };
        write!(f, "{}", name)
    }
}

/// Which parallel branch a frontier entry belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchRef {
    /// Id of the parallel step that forked this branch.
    pub parallel: StepId,

    /// Branch position within the fork, for logs.
    pub index: usize,
}

/// What a frontier entry is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitState {
    /// Eligible for dispatch.
    Ready,

    /// Automation actions currently in flight.
    Dispatching,

    /// Waiting for approval responses.
    Review,

    /// Waiting for an external option choice.
    Decision,

    /// Failed attempt; redispatch after the given delay.
    Retry { delay_ms: u64 },
}

/// One active position in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontierEntry {
    /// Stable identity of this activation, unique within the instance.
    pub entry_id: u64,

    pub step: StepId,

    /// Branch context when the entry lives inside a parallel fork.
    pub branch: Option<BranchRef>,

    pub wait: WaitState,
}

/// One recorded approval or rejection from a review assignee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub assignee: String,
    pub approved: bool,
    pub comment: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Join bookkeeping of one open parallel fork.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinBarrier {
    pub policy: JoinPolicy,

    /// Where execution continues once the join resolves.
    pub next: StepTarget,

    /// Branch context of the parallel step itself, for nested forks.
    pub outer: Option<BranchRef>,

    /// Number of branches forked.
    pub total: usize,

    /// Branches that ran to their terminal target so far.
    pub completed: usize,
}

/// Mutable state of one workflow instance.
pub struct ExecutionInstance {
    pub instance_id: InstanceId,

    /// The immutable definition this instance executes.
    pub graph: Arc<StepGraph>,

    pub status: ExecutionStatus,

    /// Active steps. Owned exclusively by the scheduler; external
    /// operations mutate it only through the engine, under the
    /// instance lock.
    pub frontier: Vec<FrontierEntry>,

    /// Variables visible to condition evaluation and actions.
    pub variables: crate::model::context::VariableContext,

    /// Retries consumed per step for the current activation.
    pub retries_used: HashMap<StepId, u32>,

    /// Responses collected by waiting review steps.
    pub approvals: HashMap<StepId, Vec<ApprovalResponse>>,

    /// Open parallel forks, keyed by the forking step.
    pub joins: HashMap<StepId, JoinBarrier>,

    /// Steps that pause the instance instead of dispatching. One-shot:
    /// a tripped breakpoint is removed.
    pub breakpoints: HashSet<StepId>,

    /// Ids of checkpoints taken for this instance, in creation order.
    pub checkpoint_ids: Vec<String>,

    pub log: ExecutionLog,

    next_entry_id: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionInstance {
    /// Create a fresh instance of a validated graph.
    pub fn new(graph: Arc<StepGraph>) -> Self {
        let now = Utc::now();
        Self {
            instance_id: format!("{}-{}", graph.id, Uuid::new_v4()),
            graph,
            status: ExecutionStatus::Pending,
            frontier: Vec::new(),
            variables: crate::model::context::VariableContext::new(),
            retries_used: HashMap::new(),
            approvals: HashMap::new(),
            joins: HashMap::new(),
            breakpoints: HashSet::new(),
            checkpoint_ids: Vec::new(),
            log: ExecutionLog::new(),
            next_entry_id: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Push a new frontier entry in Ready state and return its id.
    pub fn push_entry(&mut self, step: StepId, branch: Option<BranchRef>) -> u64 {
        let entry_id = self.next_entry_id;
        self.next_entry_id += 1;
        self.frontier.push(FrontierEntry {
            entry_id,
            step,
            branch,
            wait: WaitState::Ready,
        });
        self.touch();
        entry_id
    }

    /// Index of a frontier entry by its id.
    pub fn entry_position(&self, entry_id: u64) -> Option<usize> {
        self.frontier.iter().position(|e| e.entry_id == entry_id)
    }

    /// Counter value used when restoring from a checkpoint.
    pub fn next_entry_id(&self) -> u64 {
        self.next_entry_id
    }

    /// Restore the entry id counter from a checkpoint snapshot.
    pub fn set_next_entry_id(&mut self, next: u64) {
        self.next_entry_id = next;
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn log_info(
        &mut self,
        step: Option<StepId>,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) {
        self.log.append(LogLevel::Info, step, message, details);
        self.touch();
    }

    pub fn log_success(
        &mut self,
        step: Option<StepId>,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) {
        self.log.append(LogLevel::Success, step, message, details);
        self.touch();
    }

    pub fn log_warning(
        &mut self,
        step: Option<StepId>,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) {
        self.log.append(LogLevel::Warning, step, message, details);
        self.touch();
    }

    pub fn log_error(
        &mut self,
        step: Option<StepId>,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) {
        self.log.append(LogLevel::Error, step, message, details);
        self.touch();
    }
}
