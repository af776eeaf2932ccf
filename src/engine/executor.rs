//! The workflow engine facade.
//!
//! [`WorkflowEngine`] owns every running instance and is the only way
//! callers interact with one: lifecycle control, approval and decision
//! delivery, variable updates, breakpoints, checkpoints, and log
//! reads. All mutation happens under the per-instance lock, so
//! concurrent calls against one instance serialize and the execution
//! log stays totally ordered.

use crate::engine::actions::ActionRegistry;
use crate::engine::instance::{
    ApprovalResponse, ExecutionInstance, ExecutionStatus, InstanceId, WaitState,
};
use crate::engine::journal::LogEntry;
use crate::engine::notify::NotificationHook;
use crate::engine::scheduler;
use crate::model::context::VariableContext;
use crate::model::graph::{GraphError, StepGraph};
use crate::model::step::{StepId, StepKind, StepTarget};
use crate::state::checkpoint::{CheckpointError, CheckpointManager, CheckpointMetadata, CheckpointState};
use crate::state::storage::{MemoryStorage, StorageBackend};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// Errors raised by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("operation {operation} is not valid while the instance is {status}")]
    InvalidTransition {
        status: ExecutionStatus,
        operation: &'static str,
    },

    #[error("step {0} is not waiting for a review")]
    NoPendingReview(StepId),

    #[error("step {0} is not waiting for a decision")]
    NoPendingDecision(StepId),

    #[error("step {0} does not exist in the graph")]
    UnknownStep(StepId),

    #[error("{assignee} is not an assignee of step {step}")]
    UnknownAssignee { step: StepId, assignee: String },

    #[error("{assignee} already responded to step {step}")]
    DuplicateResponse { step: StepId, assignee: String },

    #[error("step {step} has no decision option {index}")]
    InvalidOption { step: StepId, index: usize },

    #[error("instance {0} has an automation dispatch in flight; checkpoint refused")]
    DispatchInFlight(InstanceId),

    #[error("checkpoint {checkpoint} belongs to another instance, not {instance}")]
    CheckpointMismatch {
        checkpoint: String,
        instance: InstanceId,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Executes proofing workflow instances against a checkpoint storage
/// backend.
pub struct WorkflowEngine<S: StorageBackend> {
    instances: RwLock<HashMap<InstanceId, Arc<Mutex<ExecutionInstance>>>>,
    registry: Arc<dyn ActionRegistry>,
    hook: Option<Arc<dyn NotificationHook>>,
    checkpoints: CheckpointManager<S>,
}

impl WorkflowEngine<MemoryStorage> {
    /// Engine with volatile checkpoint storage, for tests and
    /// short-lived embeddings.
    pub fn in_memory(registry: Arc<dyn ActionRegistry>) -> Self {
        Self::new(
            registry,
            CheckpointManager::new(Arc::new(MemoryStorage::new())),
        )
    }
}

impl<S: StorageBackend> WorkflowEngine<S> {
    pub fn new(registry: Arc<dyn ActionRegistry>, checkpoints: CheckpointManager<S>) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            registry,
            hook: None,
            checkpoints,
        }
    }

    /// Attach a notification hook. Must be called before instances are
    /// submitted.
    pub fn with_hook(mut self, hook: Arc<dyn NotificationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Validate a graph and register a new Pending instance of it.
    /// Unreachable-step warnings land in the instance log.
    pub async fn submit(&self, graph: StepGraph) -> Result<InstanceId, GraphError> {
        let warnings = graph.validate()?;

        let mut instance = ExecutionInstance::new(Arc::new(graph));
        instance.log_info(
            None,
            "workflow submitted",
            Some(json!({
                "graph": instance.graph.name,
                "version": instance.graph.version,
            })),
        );
        for warning in warnings {
            instance.log_warning(Some(warning.step), warning.message, None);
        }

        let instance_id = instance.instance_id.clone();
        log::info!("submitted workflow instance {}", instance_id);
        let mut instances = self.instances.write().await;
        instances.insert(instance_id.clone(), Arc::new(Mutex::new(instance)));
        Ok(instance_id)
    }

    async fn instance(
        &self,
        instance_id: &str,
    ) -> Result<Arc<Mutex<ExecutionInstance>>, EngineError> {
        let instances = self.instances.read().await;
        instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))
    }

    /// Ids of all registered instances.
    pub async fn instance_ids(&self) -> Vec<InstanceId> {
        let instances = self.instances.read().await;
        instances.keys().cloned().collect()
    }

    /// Start a Pending instance at the graph's entry step.
    pub async fn start(&self, instance_id: &str) -> Result<(), EngineError> {
        let instance = self.instance(instance_id).await?;
        {
            let mut inst = instance.lock().await;
            if inst.status != ExecutionStatus::Pending {
                return Err(EngineError::InvalidTransition {
                    status: inst.status,
                    operation: "start",
                });
            }
            inst.status = ExecutionStatus::Running;
            let entry = inst.graph.entry.clone();
            inst.push_entry(entry, None);
            inst.log_info(None, "execution started", None);
        }
        self.advance(&instance).await;
        Ok(())
    }

    /// Suspend a Running instance. Takes effect at the next scheduling
    /// boundary; actions already in flight run to completion.
    pub async fn pause(&self, instance_id: &str) -> Result<(), EngineError> {
        let instance = self.instance(instance_id).await?;
        let mut inst = instance.lock().await;
        if inst.status != ExecutionStatus::Running {
            return Err(EngineError::InvalidTransition {
                status: inst.status,
                operation: "pause",
            });
        }
        inst.status = ExecutionStatus::Paused;
        inst.log_info(None, "execution paused", None);
        Ok(())
    }

    /// Resume a Paused instance.
    pub async fn resume(&self, instance_id: &str) -> Result<(), EngineError> {
        let instance = self.instance(instance_id).await?;
        {
            let mut inst = instance.lock().await;
            if inst.status != ExecutionStatus::Paused {
                return Err(EngineError::InvalidTransition {
                    status: inst.status,
                    operation: "resume",
                });
            }
            inst.status = ExecutionStatus::Running;
            inst.log_info(None, "execution resumed", None);
        }
        self.advance(&instance).await;
        Ok(())
    }

    /// Current lifecycle status.
    pub async fn status(&self, instance_id: &str) -> Result<ExecutionStatus, EngineError> {
        let instance = self.instance(instance_id).await?;
        let inst = instance.lock().await;
        Ok(inst.status)
    }

    /// Snapshot of the instance variables.
    pub async fn variables(&self, instance_id: &str) -> Result<VariableContext, EngineError> {
        let instance = self.instance(instance_id).await?;
        let inst = instance.lock().await;
        Ok(inst.variables.clone())
    }

    /// Replace the instance variables wholesale. Conditions evaluated
    /// after this call see the new values.
    pub async fn set_variables(
        &self,
        instance_id: &str,
        variables: VariableContext,
    ) -> Result<(), EngineError> {
        let instance = self.instance(instance_id).await?;
        let mut inst = instance.lock().await;
        if inst.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                status: inst.status,
                operation: "set_variables",
            });
        }
        let count = variables.len();
        inst.variables = variables;
        inst.log_info(None, "variables updated", Some(json!({ "count": count })));
        Ok(())
    }

    /// Record one assignee's approval or rejection of a waiting review
    /// step, resolving the review when its rules are satisfied.
    pub async fn deliver_approval(
        &self,
        instance_id: &str,
        step_id: &StepId,
        assignee: &str,
        approved: bool,
        comment: Option<String>,
    ) -> Result<(), EngineError> {
        let instance = self.instance(instance_id).await?;
        {
            let mut inst = instance.lock().await;
            if inst.status != ExecutionStatus::Running {
                return Err(EngineError::InvalidTransition {
                    status: inst.status,
                    operation: "deliver_approval",
                });
            }
            let Some(pos) = inst
                .frontier
                .iter()
                .position(|e| &e.step == step_id && e.wait == WaitState::Review)
            else {
                return Err(EngineError::NoPendingReview(step_id.clone()));
            };

            let graph = inst.graph.clone();
            let Some(StepKind::Review {
                assignees,
                min_approvers,
                require_all,
                next,
                ..
            }) = graph.step(step_id).map(|s| &s.kind)
            else {
                return Err(EngineError::NoPendingReview(step_id.clone()));
            };
            if !assignees.iter().any(|a| a == assignee) {
                return Err(EngineError::UnknownAssignee {
                    step: step_id.clone(),
                    assignee: assignee.to_string(),
                });
            }

            let responses = inst.approvals.entry(step_id.clone()).or_default();
            if responses.iter().any(|r| r.assignee == assignee) {
                return Err(EngineError::DuplicateResponse {
                    step: step_id.clone(),
                    assignee: assignee.to_string(),
                });
            }
            responses.push(ApprovalResponse {
                assignee: assignee.to_string(),
                approved,
                comment: comment.clone(),
                received_at: Utc::now(),
            });
            let approved_count = responses.iter().filter(|r| r.approved).count();
            let rejected_count = responses.len() - approved_count;

            inst.log_info(
                Some(step_id.clone()),
                "approval received",
                Some(json!({
                    "assignee": assignee,
                    "approved": approved,
                    "comment": comment,
                })),
            );

            let total = assignees.len();
            let resolution = if *require_all {
                if rejected_count > 0 {
                    Some(false)
                } else if approved_count == total {
                    Some(true)
                } else {
                    None
                }
            } else {
                let threshold = *min_approvers as usize;
                if approved_count >= threshold {
                    Some(true)
                } else if rejected_count > total - threshold {
                    // Too many rejections for the threshold to ever be
                    // reached.
                    Some(false)
                } else {
                    None
                }
            };

            match resolution {
                Some(true) => {
                    let entry = inst.frontier.remove(pos);
                    inst.log_success(
                        Some(step_id.clone()),
                        "review approved",
                        Some(json!({ "approvals": approved_count })),
                    );
                    scheduler::apply_target(&mut inst, entry.branch, next.clone(), self.hook());
                }
                Some(false) => {
                    let entry = inst.frontier.remove(pos);
                    inst.log_warning(
                        Some(step_id.clone()),
                        "review rejected",
                        Some(json!({ "rejections": rejected_count })),
                    );
                    scheduler::apply_target(
                        &mut inst,
                        entry.branch,
                        StepTarget::reject(),
                        self.hook(),
                    );
                }
                None => {}
            }
        }
        self.advance(&instance).await;
        Ok(())
    }

    /// Resolve a waiting decision step by option index.
    pub async fn deliver_decision(
        &self,
        instance_id: &str,
        step_id: &StepId,
        option_index: usize,
    ) -> Result<(), EngineError> {
        let instance = self.instance(instance_id).await?;
        {
            let mut inst = instance.lock().await;
            if inst.status != ExecutionStatus::Running {
                return Err(EngineError::InvalidTransition {
                    status: inst.status,
                    operation: "deliver_decision",
                });
            }
            let Some(pos) = inst
                .frontier
                .iter()
                .position(|e| &e.step == step_id && e.wait == WaitState::Decision)
            else {
                return Err(EngineError::NoPendingDecision(step_id.clone()));
            };

            let graph = inst.graph.clone();
            let Some(StepKind::Decision { options }) = graph.step(step_id).map(|s| &s.kind) else {
                return Err(EngineError::NoPendingDecision(step_id.clone()));
            };
            let Some(option) = options.get(option_index) else {
                return Err(EngineError::InvalidOption {
                    step: step_id.clone(),
                    index: option_index,
                });
            };

            let entry = inst.frontier.remove(pos);
            inst.log_info(
                Some(step_id.clone()),
                "decision selected",
                Some(json!({ "label": option.label, "index": option_index })),
            );
            scheduler::apply_target(&mut inst, entry.branch, option.target.clone(), self.hook());
        }
        self.advance(&instance).await;
        Ok(())
    }

    /// Arm a one-shot breakpoint: the instance pauses instead of
    /// dispatching the step.
    pub async fn add_breakpoint(
        &self,
        instance_id: &str,
        step_id: StepId,
    ) -> Result<(), EngineError> {
        let instance = self.instance(instance_id).await?;
        let mut inst = instance.lock().await;
        if inst.graph.step(&step_id).is_none() {
            return Err(EngineError::UnknownStep(step_id));
        }
        inst.breakpoints.insert(step_id.clone());
        inst.log_info(Some(step_id), "breakpoint added", None);
        Ok(())
    }

    /// Disarm a breakpoint. Removing an absent breakpoint is a no-op.
    pub async fn remove_breakpoint(
        &self,
        instance_id: &str,
        step_id: &StepId,
    ) -> Result<(), EngineError> {
        let instance = self.instance(instance_id).await?;
        let mut inst = instance.lock().await;
        if inst.breakpoints.remove(step_id) {
            inst.log_info(Some(step_id.clone()), "breakpoint removed", None);
        }
        Ok(())
    }

    /// Capture the instance's rewindable state as a new checkpoint.
    /// Refused while any automation dispatch is in flight: its actions
    /// may complete after the capture, and a restore would run them
    /// again.
    pub async fn create_checkpoint(&self, instance_id: &str) -> Result<String, EngineError> {
        let instance = self.instance(instance_id).await?;
        let state = {
            let inst = instance.lock().await;
            if inst
                .frontier
                .iter()
                .any(|e| e.wait == WaitState::Dispatching)
            {
                return Err(EngineError::DispatchInFlight(inst.instance_id.clone()));
            }
            CheckpointState {
                instance_id: inst.instance_id.clone(),
                status: inst.status,
                frontier: inst.frontier.clone(),
                variables: inst.variables.clone(),
                retries_used: inst.retries_used.clone(),
                approvals: inst.approvals.clone(),
                joins: inst.joins.clone(),
                next_entry_id: inst.next_entry_id(),
                captured_at: Utc::now(),
            }
        };

        let checkpoint_id = self.checkpoints.save(state).await?;

        let mut inst = instance.lock().await;
        inst.checkpoint_ids.push(checkpoint_id.clone());
        inst.log_info(
            None,
            "checkpoint created",
            Some(json!({ "checkpoint": checkpoint_id })),
        );
        Ok(checkpoint_id)
    }

    /// Replace the instance's state with a checkpoint snapshot. The
    /// instance comes back Paused; the execution log is kept as-is and
    /// records the restore.
    pub async fn restore(
        &self,
        instance_id: &str,
        checkpoint_id: &str,
    ) -> Result<(), EngineError> {
        let instance = self.instance(instance_id).await?;
        let state = self.checkpoints.load(checkpoint_id).await?;
        if state.instance_id != instance_id {
            return Err(EngineError::CheckpointMismatch {
                checkpoint: checkpoint_id.to_string(),
                instance: instance_id.to_string(),
            });
        }

        let mut inst = instance.lock().await;
        inst.frontier = state.frontier;
        inst.variables = state.variables;
        inst.retries_used = state.retries_used;
        inst.approvals = state.approvals;
        inst.joins = state.joins;
        inst.set_next_entry_id(state.next_entry_id);
        inst.status = ExecutionStatus::Paused;
        inst.log_info(
            None,
            "state restored from checkpoint",
            Some(json!({ "checkpoint": checkpoint_id })),
        );
        Ok(())
    }

    /// Metadata of all checkpoints taken for an instance.
    pub async fn list_checkpoints(
        &self,
        instance_id: &str,
    ) -> Result<Vec<CheckpointMetadata>, EngineError> {
        self.instance(instance_id).await?;
        Ok(self.checkpoints.list(instance_id).await?)
    }

    /// Delete all but the newest `keep` checkpoints of an instance.
    pub async fn prune_checkpoints(
        &self,
        instance_id: &str,
        keep: usize,
    ) -> Result<usize, EngineError> {
        self.instance(instance_id).await?;
        Ok(self.checkpoints.prune(instance_id, keep).await?)
    }

    /// Log entries after the given sequence number, capped at `limit`.
    pub async fn log_window(
        &self,
        instance_id: &str,
        after: u64,
        limit: usize,
    ) -> Result<Vec<LogEntry>, EngineError> {
        let instance = self.instance(instance_id).await?;
        let inst = instance.lock().await;
        Ok(inst.log.window(after, limit))
    }

    /// Full copy of the execution log.
    pub async fn log_snapshot(&self, instance_id: &str) -> Result<Vec<LogEntry>, EngineError> {
        let instance = self.instance(instance_id).await?;
        let inst = instance.lock().await;
        Ok(inst.log.entries().to_vec())
    }

    fn hook(&self) -> Option<&dyn NotificationHook> {
        self.hook.as_deref()
    }

    async fn advance(&self, instance: &Arc<Mutex<ExecutionInstance>>) {
        scheduler::advance(instance, &self.registry, self.hook.as_ref()).await;
    }
}
