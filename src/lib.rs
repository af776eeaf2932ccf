//! Workflow execution engine for document proofing and approval
//! pipelines.
//!
//! A workflow is a graph of steps: human review rounds, automated
//! action lists, condition branches, manual decisions, and parallel
//! forks with join policies. The engine executes instances of such
//! graphs, suspends wherever external input is required, applies
//! per-step retry policies, and records every transition in an
//! append-only execution log. Instance state can be checkpointed to
//! pluggable storage and rewound later.
//!
//! The engine never drives a clock of its own. Deadlines are advisory
//! metadata; the embedding application observes them and delivers
//! synthetic rejections when it decides a review has timed out.
//!
//! # Example
//!
//! ```no_run
//! use proofing_workflow::engine::{InMemoryActionRegistry, WorkflowEngine};
//! use proofing_workflow::model::{ActionSpec, GraphBuilder, Step, StepId, StepTarget};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = InMemoryActionRegistry::new();
//! registry.register_noop("compress").await;
//! let engine = WorkflowEngine::in_memory(Arc::new(registry));
//!
//! let (graph, _warnings) = GraphBuilder::new("release", "review")
//!     .step(Step::review(
//!         "review",
//!         vec!["alice".to_string()],
//!         1,
//!         StepTarget::step("publish"),
//!     ))
//!     .step(Step::automation(
//!         "publish",
//!         vec![ActionSpec::new("compress")],
//!         StepTarget::complete(),
//!     ))
//!     .build()?;
//!
//! let id = engine.submit(graph).await?;
//! engine.start(&id).await?;
//! engine
//!     .deliver_approval(&id, &StepId::from("review"), "alice", true, None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod engine;
pub mod model;
pub mod state;

pub use engine::{
    ActionRegistry, EngineError, ExecutionStatus, InMemoryActionRegistry, InstanceId, LogEntry,
    LogLevel, NotificationHook, WorkflowEngine,
};
pub use model::{
    ConditionNode, ConditionOperator, GraphBuilder, GraphError, JoinPolicy, ScalarValue, Step,
    StepGraph, StepId, StepTarget, VariableContext,
};
pub use state::{CheckpointManager, FileStorage, MemoryStorage, StorageBackend};
