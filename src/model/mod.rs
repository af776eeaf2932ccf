//! Data model for proofing workflows: condition trees, step
//! definitions, graphs, and the variable context steps evaluate
//! against.

pub mod condition;
pub mod context;
pub mod graph;
pub mod step;

pub use condition::{ConditionNode, ConditionOperator, ConditionValue, GroupOperator};
pub use context::{ScalarValue, VariableContext};
pub use graph::{GraphBuilder, GraphError, GraphId, StepGraph, ValidationWarning};
pub use step::{
    ActionSpec, DecisionOption, ErrorPolicy, JoinPolicy, OnExhaustion, Outcome, Step, StepId,
    StepKind, StepTarget,
};
