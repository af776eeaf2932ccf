//! Workflow graph definition and structural validation.
//!
//! A graph is an ordered set of steps plus a designated entry step.
//! Validation is structural only: every referenced target must exist,
//! condition trees must have legal arity, and review/parallel/decision
//! steps must be internally consistent. Cycles are legal; revision
//! loops are a normal proofing pattern. Steps unreachable from the
//! entry are reported as warnings, not errors.

use crate::model::step::{Step, StepId, StepKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier of a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GraphId(String);

impl GraphId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        GraphId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for GraphId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for GraphId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors raised when a graph definition is structurally invalid.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("graph has no steps")]
    EmptyGraph,

    #[error("duplicate step id: {0}")]
    DuplicateStep(StepId),

    #[error("entry step not found: {0}")]
    UnknownEntry(StepId),

    #[error("step {from} routes to unknown step {to}")]
    UnknownTarget { from: StepId, to: StepId },

    #[error("invalid condition on step {step}: {detail}")]
    InvalidCondition { step: StepId, detail: String },

    #[error("review step {step}: {detail}")]
    InvalidReview { step: StepId, detail: String },

    #[error("decision step {0} has no options")]
    EmptyOptions(StepId),

    #[error("parallel step {0} has no branches")]
    EmptyBranches(StepId),

    #[error("parallel step {step}: branch {index} is empty")]
    EmptyBranch { step: StepId, index: usize },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Non-fatal finding produced by validation, e.g. an unreachable step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub step: StepId,
    pub message: String,
}

/// A complete workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepGraph {
    /// Unique graph id.
    pub id: GraphId,

    /// Human-readable name.
    pub name: String,

    /// Steps in definition order.
    pub steps: Vec<Step>,

    /// Id of the step execution starts from.
    pub entry: StepId,

    /// Version string, bumped by the caller on edits.
    pub version: String,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl StepGraph {
    /// Create an empty graph with the given entry step id. Steps are
    /// added afterwards; `validate` checks that the entry exists.
    pub fn new(name: impl Into<String>, entry: impl Into<StepId>) -> Self {
        let now = Utc::now();
        Self {
            id: GraphId::new(),
            name: name.into(),
            steps: Vec::new(),
            entry: entry.into(),
            version: "1.0.0".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Add a step, rejecting duplicate ids.
    pub fn add_step(&mut self, step: Step) -> Result<(), GraphError> {
        if self.step(&step.id).is_some() {
            return Err(GraphError::DuplicateStep(step.id));
        }
        self.steps.push(step);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Look up a step by id.
    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == id)
    }

    /// Validate structure. Returns warnings for unreachable steps; any
    /// structural defect is an error.
    pub fn validate(&self) -> Result<Vec<ValidationWarning>, GraphError> {
        if self.steps.is_empty() {
            return Err(GraphError::EmptyGraph);
        }
        if self.step(&self.entry).is_none() {
            return Err(GraphError::UnknownEntry(self.entry.clone()));
        }

        for step in &self.steps {
            self.validate_step(step)?;
        }

        let reachable = self.reachable_from_entry();
        let warnings = self
            .steps
            .iter()
            .filter(|s| !reachable.contains(&s.id))
            .map(|s| ValidationWarning {
                step: s.id.clone(),
                message: format!("step {} is unreachable from the entry step", s.id),
            })
            .collect();

        Ok(warnings)
    }

    fn validate_step(&self, step: &Step) -> Result<(), GraphError> {
        for target in step.targets() {
            if let Some(to) = target.step_id() {
                if self.step(to).is_none() {
                    return Err(GraphError::UnknownTarget {
                        from: step.id.clone(),
                        to: to.clone(),
                    });
                }
            }
        }

        match &step.kind {
            StepKind::Condition { expr, .. } => {
                expr.check_arity().map_err(|detail| GraphError::InvalidCondition {
                    step: step.id.clone(),
                    detail,
                })?;
            }
            StepKind::Review {
                assignees,
                min_approvers,
                ..
            } => {
                if assignees.is_empty() {
                    return Err(GraphError::InvalidReview {
                        step: step.id.clone(),
                        detail: "no assignees".to_string(),
                    });
                }
                if *min_approvers == 0 {
                    return Err(GraphError::InvalidReview {
                        step: step.id.clone(),
                        detail: "min_approvers must be at least 1".to_string(),
                    });
                }
                if *min_approvers as usize > assignees.len() {
                    return Err(GraphError::InvalidReview {
                        step: step.id.clone(),
                        detail: format!(
                            "min_approvers {} exceeds assignee count {}",
                            min_approvers,
                            assignees.len()
                        ),
                    });
                }
            }
            StepKind::Decision { options } => {
                if options.is_empty() {
                    return Err(GraphError::EmptyOptions(step.id.clone()));
                }
            }
            StepKind::Parallel { branches, .. } => {
                if branches.is_empty() {
                    return Err(GraphError::EmptyBranches(step.id.clone()));
                }
                for (index, branch) in branches.iter().enumerate() {
                    if branch.is_empty() {
                        return Err(GraphError::EmptyBranch {
                            step: step.id.clone(),
                            index,
                        });
                    }
                    for member in branch {
                        if self.step(member).is_none() {
                            return Err(GraphError::UnknownTarget {
                                from: step.id.clone(),
                                to: member.clone(),
                            });
                        }
                    }
                }
            }
            StepKind::Automation { .. } => {}
        }

        if let Some(policy) = &step.error_policy {
            if let crate::model::step::OnExhaustion::Fallback(fallback) = &policy.on_exhaustion {
                if self.step(fallback).is_none() {
                    return Err(GraphError::UnknownTarget {
                        from: step.id.clone(),
                        to: fallback.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Step ids reachable from the entry by following routing targets,
    /// parallel branch members, and fallback edges. Iterative DFS.
    pub fn reachable_from_entry(&self) -> HashSet<StepId> {
        let mut visited = HashSet::new();
        let mut stack = vec![self.entry.clone()];

        while let Some(id) = stack.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let Some(step) = self.step(&id) else {
                continue;
            };
            for target in step.targets() {
                if let Some(to) = target.step_id() {
                    if !visited.contains(to) {
                        stack.push(to.clone());
                    }
                }
            }
            if let StepKind::Parallel { branches, .. } = &step.kind {
                for branch in branches {
                    for member in branch {
                        if !visited.contains(member) {
                            stack.push(member.clone());
                        }
                    }
                }
            }
            if let Some(policy) = &step.error_policy {
                if let crate::model::step::OnExhaustion::Fallback(fallback) = &policy.on_exhaustion
                {
                    if !visited.contains(fallback) {
                        stack.push(fallback.clone());
                    }
                }
            }
        }

        visited
    }

    /// Serialize the graph to JSON.
    pub fn to_json(&self) -> Result<String, GraphError> {
        serde_json::to_string_pretty(self).map_err(|e| GraphError::Serialization(e.to_string()))
    }

    /// Parse a graph from JSON. The result is not validated; call
    /// `validate` before submitting it for execution.
    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        serde_json::from_str(json).map_err(|e| GraphError::Serialization(e.to_string()))
    }
}

/// Fluent builder over [`StepGraph`] that defers validation to `build`.
pub struct GraphBuilder {
    graph: StepGraph,
    error: Option<GraphError>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>, entry: impl Into<StepId>) -> Self {
        Self {
            graph: StepGraph::new(name, entry),
            error: None,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.graph.version = version.into();
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        if self.error.is_none() {
            if let Err(e) = self.graph.add_step(step) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Validate and return the finished graph along with any warnings.
    pub fn build(self) -> Result<(StepGraph, Vec<ValidationWarning>), GraphError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let warnings = self.graph.validate()?;
        Ok((self.graph, warnings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::condition::{ConditionNode, ConditionOperator};
    use crate::model::step::{
        ActionSpec, DecisionOption, ErrorPolicy, JoinPolicy, OnExhaustion, StepTarget,
    };
    use std::time::Duration;

    fn compress_step(id: &str, next: StepTarget) -> Step {
        Step::automation(id, vec![ActionSpec::new("compress")], next)
    }

    #[test]
    fn test_build_valid_graph() {
        let (graph, warnings) = GraphBuilder::new("release", "check")
            .step(Step::condition(
                "check",
                ConditionNode::simple("kind", ConditionOperator::Equals, "print"),
                StepTarget::step("publish"),
                StepTarget::reject(),
            ))
            .step(compress_step("publish", StepTarget::complete()))
            .build()
            .unwrap();

        assert_eq!(graph.steps.len(), 2);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_duplicate_step_rejected() {
        let result = GraphBuilder::new("dup", "a")
            .step(compress_step("a", StepTarget::complete()))
            .step(compress_step("a", StepTarget::complete()))
            .build();
        assert!(matches!(result, Err(GraphError::DuplicateStep(_))));
    }

    #[test]
    fn test_unknown_target_rejected() {
        let result = GraphBuilder::new("dangling", "a")
            .step(compress_step("a", StepTarget::step("ghost")))
            .build();
        assert!(matches!(result, Err(GraphError::UnknownTarget { .. })));
    }

    #[test]
    fn test_unknown_entry_rejected() {
        let result = GraphBuilder::new("bad-entry", "missing")
            .step(compress_step("a", StepTarget::complete()))
            .build();
        assert!(matches!(result, Err(GraphError::UnknownEntry(_))));
    }

    #[test]
    fn test_cycles_are_legal() {
        // a -> b -> a is a revision loop, not an error.
        let (_, warnings) = GraphBuilder::new("loop", "a")
            .step(compress_step("a", StepTarget::step("b")))
            .step(compress_step("b", StepTarget::step("a")))
            .build()
            .unwrap();
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_unreachable_step_is_warning() {
        let (_, warnings) = GraphBuilder::new("island", "a")
            .step(compress_step("a", StepTarget::complete()))
            .step(compress_step("stranded", StepTarget::complete()))
            .build()
            .unwrap();

        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].step, StepId::from("stranded"));
    }

    #[test]
    fn test_review_threshold_bounds() {
        let result = GraphBuilder::new("review", "r")
            .step(Step::review(
                "r",
                vec!["alice".to_string()],
                2,
                StepTarget::complete(),
            ))
            .build();
        assert!(matches!(result, Err(GraphError::InvalidReview { .. })));
    }

    #[test]
    fn test_parallel_branch_members_must_exist() {
        let result = GraphBuilder::new("fork", "p")
            .step(Step::parallel(
                "p",
                vec![vec![StepId::from("ghost")]],
                JoinPolicy::All,
                StepTarget::complete(),
            ))
            .build();
        assert!(matches!(result, Err(GraphError::UnknownTarget { .. })));
    }

    #[test]
    fn test_fallback_target_must_exist() {
        let result = GraphBuilder::new("fallback", "a")
            .step(
                compress_step("a", StepTarget::complete()).with_error_policy(ErrorPolicy::new(
                    1,
                    Duration::from_millis(10),
                    OnExhaustion::Fallback(StepId::from("ghost")),
                )),
            )
            .build();
        assert!(matches!(result, Err(GraphError::UnknownTarget { .. })));
    }

    #[test]
    fn test_empty_condition_group_rejected() {
        let result = GraphBuilder::new("arity", "c")
            .step(Step::condition(
                "c",
                ConditionNode::all(vec![]),
                StepTarget::complete(),
                StepTarget::reject(),
            ))
            .build();
        assert!(matches!(result, Err(GraphError::InvalidCondition { .. })));
    }

    #[test]
    fn test_decision_needs_options() {
        let result = GraphBuilder::new("decide", "d")
            .step(Step::decision("d", vec![]))
            .build();
        assert!(matches!(result, Err(GraphError::EmptyOptions(_))));
    }

    #[test]
    fn test_json_round_trip() {
        let (graph, _) = GraphBuilder::new("serde", "r")
            .step(Step::review(
                "r",
                vec!["alice".to_string(), "bob".to_string()],
                1,
                StepTarget::step("d"),
            ))
            .step(Step::decision(
                "d",
                vec![DecisionOption::new("ship", StepTarget::complete())],
            ))
            .build()
            .unwrap();

        let json = graph.to_json().unwrap();
        let restored = StepGraph::from_json(&json).unwrap();
        assert_eq!(graph, restored);
        assert!(restored.validate().unwrap().is_empty());
    }
}
