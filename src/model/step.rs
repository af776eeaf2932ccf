//! Step definitions for proofing workflows.
//!
//! A step is the unit of work the scheduler dispatches: a human review
//! round, an automated action list, a condition branch, a manual
//! decision, or a parallel fork with a join policy.

use crate::model::condition::ConditionNode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifier of a step, unique within one graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        StepId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(id: &str) -> Self {
        StepId(id.to_string())
    }
}

impl From<String> for StepId {
    fn from(id: String) -> Self {
        StepId(id)
    }
}

/// Terminal outcome reached when a routing edge ends the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// The proof made it through the workflow.
    Complete,

    /// The proof was turned down along the way.
    Reject,
}

/// Where execution goes after a step resolves: either another step or
/// a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepTarget {
    Step(StepId),
    End(Outcome),
}

impl StepTarget {
    pub fn step(id: impl Into<StepId>) -> Self {
        StepTarget::Step(id.into())
    }

    pub fn complete() -> Self {
        StepTarget::End(Outcome::Complete)
    }

    pub fn reject() -> Self {
        StepTarget::End(Outcome::Reject)
    }

    /// The referenced step id, if the target is not terminal.
    pub fn step_id(&self) -> Option<&StepId> {
        match self {
            StepTarget::Step(id) => Some(id),
            StepTarget::End(_) => None,
        }
    }
}

/// One automated action inside an automation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    /// Registry name of the action, e.g. `compress` or `watermark`.
    pub name: String,

    /// Free-form parameters passed to the action handler.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ActionSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

/// How a parallel step decides it is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinPolicy {
    /// Wait for every branch to finish.
    All,

    /// Proceed once any branch finishes; cancel the rest.
    Any,

    /// Alias of `Any` kept for imported definitions that distinguish
    /// the two; the first finished branch wins either way.
    First,
}

/// What to do when a failing step has used up its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OnExhaustion {
    /// Fail the whole instance.
    Fail,

    /// Skip the step and continue along its normal target.
    Skip,

    /// Reroute to a named recovery step.
    Fallback(StepId),
}

/// Retry behavior of a step that can fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPolicy {
    /// Retries after the first attempt; 0 means fail immediately.
    pub max_retries: u32,

    /// Delay before each retry attempt, in milliseconds.
    pub retry_delay_ms: u64,

    /// Behavior once retries are exhausted.
    pub on_exhaustion: OnExhaustion,
}

impl ErrorPolicy {
    pub fn new(max_retries: u32, retry_delay: Duration, on_exhaustion: OnExhaustion) -> Self {
        Self {
            max_retries,
            retry_delay_ms: retry_delay.as_millis() as u64,
            on_exhaustion,
        }
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 5000,
            on_exhaustion: OnExhaustion::Fail,
        }
    }
}

/// One selectable option of a decision step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionOption {
    /// Label shown to the decider.
    pub label: String,

    /// Routing target when this option is picked.
    pub target: StepTarget,
}

impl DecisionOption {
    pub fn new(label: impl Into<String>, target: StepTarget) -> Self {
        Self {
            label: label.into(),
            target,
        }
    }
}

/// The behavior variant of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StepKind {
    /// Human approval round over a set of assignees.
    Review {
        /// Users asked to approve or reject.
        assignees: Vec<String>,

        /// Approvals needed when `require_all` is false.
        min_approvers: u32,

        /// When true, every assignee must approve and a single
        /// rejection rejects the step.
        require_all: bool,

        /// Advisory deadline in hours; the engine records it but never
        /// drives a clock itself.
        deadline_hours: Option<u32>,

        /// Where to go once the review is approved.
        next: StepTarget,
    },

    /// Ordered list of automated actions run as one unit.
    Automation {
        actions: Vec<ActionSpec>,
        next: StepTarget,
    },

    /// Boolean branch over a condition expression.
    Condition {
        expr: ConditionNode,
        on_true: StepTarget,
        on_false: StepTarget,
    },

    /// Manual multi-way branch resolved by an external choice.
    Decision { options: Vec<DecisionOption> },

    /// Fork into branches executed concurrently, joined by a policy.
    Parallel {
        /// Each branch lists its member step ids; the first id is the
        /// branch entry point.
        branches: Vec<Vec<StepId>>,
        join: JoinPolicy,
        next: StepTarget,
    },
}

impl StepKind {
    /// Short name used in logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            StepKind::Review { .. } => "review",
            StepKind::Automation { .. } => "automation",
            StepKind::Condition { .. } => "condition",
            StepKind::Decision { .. } => "decision",
            StepKind::Parallel { .. } => "parallel",
        }
    }
}

/// A single node of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,

    /// Display name; defaults to the id.
    pub name: String,

    pub kind: StepKind,

    /// Retry policy applied when the step fails at runtime.
    pub error_policy: Option<ErrorPolicy>,
}

impl Step {
    pub fn new(id: impl Into<StepId>, kind: StepKind) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            kind,
            error_policy: None,
        }
    }

    /// Review step requiring `min_approvers` approvals from `assignees`.
    pub fn review(
        id: impl Into<StepId>,
        assignees: Vec<String>,
        min_approvers: u32,
        next: StepTarget,
    ) -> Self {
        Self::new(
            id,
            StepKind::Review {
                assignees,
                min_approvers,
                require_all: false,
                deadline_hours: None,
                next,
            },
        )
    }

    /// Automation step running `actions` in order.
    pub fn automation(id: impl Into<StepId>, actions: Vec<ActionSpec>, next: StepTarget) -> Self {
        Self::new(id, StepKind::Automation { actions, next })
    }

    /// Condition step branching on `expr`.
    pub fn condition(
        id: impl Into<StepId>,
        expr: ConditionNode,
        on_true: StepTarget,
        on_false: StepTarget,
    ) -> Self {
        Self::new(
            id,
            StepKind::Condition {
                expr,
                on_true,
                on_false,
            },
        )
    }

    /// Decision step offering `options` to an external decider.
    pub fn decision(id: impl Into<StepId>, options: Vec<DecisionOption>) -> Self {
        Self::new(id, StepKind::Decision { options })
    }

    /// Parallel step forking into `branches`.
    pub fn parallel(
        id: impl Into<StepId>,
        branches: Vec<Vec<StepId>>,
        join: JoinPolicy,
        next: StepTarget,
    ) -> Self {
        Self::new(
            id,
            StepKind::Parallel {
                branches,
                join,
                next,
            },
        )
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = Some(policy);
        self
    }

    /// Require unanimous approval on a review step. No effect on other
    /// kinds.
    pub fn require_all_approvals(mut self) -> Self {
        if let StepKind::Review { require_all, .. } = &mut self.kind {
            *require_all = true;
        }
        self
    }

    /// Set an advisory deadline on a review step. No effect on other
    /// kinds.
    pub fn with_deadline_hours(mut self, hours: u32) -> Self {
        if let StepKind::Review { deadline_hours, .. } = &mut self.kind {
            *deadline_hours = Some(hours);
        }
        self
    }

    /// All routing targets leaving this step, used for validation and
    /// reachability.
    pub fn targets(&self) -> Vec<&StepTarget> {
        match &self.kind {
            StepKind::Review { next, .. } => vec![next],
            StepKind::Automation { next, .. } => vec![next],
            StepKind::Condition {
                on_true, on_false, ..
            } => vec![on_true, on_false],
            StepKind::Decision { options } => options.iter().map(|o| &o.target).collect(),
            StepKind::Parallel { next, .. } => vec![next],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::condition::{ConditionNode, ConditionOperator};

    #[test]
    fn test_review_builder() {
        let step = Step::review(
            "legal-review",
            vec!["alice".to_string(), "bob".to_string()],
            2,
            StepTarget::complete(),
        )
        .with_name("Legal review")
        .with_deadline_hours(24)
        .require_all_approvals();

        assert_eq!(step.id, StepId::from("legal-review"));
        assert_eq!(step.name, "Legal review");
        match step.kind {
            StepKind::Review {
                require_all,
                deadline_hours,
                min_approvers,
                ..
            } => {
                assert!(require_all);
                assert_eq!(deadline_hours, Some(24));
                assert_eq!(min_approvers, 2);
            }
            other => panic!("unexpected kind: {}", other.kind_name()),
        }
    }

    #[test]
    fn test_targets_of_condition() {
        let step = Step::condition(
            "route",
            ConditionNode::simple("kind", ConditionOperator::Equals, "print"),
            StepTarget::step("print-check"),
            StepTarget::reject(),
        );

        let targets = step.targets();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].step_id(), Some(&StepId::from("print-check")));
        assert_eq!(targets[1].step_id(), None);
    }

    #[test]
    fn test_targets_of_decision() {
        let step = Step::decision(
            "triage",
            vec![
                DecisionOption::new("rework", StepTarget::step("edit")),
                DecisionOption::new("discard", StepTarget::reject()),
            ],
        );
        assert_eq!(step.targets().len(), 2);
    }

    #[test]
    fn test_error_policy_delay_round_trip() {
        let policy = ErrorPolicy::new(2, Duration::from_millis(250), OnExhaustion::Skip);
        assert_eq!(policy.retry_delay(), Duration::from_millis(250));

        let json = serde_json::to_string(&policy).unwrap();
        let restored: ErrorPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, restored);
    }
}
