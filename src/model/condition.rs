//! Condition expression trees attached to branching steps.
//!
//! A condition is either a simple comparison against one context
//! variable or a logical group combining child conditions. Trees are
//! plain data; evaluation lives in the engine.

use crate::model::context::ScalarValue;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparison operator of a simple condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOperator {
    /// Value equality within the same scalar type.
    Equals,

    /// Value inequality within the same scalar type.
    NotEquals,

    /// Numeric strictly-greater comparison.
    GreaterThan,

    /// Numeric strictly-less comparison.
    LessThan,

    /// Substring match on string values.
    Contains,

    /// Membership in a list of candidate values.
    In,
}

impl fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConditionOperator::Equals => "equals",
            ConditionOperator::NotEquals => "notEquals",
            ConditionOperator::GreaterThan => "greaterThan",
            ConditionOperator::LessThan => "lessThan",
            ConditionOperator::Contains => "contains",
            ConditionOperator::In => "in",
        };
        write!(f, "{}", name)
    }
}

/// Logical combinator of a condition group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupOperator {
    /// True when every child is true (AND).
    All,

    /// True when at least one child is true (OR).
    Any,

    /// Negation of a single child (NOT).
    Not,
}

impl fmt::Display for GroupOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GroupOperator::All => "and",
            GroupOperator::Any => "or",
            GroupOperator::Not => "not",
        };
        write!(f, "{}", name)
    }
}

/// Right-hand side of a simple condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    /// A single comparison operand.
    Scalar(ScalarValue),

    /// A candidate list for the `In` operator.
    List(Vec<ScalarValue>),
}

impl From<ScalarValue> for ConditionValue {
    fn from(value: ScalarValue) -> Self {
        ConditionValue::Scalar(value)
    }
}

impl From<&str> for ConditionValue {
    fn from(value: &str) -> Self {
        ConditionValue::Scalar(value.into())
    }
}

impl From<String> for ConditionValue {
    fn from(value: String) -> Self {
        ConditionValue::Scalar(value.into())
    }
}

impl From<i64> for ConditionValue {
    fn from(value: i64) -> Self {
        ConditionValue::Scalar(value.into())
    }
}

impl From<f64> for ConditionValue {
    fn from(value: f64) -> Self {
        ConditionValue::Scalar(value.into())
    }
}

impl From<bool> for ConditionValue {
    fn from(value: bool) -> Self {
        ConditionValue::Scalar(value.into())
    }
}

/// One node of a condition expression tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConditionNode {
    /// Leaf comparison between a context variable and a literal value.
    Simple {
        field: String,
        operator: ConditionOperator,
        value: ConditionValue,
    },

    /// Logical combination of child conditions.
    Group {
        operator: GroupOperator,
        children: Vec<ConditionNode>,
    },
}

impl ConditionNode {
    /// Build a leaf comparison.
    pub fn simple(
        field: impl Into<String>,
        operator: ConditionOperator,
        value: impl Into<ConditionValue>,
    ) -> Self {
        ConditionNode::Simple {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Build an AND group over the given children.
    pub fn all(children: Vec<ConditionNode>) -> Self {
        ConditionNode::Group {
            operator: GroupOperator::All,
            children,
        }
    }

    /// Build an OR group over the given children.
    pub fn any(children: Vec<ConditionNode>) -> Self {
        ConditionNode::Group {
            operator: GroupOperator::Any,
            children,
        }
    }

    /// Negate a single child condition.
    pub fn not(child: ConditionNode) -> Self {
        ConditionNode::Group {
            operator: GroupOperator::Not,
            children: vec![child],
        }
    }

    /// Check group arity throughout the tree: NOT takes exactly one
    /// child, AND/OR take at least one.
    ///
    /// Returns a description of the first violation found.
    pub fn check_arity(&self) -> Result<(), String> {
        match self {
            ConditionNode::Simple { .. } => Ok(()),
            ConditionNode::Group { operator, children } => {
                match operator {
                    GroupOperator::Not if children.len() != 1 => {
                        return Err(format!(
                            "not group requires exactly one child, found {}",
                            children.len()
                        ));
                    }
                    GroupOperator::All | GroupOperator::Any if children.is_empty() => {
                        return Err(format!("{} group requires at least one child", operator));
                    }
                    _ => {}
                }
                for child in children {
                    child.check_arity()?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arity_valid_tree() {
        let tree = ConditionNode::all(vec![
            ConditionNode::simple("department", ConditionOperator::Equals, "marketing"),
            ConditionNode::not(ConditionNode::simple(
                "archived",
                ConditionOperator::Equals,
                true,
            )),
        ]);
        assert!(tree.check_arity().is_ok());
    }

    #[test]
    fn test_arity_rejects_empty_group() {
        let tree = ConditionNode::any(vec![]);
        let err = tree.check_arity().unwrap_err();
        assert!(err.contains("at least one child"));
    }

    #[test]
    fn test_arity_rejects_multi_child_not() {
        let tree = ConditionNode::Group {
            operator: GroupOperator::Not,
            children: vec![
                ConditionNode::simple("a", ConditionOperator::Equals, 1i64),
                ConditionNode::simple("b", ConditionOperator::Equals, 2i64),
            ],
        };
        let err = tree.check_arity().unwrap_err();
        assert!(err.contains("exactly one child"));
    }

    #[test]
    fn test_arity_checks_nested_children() {
        let tree = ConditionNode::all(vec![ConditionNode::any(vec![ConditionNode::Group {
            operator: GroupOperator::All,
            children: vec![],
        }])]);
        assert!(tree.check_arity().is_err());
    }

    #[test]
    fn test_serialization_round_trip() {
        let tree = ConditionNode::any(vec![
            ConditionNode::simple("priority", ConditionOperator::GreaterThan, 10i64),
            ConditionNode::simple(
                "tags",
                ConditionOperator::In,
                ConditionValue::List(vec!["print".into(), "web".into()]),
            ),
        ]);
        let json = serde_json::to_string(&tree).unwrap();
        let restored: ConditionNode = serde_json::from_str(&json).unwrap();
        assert_eq!(tree, restored);
    }
}
