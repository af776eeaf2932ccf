//! Condition evaluation.
//!
//! Evaluation is pure: it reads only the expression tree and the
//! variable context, never the clock or any engine state, so the same
//! inputs always produce the same result. A condition never fails at
//! runtime; missing fields and type mismatches evaluate to `false`
//! and are reported as warnings alongside the boolean result.

use crate::model::condition::{
    ConditionNode, ConditionOperator, ConditionValue, GroupOperator,
};
use crate::model::context::{ScalarValue, VariableContext};
use serde::{Deserialize, Serialize};

/// A non-fatal finding produced while evaluating a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalWarning {
    pub field: String,
    pub operator: ConditionOperator,
    pub message: String,
}

/// Result of evaluating a condition tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub value: bool,
    pub warnings: Vec<EvalWarning>,
}

/// Evaluate a condition tree against a variable context.
///
/// Group children are evaluated left to right with short-circuiting:
/// AND stops at the first false child, OR at the first true child.
pub fn evaluate(node: &ConditionNode, ctx: &VariableContext) -> Evaluation {
    let mut warnings = Vec::new();
    let value = eval_node(node, ctx, &mut warnings);
    Evaluation { value, warnings }
}

fn eval_node(node: &ConditionNode, ctx: &VariableContext, warnings: &mut Vec<EvalWarning>) -> bool {
    match node {
        ConditionNode::Simple {
            field,
            operator,
            value,
        } => eval_simple(field, *operator, value, ctx, warnings),
        ConditionNode::Group { operator, children } => match operator {
            GroupOperator::All => {
                for child in children {
                    if !eval_node(child, ctx, warnings) {
                        return false;
                    }
                }
                true
            }
            GroupOperator::Any => {
                for child in children {
                    if eval_node(child, ctx, warnings) {
                        return true;
                    }
                }
                false
            }
            GroupOperator::Not => match children.first() {
                Some(child) => !eval_node(child, ctx, warnings),
                // Validation rejects this shape; treat it as false if
                // an unvalidated tree slips through.
                None => false,
            },
        },
    }
}

fn eval_simple(
    field: &str,
    operator: ConditionOperator,
    value: &ConditionValue,
    ctx: &VariableContext,
    warnings: &mut Vec<EvalWarning>,
) -> bool {
    let Some(actual) = ctx.get(field) else {
        warnings.push(EvalWarning {
            field: field.to_string(),
            operator,
            message: format!("field {} is not set in the context", field),
        });
        return false;
    };

    match operator {
        ConditionOperator::Equals | ConditionOperator::NotEquals => {
            let ConditionValue::Scalar(expected) = value else {
                warn_mismatch(warnings, field, operator, actual, "a list value");
                return false;
            };
            match scalar_eq(actual, expected) {
                Some(eq) => {
                    if operator == ConditionOperator::Equals {
                        eq
                    } else {
                        !eq
                    }
                }
                None => {
                    warn_mismatch(warnings, field, operator, actual, expected.type_name());
                    false
                }
            }
        }
        ConditionOperator::GreaterThan | ConditionOperator::LessThan => {
            let (ScalarValue::Num(a), ConditionValue::Scalar(ScalarValue::Num(b))) =
                (actual, value)
            else {
                warn_mismatch(warnings, field, operator, actual, "a number");
                return false;
            };
            if operator == ConditionOperator::GreaterThan {
                a > b
            } else {
                a < b
            }
        }
        ConditionOperator::Contains => {
            let (ScalarValue::Str(haystack), ConditionValue::Scalar(ScalarValue::Str(needle))) =
                (actual, value)
            else {
                warn_mismatch(warnings, field, operator, actual, "a string");
                return false;
            };
            haystack.contains(needle.as_str())
        }
        ConditionOperator::In => eval_in(field, actual, value, warnings),
    }
}

/// Membership test. The candidate set is either an explicit list or a
/// comma-separated string, which imported definitions commonly use.
fn eval_in(
    field: &str,
    actual: &ScalarValue,
    value: &ConditionValue,
    warnings: &mut Vec<EvalWarning>,
) -> bool {
    match value {
        ConditionValue::List(candidates) => candidates
            .iter()
            .any(|candidate| scalar_eq(actual, candidate) == Some(true)),
        ConditionValue::Scalar(ScalarValue::Str(csv)) => csv
            .split(',')
            .map(str::trim)
            .any(|item| match actual {
                ScalarValue::Str(s) => item == s,
                ScalarValue::Num(n) => item.parse::<f64>().map(|v| v == *n).unwrap_or(false),
                ScalarValue::Bool(b) => item.parse::<bool>().map(|v| v == *b).unwrap_or(false),
            }),
        ConditionValue::Scalar(other) => {
            warn_mismatch(
                warnings,
                field,
                ConditionOperator::In,
                actual,
                other.type_name(),
            );
            false
        }
    }
}

/// Same-type equality. `None` means the operands have different types
/// and cannot be compared.
fn scalar_eq(a: &ScalarValue, b: &ScalarValue) -> Option<bool> {
    match (a, b) {
        (ScalarValue::Str(x), ScalarValue::Str(y)) => Some(x == y),
        (ScalarValue::Num(x), ScalarValue::Num(y)) => Some(x == y),
        (ScalarValue::Bool(x), ScalarValue::Bool(y)) => Some(x == y),
        _ => None,
    }
}

fn warn_mismatch(
    warnings: &mut Vec<EvalWarning>,
    field: &str,
    operator: ConditionOperator,
    actual: &ScalarValue,
    expected: &str,
) {
    warnings.push(EvalWarning {
        field: field.to_string(),
        operator,
        message: format!(
            "operator {} cannot compare {} value of field {} with {}",
            operator,
            actual.type_name(),
            field,
            expected
        ),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::condition::ConditionNode;

    fn sample_ctx() -> VariableContext {
        let mut ctx = VariableContext::new();
        ctx.set("department", "marketing")
            .set("priority", 15i64)
            .set("urgent", true);
        ctx
    }

    #[test]
    fn test_and_of_or_example() {
        // AND(department == "marketing", OR(priority > 10, urgent == true))
        let tree = ConditionNode::all(vec![
            ConditionNode::simple("department", ConditionOperator::Equals, "marketing"),
            ConditionNode::any(vec![
                ConditionNode::simple("priority", ConditionOperator::GreaterThan, 10i64),
                ConditionNode::simple("urgent", ConditionOperator::Equals, true),
            ]),
        ]);

        let result = evaluate(&tree, &sample_ctx());
        assert!(result.value);
        assert!(result.warnings.is_empty());

        let mut ctx = sample_ctx();
        ctx.set("department", "legal");
        assert!(!evaluate(&tree, &ctx).value);
    }

    #[test]
    fn test_evaluation_is_pure() {
        let tree = ConditionNode::simple("priority", ConditionOperator::LessThan, 100i64);
        let ctx = sample_ctx();
        let first = evaluate(&tree, &ctx);
        let second = evaluate(&tree, &ctx);
        assert_eq!(first, second);
    }

    #[test]
    fn test_and_short_circuits() {
        // The second child would warn about a type mismatch, but AND
        // stops at the first false child.
        let tree = ConditionNode::all(vec![
            ConditionNode::simple("department", ConditionOperator::Equals, "legal"),
            ConditionNode::simple("priority", ConditionOperator::Contains, "1"),
        ]);
        let result = evaluate(&tree, &sample_ctx());
        assert!(!result.value);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_or_short_circuits() {
        let tree = ConditionNode::any(vec![
            ConditionNode::simple("urgent", ConditionOperator::Equals, true),
            ConditionNode::simple("missing", ConditionOperator::Equals, 1i64),
        ]);
        let result = evaluate(&tree, &sample_ctx());
        assert!(result.value);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_missing_field_is_false_with_warning() {
        let tree = ConditionNode::simple("missing", ConditionOperator::NotEquals, "x");
        let result = evaluate(&tree, &sample_ctx());
        assert!(!result.value);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].message.contains("not set"));
    }

    #[test]
    fn test_contains_on_number_warns() {
        let tree = ConditionNode::simple("priority", ConditionOperator::Contains, "1");
        let result = evaluate(&tree, &sample_ctx());
        assert!(!result.value);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].operator, ConditionOperator::Contains);
    }

    #[test]
    fn test_not_negates() {
        let tree = ConditionNode::not(ConditionNode::simple(
            "urgent",
            ConditionOperator::Equals,
            false,
        ));
        assert!(evaluate(&tree, &sample_ctx()).value);
    }

    #[test]
    fn test_in_with_explicit_list() {
        let tree = ConditionNode::simple(
            "department",
            ConditionOperator::In,
            ConditionValue::List(vec!["legal".into(), "marketing".into()]),
        );
        assert!(evaluate(&tree, &sample_ctx()).value);
    }

    #[test]
    fn test_in_with_comma_separated_string() {
        let tree = ConditionNode::simple("priority", ConditionOperator::In, "10, 15, 20");
        assert!(evaluate(&tree, &sample_ctx()).value);

        let miss = ConditionNode::simple("priority", ConditionOperator::In, "1, 2");
        assert!(!evaluate(&miss, &sample_ctx()).value);
    }

    #[test]
    fn test_equals_type_mismatch_warns() {
        let tree = ConditionNode::simple("priority", ConditionOperator::Equals, "15");
        let result = evaluate(&tree, &sample_ctx());
        assert!(!result.value);
        assert_eq!(result.warnings.len(), 1);
    }
}
