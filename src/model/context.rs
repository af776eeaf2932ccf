//! Variable context shared by an executing workflow instance.
//!
//! The context is a flat map of named scalar values. Condition
//! expressions read from it, and callers replace it wholesale through
//! the engine when document metadata changes between steps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single typed value stored in a [`VariableContext`].
///
/// Only flat scalars are supported; nested structures are out of scope
/// for condition evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    /// Boolean flag.
    Bool(bool),

    /// Numeric value. Integers and floats share one representation.
    Num(f64),

    /// UTF-8 string.
    Str(String),
}

impl ScalarValue {
    /// Human-readable type name, used in evaluation warnings.
    pub fn type_name(&self) -> &'static str {
        match self {
            ScalarValue::Bool(_) => "boolean",
            ScalarValue::Num(_) => "number",
            ScalarValue::Str(_) => "string",
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Bool(b) => write!(f, "{}", b),
            ScalarValue::Num(n) => write!(f, "{}", n),
            ScalarValue::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Bool(value)
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        ScalarValue::Num(value)
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        ScalarValue::Num(value as f64)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::Str(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::Str(value)
    }
}

/// Named scalar values visible to condition evaluation.
///
/// Backed by a `BTreeMap` so serialized snapshots have a stable key
/// order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VariableContext {
    values: BTreeMap<String, ScalarValue>,
}

impl VariableContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable, replacing any previous value under the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<ScalarValue>) -> &mut Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Look up a variable by name.
    pub fn get(&self, name: &str) -> Option<&ScalarValue> {
        self.values.get(name)
    }

    /// Whether the context holds no variables.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of variables in the context.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Iterate over variables in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ScalarValue)> {
        self.values.iter()
    }
}

impl From<BTreeMap<String, ScalarValue>> for VariableContext {
    fn from(values: BTreeMap<String, ScalarValue>) -> Self {
        Self { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut ctx = VariableContext::new();
        ctx.set("department", "marketing").set("priority", 15i64);

        assert_eq!(
            ctx.get("department"),
            Some(&ScalarValue::Str("marketing".to_string()))
        );
        assert_eq!(ctx.get("priority"), Some(&ScalarValue::Num(15.0)));
        assert_eq!(ctx.get("missing"), None);
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_set_overwrites() {
        let mut ctx = VariableContext::new();
        ctx.set("flag", false);
        ctx.set("flag", true);

        assert_eq!(ctx.get("flag"), Some(&ScalarValue::Bool(true)));
        assert_eq!(ctx.len(), 1);
    }

    #[test]
    fn test_serialization_round_trip() {
        let mut ctx = VariableContext::new();
        ctx.set("name", "proof-42").set("pages", 12i64).set("urgent", true);

        let json = serde_json::to_string(&ctx).unwrap();
        let restored: VariableContext = serde_json::from_str(&json).unwrap();
        assert_eq!(ctx, restored);
    }

    #[test]
    fn test_scalar_type_names() {
        assert_eq!(ScalarValue::from("x").type_name(), "string");
        assert_eq!(ScalarValue::from(1.5).type_name(), "number");
        assert_eq!(ScalarValue::from(true).type_name(), "boolean");
    }
}
