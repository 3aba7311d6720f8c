//! Condition trees — the configurable predicate language of risk rules.
//!
//! RULES:
//!   - Evaluation never panics on data: type mismatches, missing fields,
//!     and over-deep trees all resolve to `false` (fail closed).
//!   - The tree is owned and acyclic by construction; depth is still capped
//!     to guard runaway configuration.

use crate::snapshot::EntitySnapshot;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Depth cap applied when no explicit limit is configured.
pub const DEFAULT_MAX_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Gt,
    Lt,
    Contains,
    In,
    NotIn,
}

/// A predicate tree. Leaves compare one snapshot field against a literal;
/// internal nodes combine children with AND (`All`) or OR (`Any`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Leaf {
        field: String,
        op: Operator,
        value: Value,
    },
    All {
        children: Vec<Condition>,
    },
    Any {
        children: Vec<Condition>,
    },
}

impl Condition {
    /// Collect every leaf field path in the tree, in definition order.
    /// Used to snapshot the fields a matching rule actually read.
    pub fn leaf_fields(&self) -> Vec<&str> {
        let mut fields = Vec::new();
        collect_fields(self, &mut fields);
        fields
    }

    /// Depth of the tree. A leaf has depth 1.
    pub fn depth(&self) -> usize {
        match self {
            Condition::Leaf { .. } => 1,
            Condition::All { children } | Condition::Any { children } => {
                1 + children.iter().map(Condition::depth).max().unwrap_or(0)
            }
        }
    }
}

fn collect_fields<'a>(node: &'a Condition, out: &mut Vec<&'a str>) {
    match node {
        Condition::Leaf { field, .. } => out.push(field),
        Condition::All { children } | Condition::Any { children } => {
            for child in children {
                collect_fields(child, out);
            }
        }
    }
}

/// Evaluate a condition tree against a snapshot.
///
/// Empty `All` is vacuously true; empty `Any` is false. A tree deeper than
/// `max_depth` is a configuration error: it is logged and treated as a
/// non-match, never a crash.
pub fn evaluate(tree: &Condition, snapshot: &EntitySnapshot, max_depth: usize) -> bool {
    match eval_node(tree, snapshot, 1, max_depth) {
        Ok(matched) => matched,
        Err(DepthExceeded) => {
            log::warn!("condition tree exceeds max depth {max_depth}; treating as non-match");
            false
        }
    }
}

struct DepthExceeded;

fn eval_node(
    node: &Condition,
    snapshot: &EntitySnapshot,
    depth: usize,
    max_depth: usize,
) -> Result<bool, DepthExceeded> {
    if depth > max_depth {
        return Err(DepthExceeded);
    }
    match node {
        Condition::Leaf { field, op, value } => Ok(eval_leaf(field, *op, value, snapshot)),
        Condition::All { children } => {
            for child in children {
                if !eval_node(child, snapshot, depth + 1, max_depth)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Condition::Any { children } => {
            for child in children {
                if eval_node(child, snapshot, depth + 1, max_depth)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }
}

fn eval_leaf(field: &str, op: Operator, expected: &Value, snapshot: &EntitySnapshot) -> bool {
    // Missing field: non-match for every operator, including the negated ones.
    let Some(actual) = snapshot.resolve(field) else {
        return false;
    };

    match op {
        Operator::Equals => json_eq(actual, expected),
        Operator::NotEquals => !json_eq(actual, expected),
        Operator::Gt => json_cmp(actual, expected) == Some(Ordering::Greater),
        Operator::Lt => json_cmp(actual, expected) == Some(Ordering::Less),
        Operator::Contains => match (actual, expected) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|item| json_eq(item, needle)),
            _ => false,
        },
        Operator::In => expected
            .as_array()
            .is_some_and(|candidates| candidates.iter().any(|c| json_eq(actual, c))),
        Operator::NotIn => expected
            .as_array()
            .is_some_and(|candidates| !candidates.iter().any(|c| json_eq(actual, c))),
    }
}

/// Numeric equality across integer/float representations, strict `Value`
/// equality otherwise.
fn json_eq(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    a == b
}

/// Ordering for `gt`/`lt`: numbers compare numerically, strings
/// lexicographically. Everything else is a type mismatch and compares as
/// `None` — the leaf fails closed.
fn json_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
        _ => None,
    }
}
