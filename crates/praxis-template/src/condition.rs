//! Progress condition grammar and evaluator.
//!
//! Conditions are a small closed grammar over descendant completion state
//! and named assignment context fields. They are stored as structured data
//! on template nodes, carried verbatim onto assignment nodes, and evaluated
//! by a pure interpreter — no I/O, no side effects.
//!
//! Evaluation is fail-closed: a reference to an unknown node or context
//! field is an error, which callers treat as "condition not met", never as
//! true.
//!
//! # Examples
//!
//! ```json
//! {
//!   "op": "all",
//!   "conditions": [
//!     { "op": "node_completed", "node": "upload-w2" },
//!     { "op": "field", "field": "documents_received", "cmp": "gte", "value": 3 }
//!   ]
//! }
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A boolean expression gating a node's transition into `completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
  /// True when every sub-condition is true. Empty list is true.
  All { conditions: Vec<Condition> },

  /// True when at least one sub-condition is true. Empty list is false.
  Any { conditions: Vec<Condition> },

  /// Negation.
  Not { condition: Box<Condition> },

  /// True when the referenced descendant node has reached `completed`.
  NodeCompleted { node: String },

  /// Compare a named context field against a literal value.
  Field {
    field: String,
    cmp: Comparator,
    value: serde_json::Value,
  },
}

/// Comparison operators for `Condition::Field`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
  Eq,
  Ne,
  Gt,
  Gte,
  Lt,
  Lte,
}

/// Errors produced by condition evaluation.
#[derive(Debug, Error)]
pub enum ConditionError {
  #[error("condition references unknown node '{node}'")]
  UnknownNode { node: String },

  #[error("condition references unknown context field '{field}'")]
  UnknownField { field: String },

  #[error("field '{field}' is not comparable with {cmp:?}")]
  NotComparable { field: String, cmp: Comparator },
}

/// The state a condition is evaluated against.
///
/// `completed` maps descendant node keys (stages, steps, tasks, checklist
/// items, subtasks) to whether they have completed; `fields` are the
/// assignment's context variables.
pub struct EvalContext<'a> {
  pub completed: &'a HashMap<String, bool>,
  pub fields: &'a serde_json::Map<String, serde_json::Value>,
}

impl Condition {
  /// Evaluate the condition against the given context.
  pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<bool, ConditionError> {
    match self {
      Condition::All { conditions } => {
        for c in conditions {
          if !c.evaluate(ctx)? {
            return Ok(false);
          }
        }
        Ok(true)
      }
      Condition::Any { conditions } => {
        for c in conditions {
          if c.evaluate(ctx)? {
            return Ok(true);
          }
        }
        Ok(false)
      }
      Condition::Not { condition } => Ok(!condition.evaluate(ctx)?),
      Condition::NodeCompleted { node } => {
        ctx
          .completed
          .get(node)
          .copied()
          .ok_or_else(|| ConditionError::UnknownNode { node: node.clone() })
      }
      Condition::Field { field, cmp, value } => {
        let actual = ctx
          .fields
          .get(field)
          .ok_or_else(|| ConditionError::UnknownField {
            field: field.clone(),
          })?;
        compare(field, actual, *cmp, value)
      }
    }
  }

  /// Collect every node key referenced by `NodeCompleted` sub-expressions.
  ///
  /// Used by publish-time validation to reject references outside the
  /// referencing node's own subtree.
  pub fn referenced_nodes(&self) -> Vec<&str> {
    let mut refs = Vec::new();
    self.collect_refs(&mut refs);
    refs
  }

  fn collect_refs<'a>(&'a self, refs: &mut Vec<&'a str>) {
    match self {
      Condition::All { conditions } | Condition::Any { conditions } => {
        for c in conditions {
          c.collect_refs(refs);
        }
      }
      Condition::Not { condition } => condition.collect_refs(refs),
      Condition::NodeCompleted { node } => refs.push(node),
      Condition::Field { .. } => {}
    }
  }
}

/// Compare two JSON values with the given operator.
///
/// Equality works on any value; ordering requires both sides to be numbers.
fn compare(
  field: &str,
  actual: &serde_json::Value,
  cmp: Comparator,
  expected: &serde_json::Value,
) -> Result<bool, ConditionError> {
  match cmp {
    Comparator::Eq => Ok(actual == expected),
    Comparator::Ne => Ok(actual != expected),
    Comparator::Gt | Comparator::Gte | Comparator::Lt | Comparator::Lte => {
      let (a, e) = match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(e)) => (a, e),
        _ => {
          return Err(ConditionError::NotComparable {
            field: field.to_string(),
            cmp,
          });
        }
      };
      Ok(match cmp {
        Comparator::Gt => a > e,
        Comparator::Gte => a >= e,
        Comparator::Lt => a < e,
        Comparator::Lte => a <= e,
        _ => unreachable!(),
      })
    }
  }
}
