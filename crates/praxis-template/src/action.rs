//! Completion action specifications.
//!
//! Actions are a closed, tagged variant set dispatched by the action
//! executor when a node transitions into `completed`. A new action kind is a
//! new case here plus a dispatch arm in the executor, not a new subclass
//! hierarchy.

use serde::{Deserialize, Serialize};

use crate::condition::Condition;

/// A configured side effect attached to a node's completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
  #[serde(flatten)]
  pub kind: ActionKind,

  /// Action-local gate, evaluated against the same context as progress
  /// conditions. A failed or erroring guard skips the action silently.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub guard: Option<Condition>,

  #[serde(default)]
  pub retry: RetryPolicy,
}

/// The closed set of action kinds.
///
/// String payload fields may contain `{{ ... }}` placeholders rendered
/// against assignment context before dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
  /// Send a notification through the notification collaborator.
  Notify {
    recipient: Recipient,
    template_key: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    context: serde_json::Map<String, serde_json::Value>,
  },

  /// Invoke an external agent; its asynchronous reply re-enters the
  /// progression engine as a completion event for the target task.
  /// `target` names that task by template key — typically the next task in
  /// the flow, handed off when this node completes. Without a target the
  /// reply is correlated to the node carrying the action.
  InvokeAgent {
    agent_ref: String,
    #[serde(default)]
    input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
  },

  /// Call an external HTTP endpoint.
  CallEndpoint {
    url: String,
    method: String,
    #[serde(default)]
    payload: serde_json::Value,
  },

  /// Change a task's client visibility. `target` names the task to change
  /// by template key; when absent the action applies to its own node.
  SetVisibility {
    client_visible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
  },
}

/// Who a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recipient {
  /// The client the assignment is bound to.
  Client,
  /// The internal user responsible for the assignment.
  Assignee,
  /// A specific user.
  User { user_id: String },
}

/// Bounded retry policy for action dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub base_delay_ms: u64,
  pub backoff: RetryBackoff,
}

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBackoff {
  None,
  Fixed,
  Exponential,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay_ms: 500,
      backoff: RetryBackoff::Exponential,
    }
  }
}

impl RetryPolicy {
  /// Delay before the given attempt (1-based). Attempt 1 runs immediately.
  pub fn delay_before(&self, attempt: u32) -> std::time::Duration {
    if attempt <= 1 {
      return std::time::Duration::ZERO;
    }
    let ms = match self.backoff {
      RetryBackoff::None => 0,
      RetryBackoff::Fixed => self.base_delay_ms,
      RetryBackoff::Exponential => {
        self.base_delay_ms.saturating_mul(1u64 << (attempt - 2).min(16))
      }
    };
    std::time::Duration::from_millis(ms)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn exponential_backoff_doubles() {
    let policy = RetryPolicy {
      max_attempts: 4,
      base_delay_ms: 100,
      backoff: RetryBackoff::Exponential,
    };
    assert_eq!(policy.delay_before(1).as_millis(), 0);
    assert_eq!(policy.delay_before(2).as_millis(), 100);
    assert_eq!(policy.delay_before(3).as_millis(), 200);
    assert_eq!(policy.delay_before(4).as_millis(), 400);
  }

  #[test]
  fn action_spec_deserializes_tagged() {
    let spec: ActionSpec = serde_json::from_value(serde_json::json!({
      "type": "notify",
      "recipient": { "kind": "client" },
      "template_key": "stage-complete"
    }))
    .unwrap();

    assert!(matches!(spec.kind, ActionKind::Notify { .. }));
    assert_eq!(spec.retry.max_attempts, 3);
  }
}
