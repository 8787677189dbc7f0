//! Correlation ids for in-flight agent invocations.

use std::collections::HashMap;
use std::sync::Mutex;

use praxis_actions::CorrelationRegistrar;

/// Maps correlation ids of dispatched `invoke_agent` actions to the task
/// awaiting the result. Entries are consumed when the reply arrives.
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
  inner: Mutex<HashMap<String, String>>,
}

impl CorrelationRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Consume a correlation id, returning the task it belongs to.
  pub fn take(&self, correlation_id: &str) -> Option<String> {
    self
      .inner
      .lock()
      .expect("correlation lock poisoned")
      .remove(correlation_id)
  }

  /// Number of replies still outstanding.
  pub fn pending(&self) -> usize {
    self.inner.lock().expect("correlation lock poisoned").len()
  }
}

impl CorrelationRegistrar for CorrelationRegistry {
  fn register(&self, correlation_id: &str, task_id: &str) {
    self
      .inner
      .lock()
      .expect("correlation lock poisoned")
      .insert(correlation_id.to_string(), task_id.to_string());
  }
}
