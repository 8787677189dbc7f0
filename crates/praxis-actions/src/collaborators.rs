//! External collaborator traits.
//!
//! The action executor dispatches to these; implementations live at the
//! application edge (mail gateway, agent platform, HTTP client). All of
//! them are fire-and-forget from the workflow's point of view — a failure
//! is retried by the executor, never by the collaborator.

use async_trait::async_trait;
use praxis_template::Recipient;

use crate::error::ActionError;

/// Notification collaborator.
#[async_trait]
pub trait Notifier: Send + Sync {
  async fn notify(
    &self,
    recipient: &Recipient,
    template_key: &str,
    context: &serde_json::Map<String, serde_json::Value>,
  ) -> Result<(), ActionError>;
}

/// External agent invocation collaborator.
///
/// The reply arrives asynchronously, tagged with `correlation_id`, and
/// re-enters the progression engine as a completion event for the
/// originating task.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
  async fn invoke(
    &self,
    agent_ref: &str,
    task_id: &str,
    input: &serde_json::Value,
    correlation_id: &str,
  ) -> Result<(), ActionError>;
}

/// External HTTP endpoint collaborator.
#[async_trait]
pub trait EndpointCaller: Send + Sync {
  async fn call(
    &self,
    url: &str,
    method: &str,
    payload: &serde_json::Value,
  ) -> Result<(), ActionError>;
}

/// Records the correlation id of an in-flight agent invocation so the
/// asynchronous reply can be routed back to its task.
///
/// Registration happens before the invocation is dispatched, so a fast
/// reply can never race its own registration.
pub trait CorrelationRegistrar: Send + Sync {
  fn register(&self, correlation_id: &str, task_id: &str);
}

/// No-op implementations for tests and for deployments without a given
/// collaborator wired up.
#[derive(Debug, Clone, Default)]
pub struct NoopCollaborators;

#[async_trait]
impl Notifier for NoopCollaborators {
  async fn notify(
    &self,
    _recipient: &Recipient,
    _template_key: &str,
    _context: &serde_json::Map<String, serde_json::Value>,
  ) -> Result<(), ActionError> {
    Ok(())
  }
}

#[async_trait]
impl AgentInvoker for NoopCollaborators {
  async fn invoke(
    &self,
    _agent_ref: &str,
    _task_id: &str,
    _input: &serde_json::Value,
    _correlation_id: &str,
  ) -> Result<(), ActionError> {
    Ok(())
  }
}

#[async_trait]
impl EndpointCaller for NoopCollaborators {
  async fn call(
    &self,
    _url: &str,
    _method: &str,
    _payload: &serde_json::Value,
  ) -> Result<(), ActionError> {
    Ok(())
  }
}

impl CorrelationRegistrar for NoopCollaborators {
  fn register(&self, _correlation_id: &str, _task_id: &str) {}
}
