//! The action executor.
//!
//! The progression engine hands the executor one [`NodeActions`] batch per
//! committed transition. The batch is dispatched on a spawned task —
//! actions within a batch run in list order, batches for different nodes
//! run independently — and the engine never waits for it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use praxis_store::{AssignmentRepository, NodePatch};
use praxis_template::{ActionKind, ActionSpec, EvalContext};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::collaborators::{AgentInvoker, CorrelationRegistrar, EndpointCaller, Notifier};
use crate::error::ActionError;
use crate::render::render_value;

/// The actions of one transitioned node, with everything needed to
/// evaluate guards and render payloads.
#[derive(Debug, Clone)]
pub struct NodeActions {
  pub assignment_id: String,
  pub node_id: String,
  /// Descendant completion booleans for guard evaluation.
  pub completed: HashMap<String, bool>,
  /// Assignment context variables for guards and payload rendering.
  pub context: serde_json::Map<String, serde_json::Value>,
  pub actions: Vec<ActionSpec>,
}

/// Node ids whose not-yet-dispatched actions must be dropped.
///
/// Fed by cancellation: cancelling a node suppresses its pending actions,
/// but actions already handed to a collaborator are not recalled.
#[derive(Debug, Clone, Default)]
pub struct SuppressionSet {
  inner: Arc<Mutex<HashSet<String>>>,
}

impl SuppressionSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn suppress(&self, node_id: &str) {
    self
      .inner
      .lock()
      .expect("suppression lock poisoned")
      .insert(node_id.to_string());
  }

  pub fn is_suppressed(&self, node_id: &str) -> bool {
    self
      .inner
      .lock()
      .expect("suppression lock poisoned")
      .contains(node_id)
  }
}

/// An action that exhausted its retry policy. Kept for the observability
/// channel; the triggering transition is unaffected.
#[derive(Debug, Clone)]
pub struct FailedAction {
  pub assignment_id: String,
  pub node_id: String,
  pub action_index: usize,
  pub attempts: u32,
  pub error: String,
}

/// Dispatches completion actions to collaborators with bounded retry.
pub struct ActionExecutor<R: AssignmentRepository> {
  notifier: Arc<dyn Notifier>,
  agents: Arc<dyn AgentInvoker>,
  endpoints: Arc<dyn EndpointCaller>,
  correlations: Arc<dyn CorrelationRegistrar>,
  repository: Arc<R>,
  suppressed: SuppressionSet,
  failed: Arc<Mutex<Vec<FailedAction>>>,
  shutdown: CancellationToken,
}

impl<R: AssignmentRepository> Clone for ActionExecutor<R> {
  fn clone(&self) -> Self {
    Self {
      notifier: self.notifier.clone(),
      agents: self.agents.clone(),
      endpoints: self.endpoints.clone(),
      correlations: self.correlations.clone(),
      repository: self.repository.clone(),
      suppressed: self.suppressed.clone(),
      failed: self.failed.clone(),
      shutdown: self.shutdown.clone(),
    }
  }
}

impl<R: AssignmentRepository + 'static> ActionExecutor<R> {
  pub fn new(
    notifier: Arc<dyn Notifier>,
    agents: Arc<dyn AgentInvoker>,
    endpoints: Arc<dyn EndpointCaller>,
    correlations: Arc<dyn CorrelationRegistrar>,
    repository: Arc<R>,
    shutdown: CancellationToken,
  ) -> Self {
    Self {
      notifier,
      agents,
      endpoints,
      correlations,
      repository,
      suppressed: SuppressionSet::new(),
      failed: Arc::new(Mutex::new(Vec::new())),
      shutdown,
    }
  }

  /// The suppression set cancellation feeds.
  pub fn suppression(&self) -> &SuppressionSet {
    &self.suppressed
  }

  /// Actions that exhausted their retries since startup.
  pub fn failed_actions(&self) -> Vec<FailedAction> {
    self.failed.lock().expect("failed-actions lock poisoned").clone()
  }

  /// Dispatch a node's actions asynchronously. Returns immediately; the
  /// caller's transition is already committed and is never rolled back by
  /// anything that happens here.
  pub fn dispatch(&self, batch: NodeActions) {
    if batch.actions.is_empty() {
      return;
    }
    let executor = self.clone();
    tokio::spawn(async move {
      executor.run_batch(batch).await;
    });
  }

  #[instrument(name = "action_batch", skip(self, batch), fields(
    assignment_id = %batch.assignment_id,
    node_id = %batch.node_id,
  ))]
  async fn run_batch(&self, batch: NodeActions) {
    for (index, spec) in batch.actions.iter().enumerate() {
      if self.shutdown.is_cancelled() {
        return;
      }
      if self.suppressed.is_suppressed(&batch.node_id) {
        info!(action_index = index, "actions_suppressed");
        return;
      }

      if let Some(guard) = &spec.guard {
        let ctx = EvalContext {
          completed: &batch.completed,
          fields: &batch.context,
        };
        // A failing or erroring guard skips the action; guards are
        // fail-closed like progress conditions.
        match guard.evaluate(&ctx) {
          Ok(true) => {}
          Ok(false) => {
            debug!(action_index = index, "action_guard_false");
            continue;
          }
          Err(e) => {
            debug!(action_index = index, error = %e, "action_guard_error");
            continue;
          }
        }
      }

      self.run_with_retry(&batch, index, spec).await;
    }
  }

  async fn run_with_retry(&self, batch: &NodeActions, index: usize, spec: &ActionSpec) {
    let max_attempts = spec.retry.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
      let delay = spec.retry.delay_before(attempt);
      if !delay.is_zero() {
        tokio::select! {
          _ = tokio::time::sleep(delay) => {}
          _ = self.shutdown.cancelled() => return,
        }
      }
      if self.suppressed.is_suppressed(&batch.node_id) {
        info!(action_index = index, "actions_suppressed");
        return;
      }

      match self.dispatch_once(batch, spec).await {
        Ok(()) => {
          info!(action_index = index, attempt, "action_dispatched");
          return;
        }
        Err(e) => {
          warn!(action_index = index, attempt, error = %e, "action_attempt_failed");
          last_error = e.to_string();
        }
      }
    }

    error!(action_index = index, attempts = max_attempts, "action_failed");
    self
      .failed
      .lock()
      .expect("failed-actions lock poisoned")
      .push(FailedAction {
        assignment_id: batch.assignment_id.clone(),
        node_id: batch.node_id.clone(),
        action_index: index,
        attempts: max_attempts,
        error: last_error,
      });
  }

  async fn dispatch_once(&self, batch: &NodeActions, spec: &ActionSpec) -> Result<(), ActionError> {
    match &spec.kind {
      ActionKind::Notify {
        recipient,
        template_key,
        context,
      } => {
        let rendered = render_value(&serde_json::Value::Object(context.clone()), &batch.context);
        let rendered = rendered.as_object().cloned().unwrap_or_default();
        self.notifier.notify(recipient, template_key, &rendered).await
      }

      ActionKind::InvokeAgent {
        agent_ref,
        input,
        target,
      } => {
        let task_id = match target {
          Some(key) => {
            let assignment = self.repository.get_assignment(&batch.assignment_id).await?;
            find_task_by_template_ref(&assignment, key).ok_or_else(|| {
              ActionError::dispatch(format!("invoke_agent target '{key}' not found"))
            })?
          }
          None => batch.node_id.clone(),
        };
        let correlation_id = uuid::Uuid::new_v4().to_string();
        // Register first so a fast reply cannot race its own registration.
        self.correlations.register(&correlation_id, &task_id);
        let input = render_value(input, &batch.context);
        self
          .agents
          .invoke(agent_ref, &task_id, &input, &correlation_id)
          .await
      }

      ActionKind::CallEndpoint {
        url,
        method,
        payload,
      } => {
        let url = match render_value(&serde_json::Value::String(url.clone()), &batch.context) {
          serde_json::Value::String(s) => s,
          _ => url.clone(),
        };
        let payload = render_value(payload, &batch.context);
        self.endpoints.call(&url, method, &payload).await
      }

      ActionKind::SetVisibility {
        client_visible,
        target,
      } => {
        let assignment = self.repository.get_assignment(&batch.assignment_id).await?;
        let node_id = match target {
          Some(key) => find_task_by_template_ref(&assignment, key).ok_or_else(|| {
            ActionError::dispatch(format!("set_visibility target '{key}' not found"))
          })?,
          None => batch.node_id.clone(),
        };
        self
          .repository
          .update_node(
            &batch.assignment_id,
            &node_id,
            assignment.revision,
            NodePatch {
              client_visible: Some(*client_visible),
            },
          )
          .await?;
        Ok(())
      }
    }
  }
}

fn find_task_by_template_ref(
  assignment: &praxis_assignment::Assignment,
  template_ref: &str,
) -> Option<String> {
  for stage in &assignment.stages {
    for step in &stage.steps {
      for task in &step.tasks {
        if task.template_ref == template_ref {
          return Some(task.node_id.clone());
        }
      }
    }
  }
  None
}
