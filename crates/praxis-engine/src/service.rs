//! The workflow service facade.
//!
//! [`WorkflowService`] is what the rest of the application talks to. It
//! wires the template store, repository, instantiator, progression engine,
//! and action executor together, and routes asynchronous agent replies
//! back into the same completion entry point human events use.

use std::sync::Arc;

use praxis_actions::{ActionExecutor, AgentInvoker, EndpointCaller, Notifier};
use praxis_assignment::AssignmentStatus;
use praxis_store::{AssignmentRepository, Clock, FollowupState, RecurringSchedule, TaskFollowup};
use praxis_template::{TemplateStore, WorkflowTemplate};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::correlation::CorrelationRegistry;
use crate::error::EngineError;
use crate::instantiate::{InstantiateRequest, Instantiator};
use crate::progression::{
  AgentResult, AssignmentSnapshot, CompletionEvidence, ProgressionEngine,
};

/// The exposed API of the workflow subsystem.
pub struct WorkflowService<T, R: AssignmentRepository> {
  templates: Arc<T>,
  repository: Arc<R>,
  instantiator: Instantiator<T, R>,
  engine: ProgressionEngine<R>,
  correlations: Arc<CorrelationRegistry>,
}

impl<T: TemplateStore, R: AssignmentRepository + 'static> WorkflowService<T, R> {
  pub fn new(
    templates: Arc<T>,
    repository: Arc<R>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    agents: Arc<dyn AgentInvoker>,
    endpoints: Arc<dyn EndpointCaller>,
    shutdown: CancellationToken,
  ) -> Self {
    let correlations = Arc::new(CorrelationRegistry::new());
    let actions = ActionExecutor::new(
      notifier,
      agents,
      endpoints,
      correlations.clone(),
      repository.clone(),
      shutdown,
    );
    let instantiator = Instantiator::new(templates.clone(), repository.clone(), clock.clone());
    let engine = ProgressionEngine::new(repository.clone(), actions, clock);
    Self {
      templates,
      repository,
      instantiator,
      engine,
      correlations,
    }
  }

  /// Validate and publish a template draft, returning the new version.
  pub async fn publish_template(&self, draft: WorkflowTemplate) -> Result<u32, EngineError> {
    let version = self.templates.publish(draft).await?;
    Ok(version)
  }

  /// Instantiate an assignment from a template for a client.
  pub async fn instantiate_assignment(
    &self,
    request: InstantiateRequest,
  ) -> Result<String, EngineError> {
    self.instantiator.instantiate(request).await
  }

  /// Report a node completed, with optional evidence.
  pub async fn report_completion(
    &self,
    node_id: &str,
    evidence: CompletionEvidence,
  ) -> Result<AssignmentSnapshot, EngineError> {
    self.engine.report_completion(node_id, evidence).await
  }

  /// Apply checklist/subtask marks without an explicit completion event.
  pub async fn update_task_items(
    &self,
    task_id: &str,
    evidence: CompletionEvidence,
  ) -> Result<AssignmentSnapshot, EngineError> {
    self.engine.update_task_items(task_id, evidence).await
  }

  /// Explicitly begin work on a task.
  pub async fn start_task(&self, task_id: &str) -> Result<AssignmentSnapshot, EngineError> {
    self.engine.start_task(task_id).await
  }

  /// Skip a node.
  pub async fn skip_node(&self, node_id: &str) -> Result<AssignmentSnapshot, EngineError> {
    self.engine.skip_node(node_id).await
  }

  /// Cancel a node and its unfinished descendants.
  pub async fn cancel_node(&self, node_id: &str) -> Result<AssignmentSnapshot, EngineError> {
    self.engine.cancel_node(node_id).await
  }

  /// Cancel an assignment outright.
  pub async fn cancel_assignment(
    &self,
    assignment_id: &str,
  ) -> Result<AssignmentSnapshot, EngineError> {
    self.engine.cancel_assignment(assignment_id).await
  }

  /// Move the assignment between non-terminal statuses.
  pub async fn set_assignment_status(
    &self,
    assignment_id: &str,
    status: AssignmentStatus,
  ) -> Result<AssignmentSnapshot, EngineError> {
    self.engine.set_assignment_status(assignment_id, status).await
  }

  /// Current state of an assignment.
  pub async fn get_assignment_snapshot(
    &self,
    assignment_id: &str,
  ) -> Result<AssignmentSnapshot, EngineError> {
    self.engine.get_snapshot(assignment_id).await
  }

  /// Route an agent's asynchronous reply back into the state machine as a
  /// synthetic completion event for the originating task.
  pub async fn on_agent_result(
    &self,
    correlation_id: &str,
    result: AgentResult,
  ) -> Result<AssignmentSnapshot, EngineError> {
    let task_id =
      self
        .correlations
        .take(correlation_id)
        .ok_or_else(|| EngineError::UnknownCorrelation {
          correlation_id: correlation_id.to_string(),
        })?;

    match result {
      AgentResult::Output { output } => {
        info!(correlation_id = %correlation_id, task_id = %task_id, "agent_result_received");
        let mut evidence = CompletionEvidence::default();
        evidence.context.insert("agent_output".to_string(), output);
        self.engine.report_completion(&task_id, evidence).await
      }
      AgentResult::Error { message } => {
        self.engine.record_agent_failure(&task_id, &message).await
      }
    }
  }

  /// Insert or update a recurring schedule.
  pub async fn upsert_recurring_schedule(
    &self,
    mut schedule: RecurringSchedule,
  ) -> Result<(), EngineError> {
    schedule.interval = schedule.interval.max(1);
    self.repository.upsert_schedule(&schedule).await?;
    info!(schedule_id = %schedule.schedule_id, "schedule_upserted");
    Ok(())
  }

  /// Stop future ticks of a schedule. Already-instantiated assignments are
  /// unaffected.
  pub async fn cancel_recurring_schedule(&self, schedule_id: &str) -> Result<(), EngineError> {
    let mut schedule = self.repository.get_schedule(schedule_id).await?;
    schedule.is_active = false;
    self.repository.upsert_schedule(&schedule).await?;
    info!(schedule_id = %schedule_id, "schedule_cancelled");
    Ok(())
  }

  /// Attach a followup to an assignment task.
  pub async fn add_followup(&self, followup: TaskFollowup) -> Result<(), EngineError> {
    // The task must exist; followups on unknown nodes would tick forever.
    self
      .repository
      .find_assignment_by_node(&followup.task_id)
      .await?;
    self.repository.upsert_followup(&followup).await?;
    Ok(())
  }

  pub async fn pause_followup(&self, followup_id: &str) -> Result<(), EngineError> {
    self
      .transition_followup(followup_id, FollowupState::Active, FollowupState::Paused)
      .await
  }

  pub async fn resume_followup(&self, followup_id: &str) -> Result<(), EngineError> {
    self
      .transition_followup(followup_id, FollowupState::Paused, FollowupState::Active)
      .await
  }

  pub async fn cancel_followup(&self, followup_id: &str) -> Result<(), EngineError> {
    let mut followup = self.repository.get_followup(followup_id).await?;
    if followup.state.is_terminal() {
      return Err(EngineError::invalid_state(format!(
        "followup '{followup_id}' is already terminal"
      )));
    }
    followup.state = FollowupState::Cancelled;
    self.repository.upsert_followup(&followup).await?;
    Ok(())
  }

  async fn transition_followup(
    &self,
    followup_id: &str,
    from: FollowupState,
    to: FollowupState,
  ) -> Result<(), EngineError> {
    let mut followup = self.repository.get_followup(followup_id).await?;
    if followup.state != from {
      return Err(EngineError::invalid_state(format!(
        "followup '{followup_id}' is {:?}, expected {from:?}",
        followup.state
      )));
    }
    followup.state = to;
    self.repository.upsert_followup(&followup).await?;
    Ok(())
  }
}
