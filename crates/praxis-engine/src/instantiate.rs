//! Template → assignment instantiation.
//!
//! Deep-clones a published template version into an independent assignment
//! tree bound to one client. The clone is all-or-nothing: the repository
//! persists the full tree in one transaction or none of it. An optional
//! dedup key makes retried scheduler ticks idempotent.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use praxis_assignment::{
  Assignment, AssignmentStage, AssignmentStep, AssignmentTask, AssignmentStatus, ChecklistItem,
  NodeStatus, SubtaskItem,
};
use praxis_store::{AssignmentRepository, Clock, StoreError};
use praxis_template::{StageTemplate, StepTemplate, TaskTemplate, TemplateStore, WorkflowTemplate};
use tracing::{info, instrument};

use crate::error::EngineError;

/// What to instantiate, for whom.
#[derive(Debug, Clone, Default)]
pub struct InstantiateRequest {
  pub template_id: String,
  /// Pin a specific published version; `None` takes the latest.
  pub template_version: Option<u32>,
  pub client_id: String,
  /// Seed values for the assignment's context variables.
  pub overrides: Option<serde_json::Map<String, serde_json::Value>>,
  /// Idempotency key (e.g. a scheduler run id). A second call with the
  /// same key returns the existing assignment instead of creating one.
  pub dedup_key: Option<String>,
}

/// Clones published templates into live assignments.
pub struct Instantiator<T, R> {
  templates: Arc<T>,
  repository: Arc<R>,
  clock: Arc<dyn Clock>,
}

impl<T: TemplateStore, R: AssignmentRepository> Instantiator<T, R> {
  pub fn new(templates: Arc<T>, repository: Arc<R>, clock: Arc<dyn Clock>) -> Self {
    Self {
      templates,
      repository,
      clock,
    }
  }

  /// Instantiate an assignment, returning its id.
  #[instrument(name = "instantiate", skip(self, request), fields(
    template_id = %request.template_id,
    client_id = %request.client_id,
  ))]
  pub async fn instantiate(&self, request: InstantiateRequest) -> Result<String, EngineError> {
    if let Some(dedup_key) = &request.dedup_key {
      if let Some(existing) = self.repository.find_by_dedup_key(dedup_key).await? {
        info!(assignment_id = %existing, dedup_key = %dedup_key, "instantiate_dedup_hit");
        return Ok(existing);
      }
    }

    let template = match request.template_version {
      Some(version) => {
        self
          .templates
          .get_version(&request.template_id, version)
          .await?
      }
      None => self.templates.get_published(&request.template_id).await?,
    };

    let assignment = clone_template(&template, &request, self.clock.now());
    let assignment_id = assignment.assignment_id.clone();

    match self.repository.create_assignment_tree(&assignment).await {
      Ok(()) => {
        info!(
          assignment_id = %assignment_id,
          template_version = template.version,
          nodes = assignment.node_count(),
          "assignment_instantiated"
        );
        Ok(assignment_id)
      }
      // Lost a dedup race: another writer created the assignment between
      // our lookup and our insert. Return theirs.
      Err(StoreError::DuplicateDedupKey { dedup_key }) => {
        let existing = self
          .repository
          .find_by_dedup_key(&dedup_key)
          .await?
          .ok_or(EngineError::NotFound {
            entity: "assignment",
            id: dedup_key,
          })?;
        info!(assignment_id = %existing, "instantiate_dedup_hit");
        Ok(existing)
      }
      Err(source) => Err(EngineError::CloneFailure { source }),
    }
  }
}

/// Build the assignment tree from a template, preserving sibling order and
/// copying automation metadata verbatim.
fn clone_template(
  template: &WorkflowTemplate,
  request: &InstantiateRequest,
  now: DateTime<Utc>,
) -> Assignment {
  let mut stages: Vec<AssignmentStage> = template.stages.iter().map(|s| clone_stage(s)).collect();
  stages.sort_by_key(|s| s.order);

  let mut assignment = Assignment {
    assignment_id: uuid::Uuid::new_v4().to_string(),
    template_id: template.template_id.clone(),
    template_version: template.version,
    client_id: request.client_id.clone(),
    status: AssignmentStatus::NotStarted,
    context: request.overrides.clone().unwrap_or_default(),
    pointer: None,
    revision: 1,
    dedup_key: request.dedup_key.clone(),
    created_at: now,
    updated_at: now,
    stages,
  };
  assignment.pointer = assignment.first_pointer();
  assignment
}

fn clone_stage(template: &StageTemplate) -> AssignmentStage {
  let mut steps: Vec<AssignmentStep> = template.steps.iter().map(clone_step).collect();
  steps.sort_by_key(|s| s.order);

  AssignmentStage {
    node_id: uuid::Uuid::new_v4().to_string(),
    template_ref: template.key.clone(),
    name: template.name.clone(),
    order: template.order,
    status: NodeStatus::Pending,
    auto_progress: template.auto_progress,
    require_all_steps_complete: template.require_all_steps_complete,
    progress_conditions: template.progress_conditions.clone(),
    on_complete_actions: template.on_complete_actions.clone(),
    started_at: None,
    completed_at: None,
    steps,
  }
}

fn clone_step(template: &StepTemplate) -> AssignmentStep {
  let mut tasks: Vec<AssignmentTask> = template.tasks.iter().map(clone_task).collect();
  tasks.sort_by_key(|t| t.order);

  AssignmentStep {
    node_id: uuid::Uuid::new_v4().to_string(),
    template_ref: template.key.clone(),
    name: template.name.clone(),
    order: template.order,
    status: NodeStatus::Pending,
    auto_progress: template.auto_progress,
    require_all_tasks_complete: template.require_all_tasks_complete,
    progress_conditions: template.progress_conditions.clone(),
    on_complete_actions: template.on_complete_actions.clone(),
    started_at: None,
    completed_at: None,
    tasks,
  }
}

fn clone_task(template: &TaskTemplate) -> AssignmentTask {
  AssignmentTask {
    node_id: uuid::Uuid::new_v4().to_string(),
    template_ref: template.key.clone(),
    name: template.name.clone(),
    order: template.order,
    status: NodeStatus::Pending,
    auto_progress: template.auto_progress,
    require_all_checklists_complete: template.require_all_checklists_complete,
    require_all_subtasks_complete: template.require_all_subtasks_complete,
    client_visible: template.client_visible,
    progress_conditions: template.progress_conditions.clone(),
    on_complete_actions: template.on_complete_actions.clone(),
    checklists: template
      .checklists
      .iter()
      .map(|c| ChecklistItem {
        key: c.key.clone(),
        label: c.label.clone(),
        required: c.required,
        checked: false,
        checked_at: None,
      })
      .collect(),
    subtasks: template
      .subtasks
      .iter()
      .map(|s| SubtaskItem {
        key: s.key.clone(),
        title: s.title.clone(),
        required: s.required,
        completed: false,
        completed_at: None,
      })
      .collect(),
    started_at: None,
    completed_at: None,
  }
}
