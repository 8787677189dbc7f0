//! The hierarchical progression state machine.
//!
//! Stages, steps, and tasks share one isomorphic state machine
//! (`pending → in_progress → completed`, with `skipped` and `cancelled` as
//! alternative terminals). The engine consumes completion events, checks
//! completion rules and progress conditions, and cascades completion
//! bottom-up: a completed task may complete its step, the step its stage,
//! and the last stage the assignment — bounded by tree depth.
//!
//! All mutations from one event are committed atomically under the
//! repository's optimistic revision; action dispatch happens strictly
//! after the commit and can never roll it back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use praxis_actions::{ActionExecutor, NodeActions};
use praxis_assignment::{Assignment, AssignmentStatus, CurrentPointer, NodePath, NodeStatus};
use praxis_store::{AssignmentRepository, Clock, FollowupState};
use praxis_template::{Condition, EvalContext};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::error::EngineError;

/// Evidence accompanying a completion event: checklist items to check,
/// subtasks to complete, and context variables to merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionEvidence {
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub checked_items: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub completed_subtasks: Vec<String>,
  #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
  pub context: serde_json::Map<String, serde_json::Value>,
}

/// The outcome of an asynchronous agent invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AgentResult {
  Output { output: serde_json::Value },
  Error { message: String },
}

/// A read-only view of an assignment with its derived progress.
#[derive(Debug, Clone, Serialize)]
pub struct AssignmentSnapshot {
  pub progress: u8,
  #[serde(flatten)]
  pub assignment: Assignment,
}

impl AssignmentSnapshot {
  fn of(assignment: Assignment) -> Self {
    Self {
      progress: assignment.progress(),
      assignment,
    }
  }
}

/// Drives assignment trees through the hierarchical state machine.
pub struct ProgressionEngine<R: AssignmentRepository> {
  repository: Arc<R>,
  actions: ActionExecutor<R>,
  clock: Arc<dyn Clock>,
}

impl<R: AssignmentRepository + 'static> ProgressionEngine<R> {
  pub fn new(repository: Arc<R>, actions: ActionExecutor<R>, clock: Arc<dyn Clock>) -> Self {
    Self {
      repository,
      actions,
      clock,
    }
  }

  /// Explicitly begin work on a leaf task.
  #[instrument(name = "start_task", skip(self))]
  pub async fn start_task(&self, task_id: &str) -> Result<AssignmentSnapshot, EngineError> {
    let (mut assignment, path) = self.load_by_node(task_id).await?;
    let expected = assignment.revision;

    let NodePath::Task(..) = path else {
      return Err(EngineError::invalid_state(format!(
        "node '{task_id}' is not a task"
      )));
    };
    if assignment.node_status(path) != NodeStatus::Pending {
      return Err(EngineError::invalid_state(format!(
        "task '{task_id}' is not pending"
      )));
    }

    let now = self.clock.now();
    mark_chain_in_progress(&mut assignment, path, now);
    self.commit(assignment, expected, Vec::new()).await
  }

  /// Apply checklist/subtask marks and context updates to a task. If the
  /// task has `auto_progress` and its completion rule now holds, it
  /// completes — and may cascade — without a separate explicit event.
  #[instrument(name = "update_task_items", skip(self, evidence))]
  pub async fn update_task_items(
    &self,
    task_id: &str,
    evidence: CompletionEvidence,
  ) -> Result<AssignmentSnapshot, EngineError> {
    let (mut assignment, path) = self.load_by_node(task_id).await?;
    let expected = assignment.revision;

    let NodePath::Task(..) = path else {
      return Err(EngineError::invalid_state(format!(
        "node '{task_id}' is not a task"
      )));
    };
    self.ensure_mutable(&assignment, path, task_id)?;

    let now = self.clock.now();
    apply_evidence(&mut assignment, path, &evidence, now)?;
    mark_chain_in_progress(&mut assignment, path, now);

    let mut transitioned = Vec::new();
    let auto = assignment.task(path).map(|t| t.auto_progress).unwrap_or(false);
    if auto && completion_rule(&assignment, path).is_ok() {
      set_completed(&mut assignment, path, now);
      transitioned.push(path);
      cascade_up(&mut assignment, path, now, &mut transitioned);
      advance_pointer(&mut assignment, path);
    }

    self.commit(assignment, expected, transitioned).await
  }

  /// Report a node (task, step, or stage) as completed.
  ///
  /// This is the single entry point for human completions and synthetic
  /// agent-reply completions alike. A failed completion rule rejects the
  /// whole event — evidence included — with `PreconditionNotMet` and
  /// leaves the node unchanged.
  #[instrument(name = "report_completion", skip(self, evidence))]
  pub async fn report_completion(
    &self,
    node_id: &str,
    evidence: CompletionEvidence,
  ) -> Result<AssignmentSnapshot, EngineError> {
    let (mut assignment, path) = self.load_by_node(node_id).await?;
    let expected = assignment.revision;
    self.ensure_mutable(&assignment, path, node_id)?;

    let now = self.clock.now();
    apply_evidence(&mut assignment, path, &evidence, now)?;

    if let Err(reason) = completion_rule(&assignment, path) {
      info!(node_id = %node_id, reason = %reason, "completion_rejected");
      return Err(EngineError::PreconditionNotMet {
        node_id: node_id.to_string(),
        reason,
      });
    }

    mark_chain_in_progress(&mut assignment, path, now);
    set_completed(&mut assignment, path, now);
    let mut transitioned = vec![path];
    cascade_up(&mut assignment, path, now, &mut transitioned);
    advance_pointer(&mut assignment, path);

    info!(
      node_id = %node_id,
      cascade_depth = transitioned.len(),
      status = ?assignment.status,
      "node_completed"
    );
    self.commit(assignment, expected, transitioned).await
  }

  /// Skip a node: an alternative terminal that satisfies parent completion
  /// rules without firing the node's own completion actions.
  #[instrument(name = "skip_node", skip(self))]
  pub async fn skip_node(&self, node_id: &str) -> Result<AssignmentSnapshot, EngineError> {
    let (mut assignment, path) = self.load_by_node(node_id).await?;
    let expected = assignment.revision;
    self.ensure_mutable(&assignment, path, node_id)?;

    let now = self.clock.now();
    for descendant in subtree_paths(&assignment, path) {
      if !assignment.node_status(descendant).is_terminal() {
        set_status(&mut assignment, descendant, NodeStatus::Skipped, now);
      }
    }

    // A skipped sibling can be the last thing a parent was waiting on.
    let mut transitioned = Vec::new();
    cascade_up(&mut assignment, path, now, &mut transitioned);
    advance_pointer(&mut assignment, path);

    info!(node_id = %node_id, "node_skipped");
    self.commit(assignment, expected, transitioned).await
  }

  /// Cancel a node and its still-pending/in-progress descendants.
  ///
  /// Non-retroactive: completed work is untouched, and actions already
  /// dispatched are not recalled. Not-yet-dispatched actions for the
  /// cancelled nodes are suppressed.
  #[instrument(name = "cancel_node", skip(self))]
  pub async fn cancel_node(&self, node_id: &str) -> Result<AssignmentSnapshot, EngineError> {
    let (mut assignment, path) = self.load_by_node(node_id).await?;
    let expected = assignment.revision;
    self.ensure_mutable(&assignment, path, node_id)?;

    let now = self.clock.now();
    let mut cancelled_tasks = Vec::new();
    for descendant in subtree_paths(&assignment, path) {
      // Suppress queued actions for the whole subtree — including
      // completed nodes whose actions may still be awaiting a retry.
      // Actions already handed to a collaborator are not recalled.
      let id = node_id_at(&assignment, descendant);
      self.actions.suppression().suppress(&id);
      if !assignment.node_status(descendant).is_terminal() {
        set_status(&mut assignment, descendant, NodeStatus::Cancelled, now);
        if let NodePath::Task(..) = descendant {
          cancelled_tasks.push(id);
        }
      }
    }
    advance_pointer(&mut assignment, path);

    info!(node_id = %node_id, "node_cancelled");
    let snapshot = self.commit(assignment, expected, Vec::new()).await?;
    self.cancel_followups(&cancelled_tasks).await;
    Ok(snapshot)
  }

  /// Cancel the whole assignment. The tree becomes a read-only audit
  /// record.
  #[instrument(name = "cancel_assignment", skip(self))]
  pub async fn cancel_assignment(
    &self,
    assignment_id: &str,
  ) -> Result<AssignmentSnapshot, EngineError> {
    let mut assignment = self.repository.get_assignment(assignment_id).await?;
    let expected = assignment.revision;
    if assignment.status.is_terminal() {
      return Err(EngineError::invalid_state(format!(
        "assignment '{assignment_id}' is already terminal"
      )));
    }

    let now = self.clock.now();
    let mut cancelled_tasks = Vec::new();
    for si in 0..assignment.stages.len() {
      for descendant in subtree_paths(&assignment, NodePath::Stage(si)) {
        let id = node_id_at(&assignment, descendant);
        self.actions.suppression().suppress(&id);
        if !assignment.node_status(descendant).is_terminal() {
          set_status(&mut assignment, descendant, NodeStatus::Cancelled, now);
          if let NodePath::Task(..) = descendant {
            cancelled_tasks.push(id);
          }
        }
      }
    }
    assignment.status = AssignmentStatus::Cancelled;
    assignment.pointer = None;

    info!(assignment_id = %assignment_id, "assignment_cancelled");
    let snapshot = self.commit(assignment, expected, Vec::new()).await?;
    self.cancel_followups(&cancelled_tasks).await;
    Ok(snapshot)
  }

  /// Move the assignment between non-terminal statuses (`in_progress`,
  /// `waiting_client`, `review`). Terminal transitions go through
  /// completion or cancellation.
  pub async fn set_assignment_status(
    &self,
    assignment_id: &str,
    status: AssignmentStatus,
  ) -> Result<AssignmentSnapshot, EngineError> {
    if status.is_terminal() || status == AssignmentStatus::NotStarted {
      return Err(EngineError::invalid_state(format!(
        "cannot set assignment status to {status:?} directly"
      )));
    }
    let mut assignment = self.repository.get_assignment(assignment_id).await?;
    let expected = assignment.revision;
    if assignment.status.is_terminal() {
      return Err(EngineError::invalid_state(format!(
        "assignment '{assignment_id}' is terminal"
      )));
    }
    assignment.status = status;
    self.commit(assignment, expected, Vec::new()).await
  }

  /// Record a failed agent invocation against its task. The failure is
  /// kept in the assignment context for a human retry; the task stays
  /// where it is and never completes off an error.
  #[instrument(name = "record_agent_failure", skip(self, message))]
  pub async fn record_agent_failure(
    &self,
    task_id: &str,
    message: &str,
  ) -> Result<AssignmentSnapshot, EngineError> {
    let (mut assignment, path) = self.load_by_node(task_id).await?;
    let expected = assignment.revision;
    self.ensure_mutable(&assignment, path, task_id)?;

    let now = self.clock.now();
    mark_chain_in_progress(&mut assignment, path, now);
    assignment.context.insert(
      format!("{}_agent_error", template_ref_at(&assignment, path)),
      serde_json::Value::String(message.to_string()),
    );
    warn!(task_id = %task_id, error = %message, "agent_invocation_failed");
    self.commit(assignment, expected, Vec::new()).await
  }

  /// Current state of an assignment.
  pub async fn get_snapshot(&self, assignment_id: &str) -> Result<AssignmentSnapshot, EngineError> {
    let assignment = self.repository.get_assignment(assignment_id).await?;
    Ok(AssignmentSnapshot::of(assignment))
  }

  async fn load_by_node(&self, node_id: &str) -> Result<(Assignment, NodePath), EngineError> {
    let assignment_id = self.repository.find_assignment_by_node(node_id).await?;
    let assignment = self.repository.get_assignment(&assignment_id).await?;
    let path = assignment.locate(node_id).ok_or(EngineError::NotFound {
      entity: "node",
      id: node_id.to_string(),
    })?;
    Ok((assignment, path))
  }

  fn ensure_mutable(
    &self,
    assignment: &Assignment,
    path: NodePath,
    node_id: &str,
  ) -> Result<(), EngineError> {
    if assignment.status.is_terminal() {
      return Err(EngineError::invalid_state(format!(
        "assignment '{}' is terminal and read-only",
        assignment.assignment_id
      )));
    }
    if assignment.node_status(path).is_terminal() {
      return Err(EngineError::invalid_state(format!(
        "node '{node_id}' is already terminal"
      )));
    }
    Ok(())
  }

  /// Commit the mutated tree, then dispatch the completed nodes' actions.
  async fn commit(
    &self,
    mut assignment: Assignment,
    expected_revision: u64,
    transitioned: Vec<NodePath>,
  ) -> Result<AssignmentSnapshot, EngineError> {
    assignment.updated_at = self.clock.now();
    let new_revision = self
      .repository
      .commit_assignment(&assignment, expected_revision)
      .await?;
    assignment.revision = new_revision;

    let mut completed_tasks = Vec::new();
    for path in transitioned {
      let node_id = node_id_at(&assignment, path);
      if let NodePath::Task(..) = path {
        completed_tasks.push(node_id.clone());
      }
      let actions = actions_at(&assignment, path);
      if actions.is_empty() {
        continue;
      }
      self.actions.dispatch(NodeActions {
        assignment_id: assignment.assignment_id.clone(),
        node_id,
        completed: assignment.completion_scope(path),
        context: assignment.context.clone(),
        actions,
      });
    }

    self.cancel_followups(&completed_tasks).await;
    Ok(AssignmentSnapshot::of(assignment))
  }

  /// Retire the active followups of tasks that reached a terminal state.
  /// Best-effort: a storage hiccup here never fails the transition.
  async fn cancel_followups(&self, task_ids: &[String]) {
    for task_id in task_ids {
      let followups = match self.repository.list_followups_for_task(task_id).await {
        Ok(followups) => followups,
        Err(e) => {
          warn!(task_id = %task_id, error = %e, "followup_lookup_failed");
          continue;
        }
      };
      for mut followup in followups {
        if followup.state.is_terminal() {
          continue;
        }
        followup.state = FollowupState::Cancelled;
        if let Err(e) = self.repository.upsert_followup(&followup).await {
          warn!(followup_id = %followup.followup_id, error = %e, "followup_cancel_failed");
        }
      }
    }
  }
}

/// Merge evidence into the tree. Checklist/subtask marks are only valid on
/// a task; context merges apply to any node.
fn apply_evidence(
  assignment: &mut Assignment,
  path: NodePath,
  evidence: &CompletionEvidence,
  now: DateTime<Utc>,
) -> Result<(), EngineError> {
  for (key, value) in &evidence.context {
    assignment.context.insert(key.clone(), value.clone());
  }

  if evidence.checked_items.is_empty() && evidence.completed_subtasks.is_empty() {
    return Ok(());
  }

  let NodePath::Task(si, pi, ti) = path else {
    return Err(EngineError::invalid_state(
      "checklist and subtask evidence only applies to tasks".to_string(),
    ));
  };
  let task = &mut assignment.stages[si].steps[pi].tasks[ti];

  for key in &evidence.checked_items {
    let item = task
      .checklists
      .iter_mut()
      .find(|c| &c.key == key)
      .ok_or_else(|| {
        EngineError::invalid_state(format!("unknown checklist item '{key}'"))
      })?;
    if !item.checked {
      item.checked = true;
      item.checked_at = Some(now);
    }
  }

  for key in &evidence.completed_subtasks {
    let sub = task
      .subtasks
      .iter_mut()
      .find(|s| &s.key == key)
      .ok_or_else(|| EngineError::invalid_state(format!("unknown subtask '{key}'")))?;
    if !sub.completed {
      sub.completed = true;
      sub.completed_at = Some(now);
    }
  }

  Ok(())
}

/// Check whether the node at `path` may transition into `completed`:
/// structural prerequisites first, then progress conditions (fail-closed).
fn completion_rule(assignment: &Assignment, path: NodePath) -> Result<(), String> {
  match path {
    NodePath::Task(..) => {
      let task = assignment.task(path).expect("task path");
      if !task.prerequisites_met() {
        return Err("required checklist items or subtasks are incomplete".to_string());
      }
    }
    NodePath::Step(si, pi) => {
      let step = &assignment.stages[si].steps[pi];
      if step.require_all_tasks_complete
        && !step.tasks.iter().all(|t| t.status.counts_as_complete())
      {
        return Err("required tasks are incomplete".to_string());
      }
    }
    NodePath::Stage(si) => {
      let stage = &assignment.stages[si];
      if stage.require_all_steps_complete
        && !stage.steps.iter().all(|s| s.status.counts_as_complete())
      {
        return Err("required steps are incomplete".to_string());
      }
    }
  }

  if let Some(condition) = conditions_at(assignment, path) {
    let scope = assignment.completion_scope(path);
    let ctx = EvalContext {
      completed: &scope,
      fields: &assignment.context,
    };
    match condition.evaluate(&ctx) {
      Ok(true) => {}
      Ok(false) => return Err("progress conditions evaluated to false".to_string()),
      // Unknown references are evaluation failures, never "true".
      Err(e) => return Err(format!("progress condition evaluation failed: {e}")),
    }
  }

  Ok(())
}

/// Complete eligible ancestors, bottom-up, bounded by tree depth. A parent
/// auto-completes only when it has `auto_progress` and its own completion
/// rule holds. Completing the last top-level stage completes the
/// assignment.
fn cascade_up(
  assignment: &mut Assignment,
  start: NodePath,
  now: DateTime<Utc>,
  transitioned: &mut Vec<NodePath>,
) {
  let mut path = start;
  while let Some(parent) = parent_of(path) {
    if assignment.node_status(parent).is_terminal() {
      break;
    }
    if !auto_progress_at(assignment, parent) {
      break;
    }
    if completion_rule(assignment, parent).is_err() {
      break;
    }
    set_completed(assignment, parent, now);
    transitioned.push(parent);
    path = parent;
  }

  if assignment
    .stages
    .iter()
    .all(|s| s.status.counts_as_complete())
  {
    assignment.status = AssignmentStatus::Completed;
    assignment.pointer = None;
  } else if assignment.status == AssignmentStatus::NotStarted {
    assignment.status = AssignmentStatus::InProgress;
  }
}

/// Move the pointer to the next non-terminal leaf strictly after `from` in
/// tree order. The pointer never moves backwards; when no forward work
/// exists the pointer stays where it is (or clears if the assignment
/// completed).
fn advance_pointer(assignment: &mut Assignment, from: NodePath) {
  if assignment.status.is_terminal() {
    assignment.pointer = None;
    return;
  }

  let from_pos = position_after(from);
  for (si, stage) in assignment.stages.iter().enumerate() {
    for (pi, step) in stage.steps.iter().enumerate() {
      for (ti, task) in step.tasks.iter().enumerate() {
        if (si, pi, ti) < from_pos {
          continue;
        }
        if !task.status.is_terminal() {
          assignment.pointer = Some(CurrentPointer {
            stage_id: stage.node_id.clone(),
            step_id: Some(step.node_id.clone()),
            task_id: Some(task.node_id.clone()),
          });
          return;
        }
      }
    }
  }
}

/// The first tree-order position strictly after the given node's subtree.
fn position_after(path: NodePath) -> (usize, usize, usize) {
  match path {
    NodePath::Task(si, pi, ti) => (si, pi, ti + 1),
    NodePath::Step(si, pi) => (si, pi + 1, 0),
    NodePath::Stage(si) => (si + 1, 0, 0),
  }
}

fn parent_of(path: NodePath) -> Option<NodePath> {
  match path {
    NodePath::Task(si, pi, _) => Some(NodePath::Step(si, pi)),
    NodePath::Step(si, _) => Some(NodePath::Stage(si)),
    NodePath::Stage(_) => None,
  }
}

/// The node plus all of its descendants, parent first.
fn subtree_paths(assignment: &Assignment, path: NodePath) -> Vec<NodePath> {
  let mut paths = vec![path];
  match path {
    NodePath::Stage(si) => {
      for (pi, step) in assignment.stages[si].steps.iter().enumerate() {
        paths.push(NodePath::Step(si, pi));
        for ti in 0..step.tasks.len() {
          paths.push(NodePath::Task(si, pi, ti));
        }
      }
    }
    NodePath::Step(si, pi) => {
      for ti in 0..assignment.stages[si].steps[pi].tasks.len() {
        paths.push(NodePath::Task(si, pi, ti));
      }
    }
    NodePath::Task(..) => {}
  }
  paths
}

fn auto_progress_at(assignment: &Assignment, path: NodePath) -> bool {
  match path {
    NodePath::Stage(si) => assignment.stages[si].auto_progress,
    NodePath::Step(si, pi) => assignment.stages[si].steps[pi].auto_progress,
    NodePath::Task(si, pi, ti) => assignment.stages[si].steps[pi].tasks[ti].auto_progress,
  }
}

fn conditions_at(assignment: &Assignment, path: NodePath) -> Option<&Condition> {
  match path {
    NodePath::Stage(si) => assignment.stages[si].progress_conditions.as_ref(),
    NodePath::Step(si, pi) => assignment.stages[si].steps[pi].progress_conditions.as_ref(),
    NodePath::Task(si, pi, ti) => {
      assignment.stages[si].steps[pi].tasks[ti].progress_conditions.as_ref()
    }
  }
}

fn template_ref_at(assignment: &Assignment, path: NodePath) -> String {
  match path {
    NodePath::Stage(si) => assignment.stages[si].template_ref.clone(),
    NodePath::Step(si, pi) => assignment.stages[si].steps[pi].template_ref.clone(),
    NodePath::Task(si, pi, ti) => {
      assignment.stages[si].steps[pi].tasks[ti].template_ref.clone()
    }
  }
}

fn node_id_at(assignment: &Assignment, path: NodePath) -> String {
  match path {
    NodePath::Stage(si) => assignment.stages[si].node_id.clone(),
    NodePath::Step(si, pi) => assignment.stages[si].steps[pi].node_id.clone(),
    NodePath::Task(si, pi, ti) => assignment.stages[si].steps[pi].tasks[ti].node_id.clone(),
  }
}

fn actions_at(assignment: &Assignment, path: NodePath) -> Vec<praxis_template::ActionSpec> {
  match path {
    NodePath::Stage(si) => assignment.stages[si].on_complete_actions.clone(),
    NodePath::Step(si, pi) => assignment.stages[si].steps[pi].on_complete_actions.clone(),
    NodePath::Task(si, pi, ti) => {
      assignment.stages[si].steps[pi].tasks[ti].on_complete_actions.clone()
    }
  }
}

fn set_status(
  assignment: &mut Assignment,
  path: NodePath,
  status: NodeStatus,
  now: DateTime<Utc>,
) {
  let (current, started_at, completed_at) = match path {
    NodePath::Stage(si) => {
      let s = &mut assignment.stages[si];
      (&mut s.status, &mut s.started_at, &mut s.completed_at)
    }
    NodePath::Step(si, pi) => {
      let s = &mut assignment.stages[si].steps[pi];
      (&mut s.status, &mut s.started_at, &mut s.completed_at)
    }
    NodePath::Task(si, pi, ti) => {
      let t = &mut assignment.stages[si].steps[pi].tasks[ti];
      (&mut t.status, &mut t.started_at, &mut t.completed_at)
    }
  };
  match status {
    NodeStatus::InProgress => {
      started_at.get_or_insert(now);
    }
    NodeStatus::Completed => {
      started_at.get_or_insert(now);
      *completed_at = Some(now);
    }
    _ => {}
  }
  *current = status;
}

fn set_completed(assignment: &mut Assignment, path: NodePath, now: DateTime<Utc>) {
  set_status(assignment, path, NodeStatus::Completed, now);
}

/// Mark the node and its ancestors `in_progress` (work has begun), and the
/// assignment itself if it was untouched.
fn mark_chain_in_progress(assignment: &mut Assignment, path: NodePath, now: DateTime<Utc>) {
  let mut current = Some(path);
  while let Some(p) = current {
    if assignment.node_status(p) == NodeStatus::Pending {
      set_status(assignment, p, NodeStatus::InProgress, now);
    }
    current = parent_of(p);
  }
  if assignment.status == AssignmentStatus::NotStarted {
    assignment.status = AssignmentStatus::InProgress;
  }
}
