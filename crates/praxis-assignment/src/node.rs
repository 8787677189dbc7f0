//! Assignment-scoped node types.
//!
//! Automation metadata (`auto_progress`, progress conditions, completion
//! actions) is copied verbatim from the template at instantiation so the
//! assignment stays executable even after the template gains new versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use praxis_template::{ActionSpec, Condition};

use crate::status::NodeStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentStage {
  pub node_id: String,
  /// Key of the originating template node. Audit only, never dereferenced
  /// for shared state.
  pub template_ref: String,
  pub name: String,
  pub order: u32,
  pub status: NodeStatus,
  pub auto_progress: bool,
  pub require_all_steps_complete: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub progress_conditions: Option<Condition>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub on_complete_actions: Vec<ActionSpec>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
  pub steps: Vec<AssignmentStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentStep {
  pub node_id: String,
  pub template_ref: String,
  pub name: String,
  pub order: u32,
  pub status: NodeStatus,
  pub auto_progress: bool,
  pub require_all_tasks_complete: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub progress_conditions: Option<Condition>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub on_complete_actions: Vec<ActionSpec>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
  pub tasks: Vec<AssignmentTask>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentTask {
  pub node_id: String,
  pub template_ref: String,
  pub name: String,
  pub order: u32,
  pub status: NodeStatus,
  pub auto_progress: bool,
  pub require_all_checklists_complete: bool,
  pub require_all_subtasks_complete: bool,
  pub client_visible: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub progress_conditions: Option<Condition>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub on_complete_actions: Vec<ActionSpec>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub checklists: Vec<ChecklistItem>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub subtasks: Vec<SubtaskItem>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub started_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
}

impl AssignmentTask {
  /// Whether the task's structural prerequisites are met: required
  /// checklist items checked and required subtasks completed, per the
  /// task's `require_all_*` flags.
  pub fn prerequisites_met(&self) -> bool {
    let checklists_ok = !self.require_all_checklists_complete
      || self.checklists.iter().filter(|c| c.required).all(|c| c.checked);
    let subtasks_ok = !self.require_all_subtasks_complete
      || self.subtasks.iter().filter(|s| s.required).all(|s| s.completed);
    checklists_ok && subtasks_ok
  }
}

/// A checklist item on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
  pub key: String,
  pub label: String,
  pub required: bool,
  pub checked: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub checked_at: Option<DateTime<Utc>>,
}

/// A subtask on a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskItem {
  pub key: String,
  pub title: String,
  pub required: bool,
  pub completed: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub completed_at: Option<DateTime<Utc>>,
}
