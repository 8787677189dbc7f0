//! Template node definitions.
//!
//! Stages, steps, and tasks share the same automation metadata: a stable
//! `key` (what conditions refer to), an `order` unique among siblings, an
//! `auto_progress` flag, an optional progress condition, and completion
//! actions. The shapes differ only in their children and completion-rule
//! knobs.

use serde::{Deserialize, Serialize};

use crate::action::ActionSpec;
use crate::condition::Condition;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTemplate {
  pub key: String,
  pub name: String,
  pub order: u32,
  #[serde(default = "default_true")]
  pub auto_progress: bool,
  /// When false, the stage ignores child completion and relies solely on
  /// its progress conditions.
  #[serde(default = "default_true")]
  pub require_all_steps_complete: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub progress_conditions: Option<Condition>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub on_complete_actions: Vec<ActionSpec>,
  pub steps: Vec<StepTemplate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
  pub key: String,
  pub name: String,
  pub order: u32,
  #[serde(default = "default_true")]
  pub auto_progress: bool,
  #[serde(default = "default_true")]
  pub require_all_tasks_complete: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub progress_conditions: Option<Condition>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub on_complete_actions: Vec<ActionSpec>,
  pub tasks: Vec<TaskTemplate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
  pub key: String,
  pub name: String,
  pub order: u32,
  /// When false, the task never completes implicitly — an explicit
  /// completion event is required even once all prerequisites are met.
  #[serde(default = "default_true")]
  pub auto_progress: bool,
  #[serde(default = "default_true")]
  pub require_all_checklists_complete: bool,
  #[serde(default = "default_true")]
  pub require_all_subtasks_complete: bool,
  /// Whether the task is visible to the client. Mutable at run time via the
  /// `set_visibility` action.
  #[serde(default)]
  pub client_visible: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub progress_conditions: Option<Condition>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub on_complete_actions: Vec<ActionSpec>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub checklists: Vec<ChecklistTemplate>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub subtasks: Vec<SubtaskTemplate>,
}

/// A checklist item inside a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistTemplate {
  pub key: String,
  pub label: String,
  #[serde(default = "default_true")]
  pub required: bool,
}

/// A subtask inside a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskTemplate {
  pub key: String,
  pub title: String,
  #[serde(default = "default_true")]
  pub required: bool,
}

fn default_true() -> bool {
  true
}
