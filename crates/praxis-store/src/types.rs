use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// How often a recurring schedule fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
  Daily,
  Weekly,
  Monthly,
}

/// A time-driven definition that periodically re-instantiates a template
/// for a client.
///
/// `next_run_at` strictly increases after each run and is always advanced
/// from its previous value, never from the wall clock, so consecutive runs
/// never drift.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringSchedule {
  pub schedule_id: String,
  pub template_id: String,
  pub client_id: String,
  pub frequency: Frequency,
  /// Every `interval` days/weeks/months, per `frequency`. Minimum 1.
  pub interval: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub day_of_week: Option<Weekday>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub day_of_month: Option<u32>,
  pub time_of_day: NaiveTime,
  pub next_run_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_run_at: Option<DateTime<Utc>>,
  pub run_count: u32,
  pub is_active: bool,
  pub start_date: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub end_date: Option<DateTime<Utc>>,
}

/// State of a client-facing task followup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowupState {
  Active,
  Paused,
  Completed,
  Cancelled,
}

impl FollowupState {
  pub fn is_terminal(self) -> bool {
    matches!(self, FollowupState::Completed | FollowupState::Cancelled)
  }
}

/// A reminder loop attached to a client-facing assignment task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFollowup {
  pub followup_id: String,
  pub assignment_id: String,
  pub task_id: String,
  pub state: FollowupState,
  pub interval_days: u32,
  pub next_run_at: DateTime<Utc>,
  /// After this many reminder runs the followup escalates to the assignee.
  pub escalate_after_runs: u32,
  /// The followup completes itself after this many runs.
  pub max_runs: u32,
  pub run_count: u32,
  /// Notification template rendered for each reminder.
  pub message_template_key: String,
}

/// A small patch applied to one assignment node outside the progression
/// cascade. Currently only task visibility is patchable this way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePatch {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub client_visible: Option<bool>,
}

/// Apply a patch to the task with `node_id` inside the assignment tree.
pub(crate) fn apply_node_patch(
  assignment: &mut praxis_assignment::Assignment,
  node_id: &str,
  patch: NodePatch,
) -> Result<(), crate::StoreError> {
  for stage in &mut assignment.stages {
    for step in &mut stage.steps {
      for task in &mut step.tasks {
        if task.node_id == node_id {
          if let Some(visible) = patch.client_visible {
            task.client_visible = visible;
          }
          return Ok(());
        }
      }
    }
  }
  Err(crate::StoreError::NodeNotFound {
    node_id: node_id.to_string(),
  })
}
