use serde::{Deserialize, Serialize};

/// Per-node state machine shared by stages, steps, and tasks.
///
/// `pending → in_progress → completed`, with `skipped` and `cancelled` as
/// alternative terminals reachable from either non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
  Pending,
  InProgress,
  Completed,
  Skipped,
  Cancelled,
}

impl NodeStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, NodeStatus::Completed | NodeStatus::Skipped | NodeStatus::Cancelled)
  }

  /// Whether this status satisfies a parent's "all required children
  /// complete" rule. Skipped counts; cancelled does not.
  pub fn counts_as_complete(self) -> bool {
    matches!(self, NodeStatus::Completed | NodeStatus::Skipped)
  }
}

/// Assignment-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
  NotStarted,
  InProgress,
  WaitingClient,
  Review,
  Completed,
  Cancelled,
}

impl AssignmentStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, AssignmentStatus::Completed | AssignmentStatus::Cancelled)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      AssignmentStatus::NotStarted => "not_started",
      AssignmentStatus::InProgress => "in_progress",
      AssignmentStatus::WaitingClient => "waiting_client",
      AssignmentStatus::Review => "review",
      AssignmentStatus::Completed => "completed",
      AssignmentStatus::Cancelled => "cancelled",
    }
  }
}

impl std::str::FromStr for AssignmentStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "not_started" => Ok(AssignmentStatus::NotStarted),
      "in_progress" => Ok(AssignmentStatus::InProgress),
      "waiting_client" => Ok(AssignmentStatus::WaitingClient),
      "review" => Ok(AssignmentStatus::Review),
      "completed" => Ok(AssignmentStatus::Completed),
      "cancelled" => Ok(AssignmentStatus::Cancelled),
      other => Err(format!("unknown assignment status '{other}'")),
    }
  }
}
