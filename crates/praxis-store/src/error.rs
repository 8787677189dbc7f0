use thiserror::Error;

/// Errors returned by repository implementations.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("assignment not found: {assignment_id}")]
  AssignmentNotFound { assignment_id: String },

  #[error("node not found: {node_id}")]
  NodeNotFound { node_id: String },

  #[error("schedule not found: {schedule_id}")]
  ScheduleNotFound { schedule_id: String },

  #[error("followup not found: {followup_id}")]
  FollowupNotFound { followup_id: String },

  /// The optimistic revision check failed; the caller holds a stale copy
  /// and must re-read before retrying.
  #[error("concurrent modification of assignment {assignment_id}: expected revision {expected}")]
  ConcurrencyConflict { assignment_id: String, expected: u64 },

  /// An assignment with this dedup key already exists.
  #[error("assignment already created for dedup key '{dedup_key}'")]
  DuplicateDedupKey { dedup_key: String },

  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}
