use praxis_store::StoreError;
use praxis_template::TemplateError;
use thiserror::Error;

/// Errors surfaced by the instantiator and progression engine.
#[derive(Debug, Error)]
pub enum EngineError {
  /// Template resolution or publish-time validation failed.
  #[error(transparent)]
  Template(#[from] TemplateError),

  /// Instantiation failed; the transaction was rolled back and no partial
  /// tree is observable.
  #[error("assignment clone failed: {source}")]
  CloneFailure {
    #[source]
    source: StoreError,
  },

  /// The completion rule for a node evaluated false (or a condition
  /// referenced an unknown field — conditions fail closed). The node is
  /// unchanged; the caller needs new evidence, not a retry.
  #[error("precondition not met for node '{node_id}': {reason}")]
  PreconditionNotMet { node_id: String, reason: String },

  /// A concurrent event committed first. Re-read and retry.
  #[error("concurrent modification of assignment {assignment_id}")]
  ConcurrencyConflict { assignment_id: String },

  #[error("{entity} not found: {id}")]
  NotFound { entity: &'static str, id: String },

  /// The requested transition is not legal from the node's or
  /// assignment's current state.
  #[error("invalid state: {message}")]
  InvalidState { message: String },

  /// No in-flight agent invocation matches this correlation id.
  #[error("unknown correlation id: {correlation_id}")]
  UnknownCorrelation { correlation_id: String },

  #[error("storage error: {0}")]
  Storage(StoreError),
}

impl EngineError {
  pub fn invalid_state(message: impl Into<String>) -> Self {
    EngineError::InvalidState {
      message: message.into(),
    }
  }
}

impl From<StoreError> for EngineError {
  fn from(e: StoreError) -> Self {
    match e {
      StoreError::ConcurrencyConflict { assignment_id, .. } => {
        EngineError::ConcurrencyConflict { assignment_id }
      }
      StoreError::AssignmentNotFound { assignment_id } => EngineError::NotFound {
        entity: "assignment",
        id: assignment_id,
      },
      StoreError::NodeNotFound { node_id } => EngineError::NotFound {
        entity: "node",
        id: node_id,
      },
      StoreError::ScheduleNotFound { schedule_id } => EngineError::NotFound {
        entity: "schedule",
        id: schedule_id,
      },
      StoreError::FollowupNotFound { followup_id } => EngineError::NotFound {
        entity: "followup",
        id: followup_id,
      },
      other => EngineError::Storage(other),
    }
  }
}
