use thiserror::Error;

/// Errors raised while dispatching an action to a collaborator.
///
/// These are retried per the action's policy and never fail the transition
/// that triggered the action.
#[derive(Debug, Error)]
pub enum ActionError {
  #[error("dispatch failed: {message}")]
  Dispatch { message: String },

  #[error(transparent)]
  Store(#[from] praxis_store::StoreError),
}

impl ActionError {
  pub fn dispatch(message: impl Into<String>) -> Self {
    ActionError::Dispatch {
      message: message.into(),
    }
  }
}
