use thiserror::Error;

/// Errors raised when validating a template at publish time.
///
/// All structural problems are caught here, never at run time: an
/// assignment cloned from a published template can assume a well-formed
/// tree.
#[derive(Debug, Error)]
pub enum ValidationError {
  #[error("template has no stages")]
  EmptyTemplate,

  #[error("duplicate node key '{key}'")]
  DuplicateKey { key: String },

  #[error("duplicate sibling order {order} under '{parent}'")]
  DuplicateOrder { parent: String, order: u32 },

  #[error("condition on '{node}' references '{referenced}' outside its own subtree")]
  OutOfScopeReference { node: String, referenced: String },

  #[error("stage '{key}' has no steps")]
  EmptyStage { key: String },
}

/// Errors returned by the template store.
#[derive(Debug, Error)]
pub enum TemplateError {
  #[error(transparent)]
  Validation(#[from] ValidationError),

  #[error("template not found: {template_id}")]
  NotFound { template_id: String },

  #[error("template '{template_id}' has no published version {version}")]
  VersionNotFound { template_id: String, version: u32 },
}
