//! Versioned template storage.
//!
//! Publishing is append-only: each publish validates the draft, assigns the
//! next version, and freezes a copy. Prior versions stay resolvable forever
//! so existing assignments can always trace their origin template.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::TemplateError;
use crate::template::WorkflowTemplate;

/// Storage trait for workflow templates.
pub trait TemplateStore: Send + Sync {
  /// Get the latest published version of a template.
  fn get_published(
    &self,
    template_id: &str,
  ) -> impl std::future::Future<Output = Result<WorkflowTemplate, TemplateError>> + Send;

  /// Get a specific published version.
  fn get_version(
    &self,
    template_id: &str,
    version: u32,
  ) -> impl std::future::Future<Output = Result<WorkflowTemplate, TemplateError>> + Send;

  /// Validate and publish a draft, returning the assigned version.
  fn publish(
    &self,
    draft: WorkflowTemplate,
  ) -> impl std::future::Future<Output = Result<u32, TemplateError>> + Send;
}

/// In-memory template store.
///
/// The template store is read-mostly; a `RwLock` over the published map is
/// the only synchronization it needs.
#[derive(Default)]
pub struct MemoryTemplateStore {
  published: RwLock<HashMap<String, Vec<WorkflowTemplate>>>,
}

impl MemoryTemplateStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl TemplateStore for MemoryTemplateStore {
  async fn get_published(&self, template_id: &str) -> Result<WorkflowTemplate, TemplateError> {
    let published = self.published.read().expect("template store lock poisoned");
    published
      .get(template_id)
      .and_then(|versions| versions.last())
      .cloned()
      .ok_or_else(|| TemplateError::NotFound {
        template_id: template_id.to_string(),
      })
  }

  async fn get_version(
    &self,
    template_id: &str,
    version: u32,
  ) -> Result<WorkflowTemplate, TemplateError> {
    let published = self.published.read().expect("template store lock poisoned");
    let versions = published
      .get(template_id)
      .ok_or_else(|| TemplateError::NotFound {
        template_id: template_id.to_string(),
      })?;
    versions
      .iter()
      .find(|t| t.version == version)
      .cloned()
      .ok_or_else(|| TemplateError::VersionNotFound {
        template_id: template_id.to_string(),
        version,
      })
  }

  async fn publish(&self, mut draft: WorkflowTemplate) -> Result<u32, TemplateError> {
    draft.validate()?;

    let mut published = self.published.write().expect("template store lock poisoned");
    let versions = published.entry(draft.template_id.clone()).or_default();
    let version = versions.last().map(|t| t.version).unwrap_or(0) + 1;
    draft.version = version;
    versions.push(draft);
    Ok(version)
  }
}
