use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::node::{StageTemplate, StepTemplate, TaskTemplate};

/// Whether a template is shared across the platform or owned by one
/// organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum TemplateScope {
  Global,
  Organization { organization_id: String },
}

/// An authored, versioned workflow template.
///
/// `version` is 0 for drafts and bumped only by the template store at
/// publish. Published templates are immutable; edits clone into a new
/// draft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
  pub template_id: String,
  pub name: String,
  pub category: String,
  #[serde(flatten)]
  pub scope: TemplateScope,
  #[serde(default)]
  pub version: u32,
  pub stages: Vec<StageTemplate>,
}

impl WorkflowTemplate {
  /// Validate the tree for publishing.
  ///
  /// Checks, in order: the template is non-empty, node keys are unique
  /// across the whole template, sibling `order` values are unique within
  /// each parent, and every `node_completed` condition reference points
  /// inside the referencing node's own subtree.
  pub fn validate(&self) -> Result<(), ValidationError> {
    if self.stages.is_empty() {
      return Err(ValidationError::EmptyTemplate);
    }

    self.check_unique_keys()?;
    self.check_sibling_orders()?;
    self.check_condition_scopes()?;
    Ok(())
  }

  /// Total number of stage/step/task nodes in the template.
  pub fn node_count(&self) -> usize {
    self
      .stages
      .iter()
      .map(|stage| {
        1 + stage
          .steps
          .iter()
          .map(|step| 1 + step.tasks.len())
          .sum::<usize>()
      })
      .sum()
  }

  fn check_unique_keys(&self) -> Result<(), ValidationError> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut check = |key: &str| -> Result<(), ValidationError> {
      if !seen.insert(key.to_string()) {
        return Err(ValidationError::DuplicateKey {
          key: key.to_string(),
        });
      }
      Ok(())
    };

    // Checklist and subtask keys share the namespace: conditions may
    // reference them.
    for stage in &self.stages {
      check(&stage.key)?;
      for step in &stage.steps {
        check(&step.key)?;
        for task in &step.tasks {
          check(&task.key)?;
          for item in &task.checklists {
            check(&item.key)?;
          }
          for sub in &task.subtasks {
            check(&sub.key)?;
          }
        }
      }
    }
    Ok(())
  }

  fn check_sibling_orders(&self) -> Result<(), ValidationError> {
    check_orders("template", self.stages.iter().map(|s| s.order))?;
    for stage in &self.stages {
      if stage.steps.is_empty() {
        return Err(ValidationError::EmptyStage {
          key: stage.key.clone(),
        });
      }
      check_orders(&stage.key, stage.steps.iter().map(|s| s.order))?;
      for step in &stage.steps {
        check_orders(&step.key, step.tasks.iter().map(|t| t.order))?;
      }
    }
    Ok(())
  }

  fn check_condition_scopes(&self) -> Result<(), ValidationError> {
    for stage in &self.stages {
      let scope = stage_scope(stage);
      check_scope(&stage.key, stage.progress_conditions.as_ref(), &scope)?;
      for step in &stage.steps {
        let scope = step_scope(step);
        check_scope(&step.key, step.progress_conditions.as_ref(), &scope)?;
        for task in &step.tasks {
          let scope = task_scope(task);
          check_scope(&task.key, task.progress_conditions.as_ref(), &scope)?;
        }
      }
    }
    Ok(())
  }
}

fn check_orders(
  parent: &str,
  orders: impl Iterator<Item = u32>,
) -> Result<(), ValidationError> {
  let mut seen = HashSet::new();
  for order in orders {
    if !seen.insert(order) {
      return Err(ValidationError::DuplicateOrder {
        parent: parent.to_string(),
        order,
      });
    }
  }
  Ok(())
}

fn check_scope(
  node: &str,
  condition: Option<&crate::condition::Condition>,
  scope: &HashSet<&str>,
) -> Result<(), ValidationError> {
  let Some(condition) = condition else {
    return Ok(());
  };
  for referenced in condition.referenced_nodes() {
    if !scope.contains(referenced) {
      return Err(ValidationError::OutOfScopeReference {
        node: node.to_string(),
        referenced: referenced.to_string(),
      });
    }
  }
  Ok(())
}

/// Descendant keys a stage's conditions may reference.
fn stage_scope(stage: &StageTemplate) -> HashSet<&str> {
  let mut scope = HashSet::new();
  for step in &stage.steps {
    scope.insert(step.key.as_str());
    scope.extend(step_scope(step));
  }
  scope
}

fn step_scope(step: &StepTemplate) -> HashSet<&str> {
  let mut scope = HashSet::new();
  for task in &step.tasks {
    scope.insert(task.key.as_str());
    scope.extend(task_scope(task));
  }
  scope
}

fn task_scope(task: &TaskTemplate) -> HashSet<&str> {
  let mut scope = HashSet::new();
  for item in &task.checklists {
    scope.insert(item.key.as_str());
  }
  for sub in &task.subtasks {
    scope.insert(sub.key.as_str());
  }
  scope
}

#[cfg(test)]
mod tests {
  use crate::condition::{Comparator, Condition};
  use crate::error::ValidationError;
  use crate::node::{StageTemplate, StepTemplate, SubtaskTemplate, TaskTemplate};

  use super::*;

  fn task(key: &str, order: u32) -> TaskTemplate {
    TaskTemplate {
      key: key.to_string(),
      name: key.to_string(),
      order,
      auto_progress: true,
      require_all_checklists_complete: true,
      require_all_subtasks_complete: true,
      client_visible: false,
      progress_conditions: None,
      on_complete_actions: Vec::new(),
      checklists: Vec::new(),
      subtasks: Vec::new(),
    }
  }

  fn step(key: &str, order: u32, tasks: Vec<TaskTemplate>) -> StepTemplate {
    StepTemplate {
      key: key.to_string(),
      name: key.to_string(),
      order,
      auto_progress: true,
      require_all_tasks_complete: true,
      progress_conditions: None,
      on_complete_actions: Vec::new(),
      tasks,
    }
  }

  fn stage(key: &str, order: u32, steps: Vec<StepTemplate>) -> StageTemplate {
    StageTemplate {
      key: key.to_string(),
      name: key.to_string(),
      order,
      auto_progress: true,
      require_all_steps_complete: true,
      progress_conditions: None,
      on_complete_actions: Vec::new(),
      steps,
    }
  }

  fn template(stages: Vec<StageTemplate>) -> WorkflowTemplate {
    WorkflowTemplate {
      template_id: "tpl-1".to_string(),
      name: "Tax Filing".to_string(),
      category: "tax".to_string(),
      scope: TemplateScope::Global,
      version: 0,
      stages,
    }
  }

  #[test]
  fn valid_template_passes() {
    let tpl = template(vec![
      stage("intake", 1, vec![step("collect", 1, vec![task("upload-w2", 1)])]),
      stage("review", 2, vec![step("check", 1, vec![task("verify", 1)])]),
    ]);
    tpl.validate().unwrap();
    assert_eq!(tpl.node_count(), 6);
  }

  #[test]
  fn duplicate_sibling_order_rejected() {
    let tpl = template(vec![stage(
      "intake",
      1,
      vec![step("collect", 1, vec![task("a", 1), task("b", 1)])],
    )]);
    assert!(matches!(
      tpl.validate(),
      Err(ValidationError::DuplicateOrder { .. })
    ));
  }

  #[test]
  fn duplicate_key_rejected() {
    let tpl = template(vec![stage(
      "intake",
      1,
      vec![step("collect", 1, vec![task("intake", 1)])],
    )]);
    assert!(matches!(
      tpl.validate(),
      Err(ValidationError::DuplicateKey { .. })
    ));
  }

  #[test]
  fn condition_reference_outside_subtree_rejected() {
    // Stage "review" references a task that lives under stage "intake".
    let mut review = stage("review", 2, vec![step("check", 1, vec![task("verify", 1)])]);
    review.progress_conditions = Some(Condition::NodeCompleted {
      node: "upload-w2".to_string(),
    });

    let tpl = template(vec![
      stage("intake", 1, vec![step("collect", 1, vec![task("upload-w2", 1)])]),
      review,
    ]);
    assert!(matches!(
      tpl.validate(),
      Err(ValidationError::OutOfScopeReference { .. })
    ));
  }

  #[test]
  fn condition_reference_to_own_subtask_allowed() {
    let mut t = task("upload-w2", 1);
    t.subtasks.push(SubtaskTemplate {
      key: "scan".to_string(),
      title: "Scan".to_string(),
      required: true,
    });
    t.progress_conditions = Some(Condition::NodeCompleted {
      node: "scan".to_string(),
    });

    let tpl = template(vec![stage("intake", 1, vec![step("collect", 1, vec![t])])]);
    tpl.validate().unwrap();
  }

  #[test]
  fn field_conditions_are_not_scope_checked() {
    let mut t = task("upload-w2", 1);
    t.progress_conditions = Some(Condition::Field {
      field: "documents_received".to_string(),
      cmp: Comparator::Gte,
      value: serde_json::json!(1),
    });
    let tpl = template(vec![stage("intake", 1, vec![step("collect", 1, vec![t])])]);
    tpl.validate().unwrap();
  }
}
