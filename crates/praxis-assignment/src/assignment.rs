use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::{AssignmentStage, AssignmentStep, AssignmentTask};
use crate::status::{AssignmentStatus, NodeStatus};

/// The assignment's current position: the stage, step, and task work should
/// happen on next. Always references nodes inside this assignment's own
/// tree. `None` once the assignment reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentPointer {
  pub stage_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub step_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub task_id: Option<String>,
}

/// Index path to a node inside the assignment tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePath {
  Stage(usize),
  Step(usize, usize),
  Task(usize, usize, usize),
}

/// A live, per-client instance of one published template version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
  pub assignment_id: String,
  pub template_id: String,
  pub template_version: u32,
  pub client_id: String,
  pub status: AssignmentStatus,
  /// Named context variables conditions and action payloads read from.
  #[serde(default)]
  pub context: serde_json::Map<String, serde_json::Value>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pointer: Option<CurrentPointer>,
  /// Optimistic-concurrency token, bumped by the repository on every
  /// committed mutation.
  pub revision: u64,
  /// Idempotency key supplied by the caller (e.g. a scheduler run id).
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub dedup_key: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub stages: Vec<AssignmentStage>,
}

impl Assignment {
  /// Locate a node by id anywhere in the tree.
  pub fn locate(&self, node_id: &str) -> Option<NodePath> {
    for (si, stage) in self.stages.iter().enumerate() {
      if stage.node_id == node_id {
        return Some(NodePath::Stage(si));
      }
      for (pi, step) in stage.steps.iter().enumerate() {
        if step.node_id == node_id {
          return Some(NodePath::Step(si, pi));
        }
        for (ti, task) in step.tasks.iter().enumerate() {
          if task.node_id == node_id {
            return Some(NodePath::Task(si, pi, ti));
          }
        }
      }
    }
    None
  }

  pub fn stage(&self, path: NodePath) -> &AssignmentStage {
    let (NodePath::Stage(si) | NodePath::Step(si, _) | NodePath::Task(si, _, _)) = path;
    &self.stages[si]
  }

  pub fn step(&self, path: NodePath) -> Option<&AssignmentStep> {
    match path {
      NodePath::Step(si, pi) | NodePath::Task(si, pi, _) => Some(&self.stages[si].steps[pi]),
      NodePath::Stage(_) => None,
    }
  }

  pub fn task(&self, path: NodePath) -> Option<&AssignmentTask> {
    match path {
      NodePath::Task(si, pi, ti) => Some(&self.stages[si].steps[pi].tasks[ti]),
      _ => None,
    }
  }

  /// Status of the node at a path.
  pub fn node_status(&self, path: NodePath) -> NodeStatus {
    match path {
      NodePath::Stage(si) => self.stages[si].status,
      NodePath::Step(si, pi) => self.stages[si].steps[pi].status,
      NodePath::Task(si, pi, ti) => self.stages[si].steps[pi].tasks[ti].status,
    }
  }

  /// The first leaf in template order, used as the initial pointer.
  pub fn first_pointer(&self) -> Option<CurrentPointer> {
    let stage = self.stages.first()?;
    let step = stage.steps.first();
    let task = step.and_then(|s| s.tasks.first());
    Some(CurrentPointer {
      stage_id: stage.node_id.clone(),
      step_id: step.map(|s| s.node_id.clone()),
      task_id: task.map(|t| t.node_id.clone()),
    })
  }

  /// Total number of stage/step/task nodes.
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

  /// Derived progress, 0–100: the share of leaf tasks that have completed
  /// (or been skipped).
  pub fn progress(&self) -> u8 {
    let mut total = 0u32;
    let mut done = 0u32;
    for stage in &self.stages {
      for step in &stage.steps {
        for task in &step.tasks {
          total += 1;
          if task.status.counts_as_complete() {
            done += 1;
          }
        }
      }
    }
    if total == 0 {
      return 0;
    }
    ((done * 100) / total) as u8
  }

  /// Completion booleans for every descendant of the node at `path`, keyed
  /// by template key. This is the node-state half of a condition's
  /// evaluation context.
  pub fn completion_scope(&self, path: NodePath) -> HashMap<String, bool> {
    let mut scope = HashMap::new();
    match path {
      NodePath::Stage(si) => {
        for step in &self.stages[si].steps {
          scope.insert(step.template_ref.clone(), step.status.counts_as_complete());
          for task in &step.tasks {
            insert_task_scope(&mut scope, task);
          }
        }
      }
      NodePath::Step(si, pi) => {
        for task in &self.stages[si].steps[pi].tasks {
          insert_task_scope(&mut scope, task);
        }
      }
      NodePath::Task(si, pi, ti) => {
        let task = &self.stages[si].steps[pi].tasks[ti];
        for item in &task.checklists {
          scope.insert(item.key.clone(), item.checked);
        }
        for sub in &task.subtasks {
          scope.insert(sub.key.clone(), sub.completed);
        }
      }
    }
    scope
  }
}

fn insert_task_scope(scope: &mut HashMap<String, bool>, task: &AssignmentTask) {
  scope.insert(task.template_ref.clone(), task.status.counts_as_complete());
  for item in &task.checklists {
    scope.insert(item.key.clone(), item.checked);
  }
  for sub in &task.subtasks {
    scope.insert(sub.key.clone(), sub.completed);
  }
}
