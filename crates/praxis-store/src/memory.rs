//! In-memory repository for tests and the CLI.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use praxis_assignment::Assignment;

use crate::error::StoreError;
use crate::types::{apply_node_patch, NodePatch, RecurringSchedule, TaskFollowup};
use crate::AssignmentRepository;

#[derive(Default)]
struct Inner {
  assignments: HashMap<String, Assignment>,
  dedup: HashMap<String, String>,
  schedules: HashMap<String, RecurringSchedule>,
  followups: HashMap<String, TaskFollowup>,
}

/// In-memory store. Mutations hold one lock for their whole duration, which
/// gives the same all-or-nothing and revision-check semantics as a database
/// transaction.
#[derive(Default)]
pub struct MemoryStore {
  inner: Mutex<Inner>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl AssignmentRepository for MemoryStore {
  async fn create_assignment_tree(&self, assignment: &Assignment) -> Result<(), StoreError> {
    let mut inner = self.inner.lock().expect("store lock poisoned");

    if let Some(dedup_key) = &assignment.dedup_key {
      if inner.dedup.contains_key(dedup_key) {
        return Err(StoreError::DuplicateDedupKey {
          dedup_key: dedup_key.clone(),
        });
      }
      inner
        .dedup
        .insert(dedup_key.clone(), assignment.assignment_id.clone());
    }

    inner
      .assignments
      .insert(assignment.assignment_id.clone(), assignment.clone());
    Ok(())
  }

  async fn get_assignment(&self, assignment_id: &str) -> Result<Assignment, StoreError> {
    let inner = self.inner.lock().expect("store lock poisoned");
    inner
      .assignments
      .get(assignment_id)
      .cloned()
      .ok_or_else(|| StoreError::AssignmentNotFound {
        assignment_id: assignment_id.to_string(),
      })
  }

  async fn find_by_dedup_key(&self, dedup_key: &str) -> Result<Option<String>, StoreError> {
    let inner = self.inner.lock().expect("store lock poisoned");
    Ok(inner.dedup.get(dedup_key).cloned())
  }

  async fn find_assignment_by_node(&self, node_id: &str) -> Result<String, StoreError> {
    let inner = self.inner.lock().expect("store lock poisoned");
    inner
      .assignments
      .values()
      .find(|a| a.locate(node_id).is_some())
      .map(|a| a.assignment_id.clone())
      .ok_or_else(|| StoreError::NodeNotFound {
        node_id: node_id.to_string(),
      })
  }

  async fn commit_assignment(
    &self,
    assignment: &Assignment,
    expected_revision: u64,
  ) -> Result<u64, StoreError> {
    let mut inner = self.inner.lock().expect("store lock poisoned");
    let stored = inner
      .assignments
      .get_mut(&assignment.assignment_id)
      .ok_or_else(|| StoreError::AssignmentNotFound {
        assignment_id: assignment.assignment_id.clone(),
      })?;

    if stored.revision != expected_revision {
      return Err(StoreError::ConcurrencyConflict {
        assignment_id: assignment.assignment_id.clone(),
        expected: expected_revision,
      });
    }

    *stored = assignment.clone();
    stored.revision = expected_revision + 1;
    Ok(stored.revision)
  }

  async fn update_node(
    &self,
    assignment_id: &str,
    node_id: &str,
    expected_revision: u64,
    patch: NodePatch,
  ) -> Result<u64, StoreError> {
    let mut inner = self.inner.lock().expect("store lock poisoned");
    let stored = inner
      .assignments
      .get_mut(assignment_id)
      .ok_or_else(|| StoreError::AssignmentNotFound {
        assignment_id: assignment_id.to_string(),
      })?;

    if stored.revision != expected_revision {
      return Err(StoreError::ConcurrencyConflict {
        assignment_id: assignment_id.to_string(),
        expected: expected_revision,
      });
    }

    apply_node_patch(stored, node_id, patch)?;
    stored.revision = expected_revision + 1;
    Ok(stored.revision)
  }

  async fn upsert_schedule(&self, schedule: &RecurringSchedule) -> Result<(), StoreError> {
    let mut inner = self.inner.lock().expect("store lock poisoned");
    inner
      .schedules
      .insert(schedule.schedule_id.clone(), schedule.clone());
    Ok(())
  }

  async fn get_schedule(&self, schedule_id: &str) -> Result<RecurringSchedule, StoreError> {
    let inner = self.inner.lock().expect("store lock poisoned");
    inner
      .schedules
      .get(schedule_id)
      .cloned()
      .ok_or_else(|| StoreError::ScheduleNotFound {
        schedule_id: schedule_id.to_string(),
      })
  }

  async fn list_due_schedules(
    &self,
    now: DateTime<Utc>,
  ) -> Result<Vec<RecurringSchedule>, StoreError> {
    let inner = self.inner.lock().expect("store lock poisoned");
    let mut due: Vec<RecurringSchedule> = inner
      .schedules
      .values()
      .filter(|s| s.is_active && s.next_run_at <= now)
      .cloned()
      .collect();
    due.sort_by_key(|s| s.next_run_at);
    Ok(due)
  }

  async fn upsert_followup(&self, followup: &TaskFollowup) -> Result<(), StoreError> {
    let mut inner = self.inner.lock().expect("store lock poisoned");
    inner
      .followups
      .insert(followup.followup_id.clone(), followup.clone());
    Ok(())
  }

  async fn get_followup(&self, followup_id: &str) -> Result<TaskFollowup, StoreError> {
    let inner = self.inner.lock().expect("store lock poisoned");
    inner
      .followups
      .get(followup_id)
      .cloned()
      .ok_or_else(|| StoreError::FollowupNotFound {
        followup_id: followup_id.to_string(),
      })
  }

  async fn list_due_followups(
    &self,
    now: DateTime<Utc>,
  ) -> Result<Vec<TaskFollowup>, StoreError> {
    let inner = self.inner.lock().expect("store lock poisoned");
    let mut due: Vec<TaskFollowup> = inner
      .followups
      .values()
      .filter(|f| f.state == crate::FollowupState::Active && f.next_run_at <= now)
      .cloned()
      .collect();
    due.sort_by_key(|f| f.next_run_at);
    Ok(due)
  }

  async fn list_followups_for_task(&self, task_id: &str) -> Result<Vec<TaskFollowup>, StoreError> {
    let inner = self.inner.lock().expect("store lock poisoned");
    Ok(
      inner
        .followups
        .values()
        .filter(|f| f.task_id == task_id)
        .cloned()
        .collect(),
    )
  }
}
