//! Praxis Store
//!
//! This crate provides the storage trait and implementations for assignment
//! trees, recurring schedules, and task followups. Data is persisted to a
//! database (SQLite) or held in memory for tests and the CLI.
//!
//! The [`AssignmentRepository`] trait defines:
//! - Atomic, all-or-nothing creation of a full assignment tree
//! - Optimistic-concurrency commits of an assignment's mutated tree — the
//!   assignment is the unit of locking; two racing writers see exactly one
//!   success and one [`StoreError::ConcurrencyConflict`]
//! - Due-schedule and due-followup queries for the recurrence scheduler

mod clock;
mod error;
mod memory;
mod sqlite;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::StoreError;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{FollowupState, Frequency, NodePatch, RecurringSchedule, TaskFollowup};

use chrono::{DateTime, Utc};
use praxis_assignment::Assignment;

/// Storage trait for assignments, schedules, and followups.
pub trait AssignmentRepository: Send + Sync {
  /// Create a new assignment with its full cloned tree, atomically. Either
  /// every node is persisted or none are. Rejects a duplicate `dedup_key`
  /// with [`StoreError::DuplicateDedupKey`].
  fn create_assignment_tree(
    &self,
    assignment: &Assignment,
  ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

  /// Get an assignment (with its tree) by id.
  fn get_assignment(
    &self,
    assignment_id: &str,
  ) -> impl std::future::Future<Output = Result<Assignment, StoreError>> + Send;

  /// Find an assignment id by instantiation dedup key.
  fn find_by_dedup_key(
    &self,
    dedup_key: &str,
  ) -> impl std::future::Future<Output = Result<Option<String>, StoreError>> + Send;

  /// Resolve the assignment that owns a stage/step/task node id.
  fn find_assignment_by_node(
    &self,
    node_id: &str,
  ) -> impl std::future::Future<Output = Result<String, StoreError>> + Send;

  /// Persist a mutated assignment if the stored revision still equals
  /// `expected_revision`. Returns the new revision on success; a stale
  /// writer gets [`StoreError::ConcurrencyConflict`] and must re-read.
  fn commit_assignment(
    &self,
    assignment: &Assignment,
    expected_revision: u64,
  ) -> impl std::future::Future<Output = Result<u64, StoreError>> + Send;

  /// Apply a small patch to one node under the same optimistic check.
  /// Used by actions (e.g. visibility changes) that bypass the progression
  /// cascade.
  fn update_node(
    &self,
    assignment_id: &str,
    node_id: &str,
    expected_revision: u64,
    patch: NodePatch,
  ) -> impl std::future::Future<Output = Result<u64, StoreError>> + Send;

  /// Insert or replace a recurring schedule.
  fn upsert_schedule(
    &self,
    schedule: &RecurringSchedule,
  ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

  /// Get a schedule by id.
  fn get_schedule(
    &self,
    schedule_id: &str,
  ) -> impl std::future::Future<Output = Result<RecurringSchedule, StoreError>> + Send;

  /// All active schedules due at or before `now`.
  fn list_due_schedules(
    &self,
    now: DateTime<Utc>,
  ) -> impl std::future::Future<Output = Result<Vec<RecurringSchedule>, StoreError>> + Send;

  /// Insert or replace a task followup.
  fn upsert_followup(
    &self,
    followup: &TaskFollowup,
  ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

  /// Get a followup by id.
  fn get_followup(
    &self,
    followup_id: &str,
  ) -> impl std::future::Future<Output = Result<TaskFollowup, StoreError>> + Send;

  /// All active followups due at or before `now`.
  fn list_due_followups(
    &self,
    now: DateTime<Utc>,
  ) -> impl std::future::Future<Output = Result<Vec<TaskFollowup>, StoreError>> + Send;

  /// Followups attached to a task, any state.
  fn list_followups_for_task(
    &self,
    task_id: &str,
  ) -> impl std::future::Future<Output = Result<Vec<TaskFollowup>, StoreError>> + Send;
}
