use chrono::{DateTime, Utc};
use praxis_assignment::Assignment;
use sqlx::types::Json;
use sqlx::SqlitePool;

use crate::error::StoreError;
use crate::types::{apply_node_patch, NodePatch, RecurringSchedule, TaskFollowup};
use crate::AssignmentRepository;

/// SQLite-based repository implementation.
///
/// The assignment tree is stored as a JSON document on the assignment row
/// (the tree is the unit of locking, so the row is the unit of storage),
/// with a normalized node index for `find_assignment_by_node`. Tree
/// creation inserts the assignment row and every index row in one
/// transaction.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(&self.pool).await
  }

  fn map_insert_err(e: sqlx::Error, dedup_key: Option<&str>) -> StoreError {
    if let sqlx::Error::Database(db) = &e {
      if db.is_unique_violation() {
        if let Some(dedup_key) = dedup_key {
          return StoreError::DuplicateDedupKey {
            dedup_key: dedup_key.to_string(),
          };
        }
      }
    }
    StoreError::Database(e)
  }
}

impl AssignmentRepository for SqliteStore {
  async fn create_assignment_tree(&self, assignment: &Assignment) -> Result<(), StoreError> {
    let mut tx = self.pool.begin().await?;

    sqlx::query(
      r#"
            INSERT INTO assignments
                (assignment_id, template_id, template_version, client_id, status, dedup_key,
                 revision, doc, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&assignment.assignment_id)
    .bind(&assignment.template_id)
    .bind(assignment.template_version as i64)
    .bind(&assignment.client_id)
    .bind(assignment.status.as_str())
    .bind(&assignment.dedup_key)
    .bind(assignment.revision as i64)
    .bind(Json(assignment))
    .bind(assignment.created_at)
    .bind(assignment.updated_at)
    .execute(&mut *tx)
    .await
    .map_err(|e| Self::map_insert_err(e, assignment.dedup_key.as_deref()))?;

    for stage in &assignment.stages {
      insert_node_index(&mut tx, &stage.node_id, &assignment.assignment_id).await?;
      for step in &stage.steps {
        insert_node_index(&mut tx, &step.node_id, &assignment.assignment_id).await?;
        for task in &step.tasks {
          insert_node_index(&mut tx, &task.node_id, &assignment.assignment_id).await?;
        }
      }
    }

    tx.commit().await?;
    Ok(())
  }

  async fn get_assignment(&self, assignment_id: &str) -> Result<Assignment, StoreError> {
    let doc: Option<Json<Assignment>> =
      sqlx::query_scalar("SELECT doc FROM assignments WHERE assignment_id = ?")
        .bind(assignment_id)
        .fetch_optional(&self.pool)
        .await?;

    doc
      .map(|d| d.0)
      .ok_or_else(|| StoreError::AssignmentNotFound {
        assignment_id: assignment_id.to_string(),
      })
  }

  async fn find_by_dedup_key(&self, dedup_key: &str) -> Result<Option<String>, StoreError> {
    let id: Option<String> =
      sqlx::query_scalar("SELECT assignment_id FROM assignments WHERE dedup_key = ?")
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await?;
    Ok(id)
  }

  async fn find_assignment_by_node(&self, node_id: &str) -> Result<String, StoreError> {
    let id: Option<String> =
      sqlx::query_scalar("SELECT assignment_id FROM assignment_nodes WHERE node_id = ?")
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;
    id.ok_or_else(|| StoreError::NodeNotFound {
      node_id: node_id.to_string(),
    })
  }

  async fn commit_assignment(
    &self,
    assignment: &Assignment,
    expected_revision: u64,
  ) -> Result<u64, StoreError> {
    let mut updated = assignment.clone();
    updated.revision = expected_revision + 1;

    let result = sqlx::query(
      r#"
            UPDATE assignments
            SET doc = ?, status = ?, revision = ?, updated_at = ?
            WHERE assignment_id = ? AND revision = ?
            "#,
    )
    .bind(Json(&updated))
    .bind(updated.status.as_str())
    .bind(updated.revision as i64)
    .bind(updated.updated_at)
    .bind(&updated.assignment_id)
    .bind(expected_revision as i64)
    .execute(&self.pool)
    .await?;

    if result.rows_affected() == 0 {
      // Either the row is gone or someone committed first.
      let exists: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM assignments WHERE assignment_id = ?")
          .bind(&updated.assignment_id)
          .fetch_optional(&self.pool)
          .await?;
      return Err(match exists {
        Some(_) => StoreError::ConcurrencyConflict {
          assignment_id: updated.assignment_id.clone(),
          expected: expected_revision,
        },
        None => StoreError::AssignmentNotFound {
          assignment_id: updated.assignment_id.clone(),
        },
      });
    }

    Ok(updated.revision)
  }

  async fn update_node(
    &self,
    assignment_id: &str,
    node_id: &str,
    expected_revision: u64,
    patch: NodePatch,
  ) -> Result<u64, StoreError> {
    let mut assignment = self.get_assignment(assignment_id).await?;
    apply_node_patch(&mut assignment, node_id, patch)?;
    self.commit_assignment(&assignment, expected_revision).await
  }

  async fn upsert_schedule(&self, schedule: &RecurringSchedule) -> Result<(), StoreError> {
    sqlx::query(
      r#"
            INSERT INTO schedules (schedule_id, is_active, next_run_at, doc)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(schedule_id)
            DO UPDATE SET is_active = excluded.is_active,
                          next_run_at = excluded.next_run_at,
                          doc = excluded.doc
            "#,
    )
    .bind(&schedule.schedule_id)
    .bind(schedule.is_active)
    .bind(schedule.next_run_at)
    .bind(Json(schedule))
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn get_schedule(&self, schedule_id: &str) -> Result<RecurringSchedule, StoreError> {
    let doc: Option<Json<RecurringSchedule>> =
      sqlx::query_scalar("SELECT doc FROM schedules WHERE schedule_id = ?")
        .bind(schedule_id)
        .fetch_optional(&self.pool)
        .await?;
    doc.map(|d| d.0).ok_or_else(|| StoreError::ScheduleNotFound {
      schedule_id: schedule_id.to_string(),
    })
  }

  async fn list_due_schedules(
    &self,
    now: DateTime<Utc>,
  ) -> Result<Vec<RecurringSchedule>, StoreError> {
    let docs: Vec<Json<RecurringSchedule>> = sqlx::query_scalar(
      r#"
            SELECT doc FROM schedules
            WHERE is_active = 1 AND next_run_at <= ?
            ORDER BY next_run_at ASC
            "#,
    )
    .bind(now)
    .fetch_all(&self.pool)
    .await?;
    Ok(docs.into_iter().map(|d| d.0).collect())
  }

  async fn upsert_followup(&self, followup: &TaskFollowup) -> Result<(), StoreError> {
    sqlx::query(
      r#"
            INSERT INTO followups (followup_id, task_id, state, next_run_at, doc)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(followup_id)
            DO UPDATE SET state = excluded.state,
                          next_run_at = excluded.next_run_at,
                          doc = excluded.doc
            "#,
    )
    .bind(&followup.followup_id)
    .bind(&followup.task_id)
    .bind(state_str(followup))
    .bind(followup.next_run_at)
    .bind(Json(followup))
    .execute(&self.pool)
    .await?;
    Ok(())
  }

  async fn get_followup(&self, followup_id: &str) -> Result<TaskFollowup, StoreError> {
    let doc: Option<Json<TaskFollowup>> =
      sqlx::query_scalar("SELECT doc FROM followups WHERE followup_id = ?")
        .bind(followup_id)
        .fetch_optional(&self.pool)
        .await?;
    doc.map(|d| d.0).ok_or_else(|| StoreError::FollowupNotFound {
      followup_id: followup_id.to_string(),
    })
  }

  async fn list_due_followups(&self, now: DateTime<Utc>) -> Result<Vec<TaskFollowup>, StoreError> {
    let docs: Vec<Json<TaskFollowup>> = sqlx::query_scalar(
      r#"
            SELECT doc FROM followups
            WHERE state = 'active' AND next_run_at <= ?
            ORDER BY next_run_at ASC
            "#,
    )
    .bind(now)
    .fetch_all(&self.pool)
    .await?;
    Ok(docs.into_iter().map(|d| d.0).collect())
  }

  async fn list_followups_for_task(&self, task_id: &str) -> Result<Vec<TaskFollowup>, StoreError> {
    let docs: Vec<Json<TaskFollowup>> =
      sqlx::query_scalar("SELECT doc FROM followups WHERE task_id = ?")
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
    Ok(docs.into_iter().map(|d| d.0).collect())
  }
}

async fn insert_node_index(
  tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
  node_id: &str,
  assignment_id: &str,
) -> Result<(), StoreError> {
  sqlx::query("INSERT INTO assignment_nodes (node_id, assignment_id) VALUES (?, ?)")
    .bind(node_id)
    .bind(assignment_id)
    .execute(&mut **tx)
    .await?;
  Ok(())
}

fn state_str(followup: &TaskFollowup) -> &'static str {
  match followup.state {
    crate::FollowupState::Active => "active",
    crate::FollowupState::Paused => "paused",
    crate::FollowupState::Completed => "completed",
    crate::FollowupState::Cancelled => "cancelled",
  }
}
