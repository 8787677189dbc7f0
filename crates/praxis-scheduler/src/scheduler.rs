//! The recurrence poll loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use praxis_actions::Notifier;
use praxis_engine::{EngineError, InstantiateRequest, WorkflowService};
use praxis_store::{
  AssignmentRepository, Clock, FollowupState, RecurringSchedule, TaskFollowup,
};
use praxis_template::{Recipient, TemplateStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::leader::LeaderLock;
use crate::recurrence::{advance, next_after_run};

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
  pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self {
      poll_interval: Duration::from_secs(30),
    }
  }
}

/// Polls recurring schedules and due followups against the injected clock.
///
/// One logical instance runs across all replicas; each tick is gated by
/// the leader lock. A missed poll cycle only defers runs — the catch-up
/// policy in [`next_after_run`] keeps schedules on their grid.
pub struct RecurrenceScheduler<T, R: AssignmentRepository, L> {
  service: Arc<WorkflowService<T, R>>,
  repository: Arc<R>,
  clock: Arc<dyn Clock>,
  notifier: Arc<dyn Notifier>,
  lock: L,
  config: SchedulerConfig,
}

impl<T, R, L> RecurrenceScheduler<T, R, L>
where
  T: TemplateStore,
  R: AssignmentRepository + 'static,
  L: LeaderLock,
{
  pub fn new(
    service: Arc<WorkflowService<T, R>>,
    repository: Arc<R>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    lock: L,
    config: SchedulerConfig,
  ) -> Self {
    Self {
      service,
      repository,
      clock,
      notifier,
      lock,
      config,
    }
  }

  /// Run the poll loop until cancelled.
  pub async fn run(&self, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(self.config.poll_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!(poll_interval_secs = self.config.poll_interval.as_secs(), "scheduler_started");

    loop {
      tokio::select! {
        _ = interval.tick() => self.tick().await,
        _ = cancel.cancelled() => {
          info!("scheduler_stopped");
          return;
        }
      }
    }
  }

  /// One poll cycle. Public so tests (and the CLI) can drive ticks
  /// directly against a manual clock.
  #[instrument(name = "scheduler_tick", skip(self))]
  pub async fn tick(&self) {
    if !self.lock.try_acquire().await {
      debug!("tick_skipped_not_leader");
      return;
    }

    let now = self.clock.now();
    self.run_due_schedules(now).await;
    self.run_due_followups(now).await;

    self.lock.release().await;
  }

  async fn run_due_schedules(&self, now: DateTime<Utc>) {
    let due = match self.repository.list_due_schedules(now).await {
      Ok(due) => due,
      Err(e) => {
        warn!(error = %e, "due_schedule_query_failed");
        return;
      }
    };

    for schedule in due {
      self.fire_schedule(schedule, now).await;
    }
  }

  async fn fire_schedule(&self, mut schedule: RecurringSchedule, now: DateTime<Utc>) {
    if let Some(end) = schedule.end_date {
      if schedule.next_run_at > end {
        schedule.is_active = false;
        info!(schedule_id = %schedule.schedule_id, "schedule_expired");
        self.persist_schedule(&schedule).await;
        return;
      }
    }

    let due_at = schedule.next_run_at;
    // More than one whole slot behind means runs were missed while the
    // scheduler was offline; the due run becomes the single catch-up.
    if advance(&schedule, due_at) <= now {
      warn!(
        schedule_id = %schedule.schedule_id,
        due_at = %due_at,
        "schedule_missed_catching_up"
      );
    }

    let request = InstantiateRequest {
      template_id: schedule.template_id.clone(),
      template_version: None,
      client_id: schedule.client_id.clone(),
      overrides: None,
      dedup_key: Some(format!("{}:{}", schedule.schedule_id, due_at.timestamp())),
    };

    match self.service.instantiate_assignment(request).await {
      Ok(assignment_id) => {
        info!(
          schedule_id = %schedule.schedule_id,
          assignment_id = %assignment_id,
          due_at = %due_at,
          "schedule_fired"
        );
      }
      // A broken template reference will never succeed; stop the schedule
      // rather than retrying forever.
      Err(e @ EngineError::Template(_)) => {
        warn!(schedule_id = %schedule.schedule_id, error = %e, "schedule_deactivated");
        schedule.is_active = false;
        self.persist_schedule(&schedule).await;
        return;
      }
      // Transient failure: leave next_run_at untouched so the next tick
      // retries the same due slot (the dedup key keeps it idempotent).
      Err(e) => {
        warn!(schedule_id = %schedule.schedule_id, error = %e, "schedule_fire_failed");
        return;
      }
    }

    schedule.last_run_at = Some(now);
    schedule.run_count += 1;
    schedule.next_run_at = next_after_run(&schedule, now);
    if let Some(end) = schedule.end_date {
      if schedule.next_run_at > end {
        schedule.is_active = false;
      }
    }
    self.persist_schedule(&schedule).await;
  }

  async fn persist_schedule(&self, schedule: &RecurringSchedule) {
    if let Err(e) = self.repository.upsert_schedule(schedule).await {
      warn!(schedule_id = %schedule.schedule_id, error = %e, "schedule_persist_failed");
    }
  }

  async fn run_due_followups(&self, now: DateTime<Utc>) {
    let due = match self.repository.list_due_followups(now).await {
      Ok(due) => due,
      Err(e) => {
        warn!(error = %e, "due_followup_query_failed");
        return;
      }
    };

    for followup in due {
      self.fire_followup(followup, now).await;
    }
  }

  async fn fire_followup(&self, mut followup: TaskFollowup, now: DateTime<Utc>) {
    let mut context = serde_json::Map::new();
    context.insert(
      "assignment_id".to_string(),
      serde_json::Value::String(followup.assignment_id.clone()),
    );
    context.insert(
      "task_id".to_string(),
      serde_json::Value::String(followup.task_id.clone()),
    );
    context.insert(
      "reminder_number".to_string(),
      serde_json::Value::from(followup.run_count + 1),
    );

    if let Err(e) = self
      .notifier
      .notify(&Recipient::Client, &followup.message_template_key, &context)
      .await
    {
      warn!(followup_id = %followup.followup_id, error = %e, "followup_notify_failed");
      // Retry on the next poll; the reminder was not delivered.
      return;
    }

    followup.run_count += 1;
    info!(
      followup_id = %followup.followup_id,
      run = followup.run_count,
      "followup_reminder_sent"
    );

    if followup.run_count == followup.escalate_after_runs {
      if let Err(e) = self
        .notifier
        .notify(&Recipient::Assignee, "followup-escalation", &context)
        .await
      {
        warn!(followup_id = %followup.followup_id, error = %e, "followup_escalation_failed");
      } else {
        info!(followup_id = %followup.followup_id, "followup_escalated");
      }
    }

    if followup.run_count >= followup.max_runs {
      followup.state = FollowupState::Completed;
      info!(followup_id = %followup.followup_id, "followup_completed");
    } else {
      let mut next = followup.next_run_at + chrono::Duration::days(followup.interval_days.max(1) as i64);
      while next <= now {
        next += chrono::Duration::days(followup.interval_days.max(1) as i64);
      }
      followup.next_run_at = next;
    }

    if let Err(e) = self.repository.upsert_followup(&followup).await {
      warn!(followup_id = %followup.followup_id, error = %e, "followup_persist_failed");
    }
  }
}
