//! Scheduler integration tests driven tick-by-tick against a manual clock.

use std::sync::{Arc, Mutex};

use chrono::{Duration, NaiveTime, TimeZone, Utc};
use praxis_actions::{ActionError, NoopCollaborators, Notifier};
use praxis_engine::WorkflowService;
use praxis_scheduler::{LocalLeaderLock, RecurrenceScheduler, SchedulerConfig};
use praxis_store::{
  AssignmentRepository, FollowupState, Frequency, ManualClock, MemoryStore, RecurringSchedule,
  TaskFollowup,
};
use praxis_template::{
  MemoryTemplateStore, Recipient, StageTemplate, StepTemplate, TaskTemplate, TemplateScope,
  TemplateStore, WorkflowTemplate,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct RecordingNotifier {
  calls: Mutex<Vec<(Recipient, String)>>,
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
  async fn notify(
    &self,
    recipient: &Recipient,
    template_key: &str,
    _context: &serde_json::Map<String, serde_json::Value>,
  ) -> Result<(), ActionError> {
    self
      .calls
      .lock()
      .unwrap()
      .push((recipient.clone(), template_key.to_string()));
    Ok(())
  }
}

fn template() -> WorkflowTemplate {
  WorkflowTemplate {
    template_id: "monthly-close".to_string(),
    name: "Monthly Close".to_string(),
    category: "accounting".to_string(),
    scope: TemplateScope::Global,
    version: 0,
    stages: vec![StageTemplate {
      key: "close".to_string(),
      name: "Close".to_string(),
      order: 1,
      auto_progress: true,
      require_all_steps_complete: true,
      progress_conditions: None,
      on_complete_actions: Vec::new(),
      steps: vec![StepTemplate {
        key: "reconcile".to_string(),
        name: "Reconcile".to_string(),
        order: 1,
        auto_progress: true,
        require_all_tasks_complete: true,
        progress_conditions: None,
        on_complete_actions: Vec::new(),
        tasks: vec![TaskTemplate {
          key: "bank-rec".to_string(),
          name: "Bank reconciliation".to_string(),
          order: 1,
          auto_progress: true,
          require_all_checklists_complete: true,
          require_all_subtasks_complete: true,
          client_visible: false,
          progress_conditions: None,
          on_complete_actions: Vec::new(),
          checklists: Vec::new(),
          subtasks: Vec::new(),
        }],
      }],
    }],
  }
}

struct Harness {
  scheduler: RecurrenceScheduler<MemoryTemplateStore, MemoryStore, LocalLeaderLock>,
  repository: Arc<MemoryStore>,
  clock: Arc<ManualClock>,
  notifier: Arc<RecordingNotifier>,
}

async fn harness() -> Harness {
  let clock = Arc::new(ManualClock::new(
    Utc.with_ymd_and_hms(2025, 2, 1, 9, 5, 0).unwrap(),
  ));
  let templates = Arc::new(MemoryTemplateStore::new());
  templates.publish(template()).await.unwrap();

  let repository = Arc::new(MemoryStore::new());
  let notifier = Arc::new(RecordingNotifier::default());
  let service = Arc::new(WorkflowService::new(
    templates,
    repository.clone(),
    clock.clone(),
    notifier.clone(),
    Arc::new(NoopCollaborators),
    Arc::new(NoopCollaborators),
    CancellationToken::new(),
  ));

  let scheduler = RecurrenceScheduler::new(
    service,
    repository.clone(),
    clock.clone(),
    notifier.clone(),
    LocalLeaderLock::new(),
    SchedulerConfig::default(),
  );

  Harness {
    scheduler,
    repository,
    clock,
    notifier,
  }
}

fn monthly_schedule() -> RecurringSchedule {
  RecurringSchedule {
    schedule_id: "sch-1".to_string(),
    template_id: "monthly-close".to_string(),
    client_id: "c-42".to_string(),
    frequency: Frequency::Monthly,
    interval: 1,
    day_of_week: None,
    day_of_month: Some(1),
    time_of_day: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
    next_run_at: Utc.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).unwrap(),
    last_run_at: None,
    run_count: 0,
    is_active: true,
    start_date: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
    end_date: None,
  }
}

#[tokio::test]
async fn due_schedule_fires_once_and_advances_on_the_grid() {
  let h = harness().await;
  h.repository.upsert_schedule(&monthly_schedule()).await.unwrap();

  // Ticked five minutes late: one assignment, next slot on the grid.
  h.scheduler.tick().await;

  let schedule = h.repository.get_schedule("sch-1").await.unwrap();
  assert_eq!(
    schedule.next_run_at,
    Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap()
  );
  assert_eq!(schedule.run_count, 1);
  assert_eq!(
    schedule.last_run_at,
    Some(Utc.with_ymd_and_hms(2025, 2, 1, 9, 5, 0).unwrap())
  );

  let dedup = format!("sch-1:{}", Utc.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).unwrap().timestamp());
  let assignment_id = h.repository.find_by_dedup_key(&dedup).await.unwrap();
  assert!(assignment_id.is_some());

  // The same tick re-run does nothing: the schedule is no longer due.
  h.scheduler.tick().await;
  let schedule = h.repository.get_schedule("sch-1").await.unwrap();
  assert_eq!(schedule.run_count, 1);
}

#[tokio::test]
async fn consecutive_late_ticks_do_not_drift() {
  let h = harness().await;
  let mut schedule = monthly_schedule();
  schedule.frequency = Frequency::Daily;
  schedule.day_of_month = None;
  h.repository.upsert_schedule(&schedule).await.unwrap();

  // Each day's poll lands a few minutes late; the grid must not slip.
  for day in 0..5 {
    h.clock.set(
      Utc.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).unwrap()
        + Duration::days(day)
        + Duration::minutes(3 + day as i64),
    );
    h.scheduler.tick().await;
  }

  let schedule = h.repository.get_schedule("sch-1").await.unwrap();
  assert_eq!(schedule.run_count, 5);
  assert_eq!(
    schedule.next_run_at,
    Utc.with_ymd_and_hms(2025, 2, 6, 9, 0, 0).unwrap()
  );
}

#[tokio::test]
async fn offline_gap_gets_one_catch_up_run() {
  let h = harness().await;
  let mut schedule = monthly_schedule();
  schedule.frequency = Frequency::Daily;
  schedule.day_of_month = None;
  h.repository.upsert_schedule(&schedule).await.unwrap();

  // The scheduler was down across four due slots.
  h.clock.set(Utc.with_ymd_and_hms(2025, 2, 5, 14, 0, 0).unwrap());
  h.scheduler.tick().await;

  let schedule = h.repository.get_schedule("sch-1").await.unwrap();
  // Exactly one catch-up run, then straight to the next future slot.
  assert_eq!(schedule.run_count, 1);
  assert_eq!(
    schedule.next_run_at,
    Utc.with_ymd_and_hms(2025, 2, 6, 9, 0, 0).unwrap()
  );
}

#[tokio::test]
async fn schedule_past_its_end_date_deactivates_without_firing() {
  let h = harness().await;
  let mut schedule = monthly_schedule();
  schedule.end_date = Some(Utc.with_ymd_and_hms(2025, 1, 31, 0, 0, 0).unwrap());
  h.repository.upsert_schedule(&schedule).await.unwrap();

  h.scheduler.tick().await;

  let schedule = h.repository.get_schedule("sch-1").await.unwrap();
  assert!(!schedule.is_active);
  assert_eq!(schedule.run_count, 0);
}

#[tokio::test]
async fn broken_template_reference_deactivates_the_schedule() {
  let h = harness().await;
  let mut schedule = monthly_schedule();
  schedule.template_id = "no-such-template".to_string();
  h.repository.upsert_schedule(&schedule).await.unwrap();

  h.scheduler.tick().await;

  let schedule = h.repository.get_schedule("sch-1").await.unwrap();
  assert!(!schedule.is_active);
  assert_eq!(schedule.run_count, 0);
}

#[tokio::test]
async fn followup_reminders_escalate_and_complete() {
  let h = harness().await;

  // A followup needs a real task to attach to; seed one via the schedule.
  h.repository.upsert_schedule(&monthly_schedule()).await.unwrap();
  h.scheduler.tick().await;
  let assignment_id = h
    .repository
    .find_by_dedup_key(&format!(
      "sch-1:{}",
      Utc.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).unwrap().timestamp()
    ))
    .await
    .unwrap()
    .expect("seed assignment");
  let assignment = h.repository.get_assignment(&assignment_id).await.unwrap();
  let task_id = assignment.stages[0].steps[0].tasks[0].node_id.clone();

  h.repository
    .upsert_followup(&TaskFollowup {
      followup_id: "fu-1".to_string(),
      assignment_id: assignment_id.clone(),
      task_id,
      state: FollowupState::Active,
      interval_days: 1,
      next_run_at: Utc.with_ymd_and_hms(2025, 2, 2, 9, 0, 0).unwrap(),
      escalate_after_runs: 2,
      max_runs: 3,
      run_count: 0,
      message_template_key: "docs-reminder".to_string(),
    })
    .await
    .unwrap();

  // Run the followup to exhaustion, one due day at a time.
  for day in 2..=4 {
    h.clock.set(Utc.with_ymd_and_hms(2025, 2, day, 9, 30, 0).unwrap());
    h.scheduler.tick().await;
  }

  let followup = h.repository.get_followup("fu-1").await.unwrap();
  assert_eq!(followup.run_count, 3);
  assert_eq!(followup.state, FollowupState::Completed);

  let calls = h.notifier.calls.lock().unwrap();
  let reminders = calls
    .iter()
    .filter(|(r, key)| matches!(r, Recipient::Client) && key == "docs-reminder")
    .count();
  let escalations = calls
    .iter()
    .filter(|(r, key)| matches!(r, Recipient::Assignee) && key == "followup-escalation")
    .count();
  assert_eq!(reminders, 3);
  assert_eq!(escalations, 1);
}

#[tokio::test]
async fn paused_followup_does_not_fire() {
  let h = harness().await;
  let schedule = monthly_schedule();
  h.repository.upsert_schedule(&schedule).await.unwrap();
  h.scheduler.tick().await;
  let assignment_id = h
    .repository
    .find_by_dedup_key(&format!(
      "sch-1:{}",
      Utc.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).unwrap().timestamp()
    ))
    .await
    .unwrap()
    .expect("assignment");
  let assignment = h.repository.get_assignment(&assignment_id).await.unwrap();
  let task_id = assignment.stages[0].steps[0].tasks[0].node_id.clone();

  h.repository
    .upsert_followup(&TaskFollowup {
      followup_id: "fu-1".to_string(),
      assignment_id,
      task_id,
      state: FollowupState::Paused,
      interval_days: 1,
      next_run_at: Utc.with_ymd_and_hms(2025, 2, 2, 9, 0, 0).unwrap(),
      escalate_after_runs: 2,
      max_runs: 3,
      run_count: 0,
      message_template_key: "docs-reminder".to_string(),
    })
    .await
    .unwrap();

  h.clock.set(Utc.with_ymd_and_hms(2025, 2, 3, 9, 0, 0).unwrap());
  h.scheduler.tick().await;

  let followup = h.repository.get_followup("fu-1").await.unwrap();
  assert_eq!(followup.run_count, 0);
  assert!(h.notifier.calls.lock().unwrap().iter().all(|(_, k)| k != "docs-reminder"));
}
