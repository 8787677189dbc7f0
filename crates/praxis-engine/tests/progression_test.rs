//! Integration tests for the progression engine against the in-memory
//! store and a manual clock.

use std::sync::{Arc, Mutex};

use chrono::TimeZone;
use praxis_actions::{ActionError, AgentInvoker, NoopCollaborators, Notifier};
use praxis_assignment::{AssignmentStatus, NodeStatus};
use praxis_engine::{
  AgentResult, CompletionEvidence, EngineError, InstantiateRequest, WorkflowService,
};
use praxis_store::{ManualClock, MemoryStore};
use praxis_template::{
  ActionKind, ActionSpec, ChecklistTemplate, Comparator, Condition, MemoryTemplateStore,
  Recipient, RetryBackoff, RetryPolicy, StageTemplate, StepTemplate, TaskTemplate, TemplateScope,
  WorkflowTemplate,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

type Service = WorkflowService<MemoryTemplateStore, MemoryStore>;

/// A notifier that records every call.
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

/// A notifier that always fails, to exercise retry and suppression.
#[derive(Debug, Default)]
struct FailingNotifier {
  attempts: Mutex<u32>,
}

#[async_trait::async_trait]
impl Notifier for FailingNotifier {
  async fn notify(
    &self,
    _recipient: &Recipient,
    _template_key: &str,
    _context: &serde_json::Map<String, serde_json::Value>,
  ) -> Result<(), ActionError> {
    *self.attempts.lock().unwrap() += 1;
    Err(ActionError::dispatch("gateway unavailable"))
  }
}

/// An agent client that records invocations.
#[derive(Debug, Default)]
struct RecordingAgent {
  invocations: Mutex<Vec<(String, String, String)>>,
}

#[async_trait::async_trait]
impl AgentInvoker for RecordingAgent {
  async fn invoke(
    &self,
    agent_ref: &str,
    task_id: &str,
    _input: &serde_json::Value,
    correlation_id: &str,
  ) -> Result<(), ActionError> {
    self.invocations.lock().unwrap().push((
      agent_ref.to_string(),
      task_id.to_string(),
      correlation_id.to_string(),
    ));
    Ok(())
  }
}

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

/// A minimal tax engagement: Stage "Intake" (Step "Collect Docs" → Task
/// "Upload W-2") followed by Stage "Review".
fn tax_filing_template() -> WorkflowTemplate {
  WorkflowTemplate {
    template_id: "tax-filing".to_string(),
    name: "Tax Filing".to_string(),
    category: "tax".to_string(),
    scope: TemplateScope::Global,
    version: 0,
    stages: vec![
      stage("intake", 1, vec![step("collect-docs", 1, vec![task("upload-w2", 1)])]),
      stage("review", 2, vec![step("final-check", 1, vec![task("verify-return", 1)])]),
    ],
  }
}

struct Harness {
  service: Arc<Service>,
  clock: Arc<ManualClock>,
  notifier: Arc<RecordingNotifier>,
  agent: Arc<RecordingAgent>,
}

fn harness() -> Harness {
  let clock = Arc::new(ManualClock::new(
    chrono::Utc.with_ymd_and_hms(2025, 2, 1, 9, 0, 0).unwrap(),
  ));
  let notifier = Arc::new(RecordingNotifier::default());
  let agent = Arc::new(RecordingAgent::default());
  let service = Arc::new(WorkflowService::new(
    Arc::new(MemoryTemplateStore::new()),
    Arc::new(MemoryStore::new()),
    clock.clone(),
    notifier.clone(),
    agent.clone(),
    Arc::new(NoopCollaborators),
    CancellationToken::new(),
  ));
  Harness {
    service,
    clock,
    notifier,
    agent,
  }
}

async fn instantiate(service: &Service, template: WorkflowTemplate, client: &str) -> String {
  let template_id = template.template_id.clone();
  service.publish_template(template).await.unwrap();
  service
    .instantiate_assignment(InstantiateRequest {
      template_id,
      template_version: None,
      client_id: client.to_string(),
      overrides: None,
      dedup_key: None,
    })
    .await
    .unwrap()
}

async fn node_id(service: &Service, assignment_id: &str, key: &str) -> String {
  let snapshot = service.get_assignment_snapshot(assignment_id).await.unwrap();
  for stage in &snapshot.assignment.stages {
    if stage.template_ref == key {
      return stage.node_id.clone();
    }
    for step in &stage.steps {
      if step.template_ref == key {
        return step.node_id.clone();
      }
      for task in &step.tasks {
        if task.template_ref == key {
          return task.node_id.clone();
        }
      }
    }
  }
  panic!("no node with key '{key}'");
}

async fn node_status(service: &Service, assignment_id: &str, key: &str) -> NodeStatus {
  let snapshot = service.get_assignment_snapshot(assignment_id).await.unwrap();
  let id = node_id(service, assignment_id, key).await;
  let path = snapshot.assignment.locate(&id).unwrap();
  snapshot.assignment.node_status(path)
}

#[tokio::test]
async fn tax_filing_scenario_cascades_into_review() {
  let h = harness();
  let assignment_id = instantiate(&h.service, tax_filing_template(), "c-42").await;

  // Freshly instantiated: not started, pointer on the first leaf.
  let snapshot = h.service.get_assignment_snapshot(&assignment_id).await.unwrap();
  assert_eq!(snapshot.assignment.status, AssignmentStatus::NotStarted);
  let upload = node_id(&h.service, &assignment_id, "upload-w2").await;
  let pointer = snapshot.assignment.pointer.clone().unwrap();
  assert_eq!(pointer.task_id.as_deref(), Some(upload.as_str()));

  // Completing the only task cascades: task → step → stage, and the
  // pointer advances into the Review stage.
  let snapshot = h
    .service
    .report_completion(&upload, CompletionEvidence::default())
    .await
    .unwrap();

  assert_eq!(node_status(&h.service, &assignment_id, "upload-w2").await, NodeStatus::Completed);
  assert_eq!(node_status(&h.service, &assignment_id, "collect-docs").await, NodeStatus::Completed);
  assert_eq!(node_status(&h.service, &assignment_id, "intake").await, NodeStatus::Completed);
  assert_eq!(snapshot.assignment.status, AssignmentStatus::InProgress);

  let verify = node_id(&h.service, &assignment_id, "verify-return").await;
  let pointer = snapshot.assignment.pointer.clone().unwrap();
  assert_eq!(pointer.task_id.as_deref(), Some(verify.as_str()));
  assert_eq!(snapshot.progress, 50);

  // Completing the last task completes the assignment.
  let snapshot = h
    .service
    .report_completion(&verify, CompletionEvidence::default())
    .await
    .unwrap();
  assert_eq!(snapshot.assignment.status, AssignmentStatus::Completed);
  assert!(snapshot.assignment.pointer.is_none());
  assert_eq!(snapshot.progress, 100);
}

#[tokio::test]
async fn clone_preserves_sibling_order_and_node_count() {
  let h = harness();
  // Orders deliberately authored out of list order.
  let template = WorkflowTemplate {
    template_id: "onboarding".to_string(),
    name: "Onboarding".to_string(),
    category: "ops".to_string(),
    scope: TemplateScope::Global,
    version: 0,
    stages: vec![
      stage("wrap-up", 3, vec![step("close", 1, vec![task("send-summary", 1)])]),
      stage(
        "kickoff",
        1,
        vec![step(
          "setup",
          1,
          vec![task("welcome-call", 2), task("collect-ids", 1), task("sign-engagement", 3)],
        )],
      ),
      stage("fieldwork", 2, vec![step("execute", 1, vec![task("do-work", 1)])]),
    ],
  };
  let node_count = template.node_count();

  let assignment_id = instantiate(&h.service, template, "c-7").await;
  let snapshot = h.service.get_assignment_snapshot(&assignment_id).await.unwrap();

  assert_eq!(snapshot.assignment.node_count(), node_count);

  let stage_keys: Vec<&str> = snapshot
    .assignment
    .stages
    .iter()
    .map(|s| s.template_ref.as_str())
    .collect();
  assert_eq!(stage_keys, vec!["kickoff", "fieldwork", "wrap-up"]);

  let task_orders: Vec<u32> = snapshot.assignment.stages[0].steps[0]
    .tasks
    .iter()
    .map(|t| t.order)
    .collect();
  assert_eq!(task_orders, vec![1, 2, 3]);

  // Every clone node points back at its template origin.
  assert_eq!(
    snapshot.assignment.stages[0].steps[0].tasks[0].template_ref,
    "collect-ids"
  );
}

#[tokio::test]
async fn pointer_never_moves_backwards() {
  let h = harness();
  let template = WorkflowTemplate {
    template_id: "sequence".to_string(),
    name: "Sequence".to_string(),
    category: "ops".to_string(),
    scope: TemplateScope::Global,
    version: 0,
    stages: vec![stage(
      "only",
      1,
      vec![step(
        "steps",
        1,
        vec![task("a", 1), task("b", 2), task("c", 3)],
      )],
    )],
  };
  let assignment_id = instantiate(&h.service, template, "c-1").await;

  // Complete out of order: b first, then a, then c.
  let b = node_id(&h.service, &assignment_id, "b").await;
  let snapshot = h
    .service
    .report_completion(&b, CompletionEvidence::default())
    .await
    .unwrap();
  let c = node_id(&h.service, &assignment_id, "c").await;
  // Pointer advanced past b, not back to the pending a.
  assert_eq!(
    snapshot.assignment.pointer.clone().unwrap().task_id.as_deref(),
    Some(c.as_str())
  );

  let a = node_id(&h.service, &assignment_id, "a").await;
  let snapshot = h
    .service
    .report_completion(&a, CompletionEvidence::default())
    .await
    .unwrap();
  // Forward from a, the next unfinished task is c — never backwards.
  assert_eq!(
    snapshot.assignment.pointer.clone().unwrap().task_id.as_deref(),
    Some(c.as_str())
  );

  let snapshot = h
    .service
    .report_completion(&c, CompletionEvidence::default())
    .await
    .unwrap();
  assert_eq!(snapshot.assignment.status, AssignmentStatus::Completed);
}

#[tokio::test]
async fn unknown_context_field_fails_closed() {
  let h = harness();
  let mut template = tax_filing_template();
  template.stages[0].steps[0].tasks[0].progress_conditions = Some(Condition::Field {
    field: "documents_received".to_string(),
    cmp: Comparator::Gte,
    value: json!(1),
  });
  let assignment_id = instantiate(&h.service, template, "c-42").await;
  let upload = node_id(&h.service, &assignment_id, "upload-w2").await;

  // The field is never set: evaluation fails and must read as "not met",
  // never as "true".
  let err = h
    .service
    .report_completion(&upload, CompletionEvidence::default())
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::PreconditionNotMet { .. }));
  assert_eq!(node_status(&h.service, &assignment_id, "upload-w2").await, NodeStatus::Pending);

  // Supplying the field lets the same event through.
  let mut evidence = CompletionEvidence::default();
  evidence.context.insert("documents_received".to_string(), json!(2));
  h.service.report_completion(&upload, evidence).await.unwrap();
  assert_eq!(
    node_status(&h.service, &assignment_id, "upload-w2").await,
    NodeStatus::Completed
  );
}

#[tokio::test]
async fn rejected_completion_leaves_evidence_unapplied() {
  let h = harness();
  let mut template = tax_filing_template();
  template.stages[0].steps[0].tasks[0].checklists = vec![
    ChecklistTemplate {
      key: "w2-scanned".to_string(),
      label: "W-2 scanned".to_string(),
      required: true,
    },
    ChecklistTemplate {
      key: "w2-verified".to_string(),
      label: "W-2 verified".to_string(),
      required: true,
    },
  ];
  let assignment_id = instantiate(&h.service, template, "c-42").await;
  let upload = node_id(&h.service, &assignment_id, "upload-w2").await;

  // One of two required items checked: the completion is rejected and the
  // whole event — including the checkmark — is discarded.
  let mut evidence = CompletionEvidence::default();
  evidence.checked_items.push("w2-scanned".to_string());
  let err = h.service.report_completion(&upload, evidence).await.unwrap_err();
  assert!(matches!(err, EngineError::PreconditionNotMet { .. }));

  let snapshot = h.service.get_assignment_snapshot(&assignment_id).await.unwrap();
  let task = &snapshot.assignment.stages[0].steps[0].tasks[0];
  assert!(task.checklists.iter().all(|c| !c.checked));
}

#[tokio::test]
async fn auto_progress_task_completes_from_item_updates_alone() {
  let h = harness();
  let mut template = tax_filing_template();
  template.stages[0].steps[0].tasks[0].checklists = vec![ChecklistTemplate {
    key: "w2-scanned".to_string(),
    label: "W-2 scanned".to_string(),
    required: true,
  }];
  let assignment_id = instantiate(&h.service, template, "c-42").await;
  let upload = node_id(&h.service, &assignment_id, "upload-w2").await;

  let mut evidence = CompletionEvidence::default();
  evidence.checked_items.push("w2-scanned".to_string());
  let snapshot = h.service.update_task_items(&upload, evidence).await.unwrap();

  // auto_progress: checking the last required item completed the task and
  // cascaded through the stage.
  assert_eq!(node_status(&h.service, &assignment_id, "intake").await, NodeStatus::Completed);
  assert_eq!(snapshot.assignment.status, AssignmentStatus::InProgress);
}

#[tokio::test]
async fn manual_task_waits_for_explicit_completion() {
  let h = harness();
  let mut template = tax_filing_template();
  template.stages[0].steps[0].tasks[0].auto_progress = false;
  template.stages[0].steps[0].tasks[0].checklists = vec![ChecklistTemplate {
    key: "w2-scanned".to_string(),
    label: "W-2 scanned".to_string(),
    required: true,
  }];
  let assignment_id = instantiate(&h.service, template, "c-42").await;
  let upload = node_id(&h.service, &assignment_id, "upload-w2").await;

  // All prerequisites met, but the task is not auto-progressing: it stays
  // in progress until an explicit completion event arrives.
  let mut evidence = CompletionEvidence::default();
  evidence.checked_items.push("w2-scanned".to_string());
  h.service.update_task_items(&upload, evidence).await.unwrap();
  assert_eq!(
    node_status(&h.service, &assignment_id, "upload-w2").await,
    NodeStatus::InProgress
  );

  h.service
    .report_completion(&upload, CompletionEvidence::default())
    .await
    .unwrap();
  assert_eq!(
    node_status(&h.service, &assignment_id, "upload-w2").await,
    NodeStatus::Completed
  );
}

#[tokio::test]
async fn step_condition_gates_the_cascade() {
  let h = harness();
  let mut template = tax_filing_template();
  template.stages[0].steps[0].progress_conditions = Some(Condition::Field {
    field: "documents_received".to_string(),
    cmp: Comparator::Gte,
    value: json!(2),
  });
  let assignment_id = instantiate(&h.service, template, "c-42").await;
  let upload = node_id(&h.service, &assignment_id, "upload-w2").await;

  // Task completes, but the step's own condition blocks the cascade.
  let mut evidence = CompletionEvidence::default();
  evidence.context.insert("documents_received".to_string(), json!(1));
  h.service.report_completion(&upload, evidence).await.unwrap();
  assert_eq!(
    node_status(&h.service, &assignment_id, "collect-docs").await,
    NodeStatus::InProgress
  );

  // New evidence satisfies the condition; an explicit step completion
  // goes through and cascades into the stage.
  let collect = node_id(&h.service, &assignment_id, "collect-docs").await;
  let mut evidence = CompletionEvidence::default();
  evidence.context.insert("documents_received".to_string(), json!(2));
  h.service.report_completion(&collect, evidence).await.unwrap();
  assert_eq!(node_status(&h.service, &assignment_id, "intake").await, NodeStatus::Completed);
}

#[tokio::test]
async fn completed_node_rejects_further_events() {
  let h = harness();
  let assignment_id = instantiate(&h.service, tax_filing_template(), "c-42").await;
  let upload = node_id(&h.service, &assignment_id, "upload-w2").await;

  h.service
    .report_completion(&upload, CompletionEvidence::default())
    .await
    .unwrap();
  let err = h
    .service
    .report_completion(&upload, CompletionEvidence::default())
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::InvalidState { .. }));
}

#[tokio::test]
async fn skipping_a_task_satisfies_the_parent_rule() {
  let h = harness();
  let template = WorkflowTemplate {
    template_id: "two-tasks".to_string(),
    name: "Two Tasks".to_string(),
    category: "ops".to_string(),
    scope: TemplateScope::Global,
    version: 0,
    stages: vec![stage(
      "only",
      1,
      vec![step("steps", 1, vec![task("a", 1), task("b", 2)])],
    )],
  };
  let assignment_id = instantiate(&h.service, template, "c-1").await;

  let a = node_id(&h.service, &assignment_id, "a").await;
  h.service
    .report_completion(&a, CompletionEvidence::default())
    .await
    .unwrap();

  let b = node_id(&h.service, &assignment_id, "b").await;
  let snapshot = h.service.skip_node(&b).await.unwrap();

  // Skipped counts as complete for the parent's rule; the whole
  // assignment finishes without b's work.
  assert_eq!(node_status(&h.service, &assignment_id, "b").await, NodeStatus::Skipped);
  assert_eq!(snapshot.assignment.status, AssignmentStatus::Completed);
}

#[tokio::test]
async fn cancellation_is_non_retroactive_and_makes_the_tree_read_only() {
  let h = harness();
  let assignment_id = instantiate(&h.service, tax_filing_template(), "c-42").await;
  let upload = node_id(&h.service, &assignment_id, "upload-w2").await;
  h.service
    .report_completion(&upload, CompletionEvidence::default())
    .await
    .unwrap();

  let snapshot = h.service.cancel_assignment(&assignment_id).await.unwrap();
  assert_eq!(snapshot.assignment.status, AssignmentStatus::Cancelled);
  // Completed work is untouched; unfinished work is cancelled.
  assert_eq!(node_status(&h.service, &assignment_id, "intake").await, NodeStatus::Completed);
  assert_eq!(
    node_status(&h.service, &assignment_id, "verify-return").await,
    NodeStatus::Cancelled
  );

  // Terminal assignments are audit records.
  let verify = node_id(&h.service, &assignment_id, "verify-return").await;
  let err = h
    .service
    .report_completion(&verify, CompletionEvidence::default())
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::InvalidState { .. }));
}

#[tokio::test]
async fn agent_reply_round_trip_completes_the_target_task() {
  let h = harness();
  let mut template = tax_filing_template();
  // Completing the intake task hands the review task to an agent.
  template.stages[0].steps[0].tasks[0].on_complete_actions = vec![ActionSpec {
    kind: ActionKind::InvokeAgent {
      agent_ref: "tax-reviewer".to_string(),
      input: json!({ "year": 2024 }),
      target: Some("verify-return".to_string()),
    },
    guard: None,
    retry: RetryPolicy::default(),
  }];
  let assignment_id = instantiate(&h.service, template, "c-42").await;
  let upload = node_id(&h.service, &assignment_id, "upload-w2").await;

  h.service
    .report_completion(&upload, CompletionEvidence::default())
    .await
    .unwrap();

  // Action dispatch is fire-and-forget; wait for the spawned task.
  let correlation_id = wait_for(|| {
    h.agent
      .invocations
      .lock()
      .unwrap()
      .first()
      .map(|(_, _, c)| c.clone())
  })
  .await;

  let verify = node_id(&h.service, &assignment_id, "verify-return").await;
  let (_, invoked_task, _) = h.agent.invocations.lock().unwrap()[0].clone();
  assert_eq!(invoked_task, verify);

  // The agent's reply re-enters the engine as a synthetic completion for
  // the target task and finishes the assignment.
  let snapshot = h
    .service
    .on_agent_result(
      &correlation_id,
      AgentResult::Output {
        output: json!({ "approved": true }),
      },
    )
    .await
    .unwrap();
  assert_eq!(snapshot.assignment.status, AssignmentStatus::Completed);
  assert_eq!(snapshot.assignment.context["agent_output"], json!({ "approved": true }));

  // The correlation id is consumed.
  let err = h
    .service
    .on_agent_result(&correlation_id, AgentResult::Output { output: json!({}) })
    .await
    .unwrap_err();
  assert!(matches!(err, EngineError::UnknownCorrelation { .. }));
}

#[tokio::test]
async fn agent_error_never_completes_the_task() {
  let h = harness();
  let mut template = tax_filing_template();
  template.stages[0].steps[0].tasks[0].on_complete_actions = vec![ActionSpec {
    kind: ActionKind::InvokeAgent {
      agent_ref: "tax-reviewer".to_string(),
      input: json!({}),
      target: Some("verify-return".to_string()),
    },
    guard: None,
    retry: RetryPolicy::default(),
  }];
  let assignment_id = instantiate(&h.service, template, "c-42").await;
  let upload = node_id(&h.service, &assignment_id, "upload-w2").await;
  h.service
    .report_completion(&upload, CompletionEvidence::default())
    .await
    .unwrap();

  let correlation_id = wait_for(|| {
    h.agent
      .invocations
      .lock()
      .unwrap()
      .first()
      .map(|(_, _, c)| c.clone())
  })
  .await;

  let snapshot = h
    .service
    .on_agent_result(
      &correlation_id,
      AgentResult::Error {
        message: "model timeout".to_string(),
      },
    )
    .await
    .unwrap();

  assert_ne!(snapshot.assignment.status, AssignmentStatus::Completed);
  assert_eq!(
    node_status(&h.service, &assignment_id, "verify-return").await,
    NodeStatus::InProgress
  );
  assert_eq!(
    snapshot.assignment.context["verify-return_agent_error"],
    json!("model timeout")
  );
}

#[tokio::test]
async fn notify_action_fires_after_the_transition_commits() {
  let h = harness();
  let mut template = tax_filing_template();
  template.stages[0].on_complete_actions = vec![ActionSpec {
    kind: ActionKind::Notify {
      recipient: Recipient::Client,
      template_key: "intake-complete".to_string(),
      context: serde_json::Map::new(),
    },
    guard: None,
    retry: RetryPolicy::default(),
  }];
  let assignment_id = instantiate(&h.service, template, "c-42").await;
  let upload = node_id(&h.service, &assignment_id, "upload-w2").await;
  h.service
    .report_completion(&upload, CompletionEvidence::default())
    .await
    .unwrap();

  let key = wait_for(|| {
    h.notifier
      .calls
      .lock()
      .unwrap()
      .first()
      .map(|(_, key)| key.clone())
  })
  .await;
  assert_eq!(key, "intake-complete");
}

#[tokio::test]
async fn guard_condition_skips_the_action_silently() {
  let h = harness();
  let mut template = tax_filing_template();
  template.stages[0].on_complete_actions = vec![ActionSpec {
    kind: ActionKind::Notify {
      recipient: Recipient::Client,
      template_key: "never-sent".to_string(),
      context: serde_json::Map::new(),
    },
    guard: Some(Condition::Field {
      field: "wants_updates".to_string(),
      cmp: Comparator::Eq,
      value: json!(true),
    }),
    retry: RetryPolicy::default(),
  }];
  let assignment_id = instantiate(&h.service, template, "c-42").await;
  let upload = node_id(&h.service, &assignment_id, "upload-w2").await;
  h.service
    .report_completion(&upload, CompletionEvidence::default())
    .await
    .unwrap();

  // Guard references an unset field: fail-closed, action skipped.
  tokio::time::sleep(std::time::Duration::from_millis(50)).await;
  assert!(h.notifier.calls.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancelling_suppresses_queued_action_retries() {
  let h = harness();
  let failing = Arc::new(FailingNotifier::default());
  let cancel = CancellationToken::new();
  let service: Arc<Service> = Arc::new(WorkflowService::new(
    Arc::new(MemoryTemplateStore::new()),
    Arc::new(MemoryStore::new()),
    h.clock.clone(),
    failing.clone(),
    Arc::new(NoopCollaborators),
    Arc::new(NoopCollaborators),
    cancel.clone(),
  ));

  let mut template = tax_filing_template();
  template.stages[0].steps[0].tasks[0].on_complete_actions = vec![ActionSpec {
    kind: ActionKind::Notify {
      recipient: Recipient::Client,
      template_key: "doomed".to_string(),
      context: serde_json::Map::new(),
    },
    guard: None,
    retry: RetryPolicy {
      max_attempts: 5,
      base_delay_ms: 60_000,
      backoff: RetryBackoff::Fixed,
    },
  }];
  let assignment_id = instantiate(&service, template, "c-42").await;
  let upload = node_id(&service, &assignment_id, "upload-w2").await;
  service
    .report_completion(&upload, CompletionEvidence::default())
    .await
    .unwrap();

  // Let the first attempt fail, then cancel before the retry delay ends.
  tokio::time::sleep(std::time::Duration::from_millis(10)).await;
  assert_eq!(*failing.attempts.lock().unwrap(), 1);

  service.cancel_assignment(&assignment_id).await.unwrap();
  tokio::time::sleep(std::time::Duration::from_secs(600)).await;

  // The queued retries were suppressed, not delivered.
  assert_eq!(*failing.attempts.lock().unwrap(), 1);
  cancel.cancel();
}

#[tokio::test]
async fn instantiation_is_idempotent_under_a_dedup_key() {
  let h = harness();
  let template = tax_filing_template();
  let template_id = template.template_id.clone();
  h.service.publish_template(template).await.unwrap();

  let request = InstantiateRequest {
    template_id,
    template_version: None,
    client_id: "c-42".to_string(),
    overrides: None,
    dedup_key: Some("schedule-1:1738400400".to_string()),
  };
  let first = h.service.instantiate_assignment(request.clone()).await.unwrap();
  let second = h.service.instantiate_assignment(request).await.unwrap();
  assert_eq!(first, second);
}

#[tokio::test]
async fn version_pinning_survives_later_publishes() {
  let h = harness();
  let template = tax_filing_template();
  let template_id = template.template_id.clone();
  h.service.publish_template(template.clone()).await.unwrap();

  let assignment_id = h
    .service
    .instantiate_assignment(InstantiateRequest {
      template_id: template_id.clone(),
      template_version: Some(1),
      client_id: "c-42".to_string(),
      overrides: None,
      dedup_key: None,
    })
    .await
    .unwrap();

  // A new published version does not touch the existing assignment.
  let mut v2 = template;
  v2.stages[0].steps[0].tasks.push(task("extra", 9));
  h.service.publish_template(v2).await.unwrap();

  let snapshot = h.service.get_assignment_snapshot(&assignment_id).await.unwrap();
  assert_eq!(snapshot.assignment.template_version, 1);
  assert_eq!(snapshot.assignment.stages[0].steps[0].tasks.len(), 1);
}

/// Poll for a value produced by a spawned action task.
async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
  for _ in 0..200 {
    if let Some(value) = probe() {
      return value;
    }
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
  }
  panic!("condition not reached in time");
}
