use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use praxis_actions::{ActionError, AgentInvoker, EndpointCaller, Notifier};
use praxis_engine::{CompletionEvidence, InstantiateRequest, WorkflowService};
use praxis_scheduler::{LocalLeaderLock, RecurrenceScheduler, SchedulerConfig};
use praxis_store::{AssignmentRepository, MemoryStore, SqliteStore, SystemClock};
use praxis_template::{MemoryTemplateStore, Recipient, TemplateStore, WorkflowTemplate};

/// Praxis - workflow template instantiation and auto-progression engine
#[derive(Parser)]
#[command(name = "praxis")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.praxis)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Validate a template file without publishing it
  Validate {
    /// Path to the template file (JSON)
    template_file: PathBuf,
  },

  /// Instantiate a template and drive it with completion events from stdin
  Run {
    /// Path to the template file (JSON)
    #[arg(long)]
    template: PathBuf,

    /// Client to bind the assignment to
    #[arg(long)]
    client: String,
  },

  /// Run the recurrence scheduler against the data-dir database
  Serve {
    /// Directory of template files to publish at startup
    #[arg(long)]
    templates: Option<PathBuf>,

    /// Poll interval in seconds
    #[arg(long, default_value_t = 30)]
    poll: u64,
  },
}

/// One line of stdin in `run` mode. Nodes are addressed by template key.
#[derive(serde::Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum CliEvent {
  Start {
    node: String,
  },
  Complete {
    node: String,
    #[serde(default)]
    checked_items: Vec<String>,
    #[serde(default)]
    completed_subtasks: Vec<String>,
    #[serde(default)]
    context: serde_json::Map<String, serde_json::Value>,
  },
  Update {
    node: String,
    #[serde(default)]
    checked_items: Vec<String>,
    #[serde(default)]
    completed_subtasks: Vec<String>,
    #[serde(default)]
    context: serde_json::Map<String, serde_json::Value>,
  },
  Skip {
    node: String,
  },
  Cancel {
    node: String,
  },
  Snapshot,
}

/// Collaborators that log dispatched side effects to stderr.
#[derive(Debug, Clone, Default)]
struct LogCollaborators;

#[async_trait]
impl Notifier for LogCollaborators {
  async fn notify(
    &self,
    recipient: &Recipient,
    template_key: &str,
    context: &serde_json::Map<String, serde_json::Value>,
  ) -> Result<(), ActionError> {
    eprintln!(
      "notify {:?} template={} context={}",
      recipient,
      template_key,
      serde_json::Value::Object(context.clone())
    );
    Ok(())
  }
}

#[async_trait]
impl AgentInvoker for LogCollaborators {
  async fn invoke(
    &self,
    agent_ref: &str,
    task_id: &str,
    input: &serde_json::Value,
    correlation_id: &str,
  ) -> Result<(), ActionError> {
    eprintln!("invoke agent={agent_ref} task={task_id} correlation={correlation_id} input={input}");
    Ok(())
  }
}

#[async_trait]
impl EndpointCaller for LogCollaborators {
  async fn call(
    &self,
    url: &str,
    method: &str,
    payload: &serde_json::Value,
  ) -> Result<(), ActionError> {
    eprintln!("call {method} {url} payload={payload}");
    Ok(())
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();

  let data_dir = cli.data_dir.unwrap_or_else(|| {
    dirs::home_dir()
      .expect("could not determine home directory")
      .join(".praxis")
  });

  match cli.command {
    Commands::Validate { template_file } => validate(template_file),
    Commands::Run { template, client } => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(run(template, client))
    }
    Commands::Serve { templates, poll } => {
      let rt = tokio::runtime::Runtime::new()?;
      rt.block_on(serve(templates, poll, data_dir))
    }
  }
}

fn validate(template_file: PathBuf) -> Result<()> {
  let template = load_template(&template_file)?;
  template
    .validate()
    .with_context(|| format!("template '{}' failed validation", template.template_id))?;
  println!("ok: {} ({} nodes)", template.template_id, template.node_count());
  Ok(())
}

async fn run(template_file: PathBuf, client: String) -> Result<()> {
  let template = load_template(&template_file)?;
  let template_id = template.template_id.clone();

  let templates = Arc::new(MemoryTemplateStore::new());
  let repository = Arc::new(MemoryStore::new());
  let cancel = CancellationToken::new();
  let service = Arc::new(WorkflowService::new(
    templates,
    repository,
    Arc::new(SystemClock),
    Arc::new(LogCollaborators),
    Arc::new(LogCollaborators),
    Arc::new(LogCollaborators),
    cancel.clone(),
  ));

  let version = service
    .publish_template(template)
    .await
    .context("failed to publish template")?;
  eprintln!("published {template_id} v{version}");

  let assignment_id = service
    .instantiate_assignment(InstantiateRequest {
      template_id,
      template_version: Some(version),
      client_id: client,
      overrides: None,
      dedup_key: None,
    })
    .await
    .context("failed to instantiate assignment")?;
  eprintln!("assignment {assignment_id} created; reading events from stdin");

  let stdin = std::io::stdin();
  for line in stdin.lock().lines() {
    let line = line?;
    if line.trim().is_empty() {
      continue;
    }
    let event: CliEvent = match serde_json::from_str(&line) {
      Ok(event) => event,
      Err(e) => {
        eprintln!("bad event: {e}");
        continue;
      }
    };
    if let Err(e) = apply_event(&service, &assignment_id, event).await {
      eprintln!("error: {e}");
    }
  }

  cancel.cancel();
  Ok(())
}

async fn apply_event(
  service: &WorkflowService<MemoryTemplateStore, MemoryStore>,
  assignment_id: &str,
  event: CliEvent,
) -> Result<()> {
  let snapshot = match event {
    CliEvent::Start { node } => {
      let node_id = resolve_node(service, assignment_id, &node).await?;
      service.start_task(&node_id).await?
    }
    CliEvent::Complete {
      node,
      checked_items,
      completed_subtasks,
      context,
    } => {
      let node_id = resolve_node(service, assignment_id, &node).await?;
      service
        .report_completion(
          &node_id,
          CompletionEvidence {
            checked_items,
            completed_subtasks,
            context,
          },
        )
        .await?
    }
    CliEvent::Update {
      node,
      checked_items,
      completed_subtasks,
      context,
    } => {
      let node_id = resolve_node(service, assignment_id, &node).await?;
      service
        .update_task_items(
          &node_id,
          CompletionEvidence {
            checked_items,
            completed_subtasks,
            context,
          },
        )
        .await?
    }
    CliEvent::Skip { node } => {
      let node_id = resolve_node(service, assignment_id, &node).await?;
      service.skip_node(&node_id).await?
    }
    CliEvent::Cancel { node } => {
      let node_id = resolve_node(service, assignment_id, &node).await?;
      service.cancel_node(&node_id).await?
    }
    CliEvent::Snapshot => service.get_assignment_snapshot(assignment_id).await?,
  };

  println!("{}", serde_json::to_string_pretty(&snapshot)?);
  Ok(())
}

/// Resolve a template key to the assignment node id it was cloned into.
async fn resolve_node<T, R>(
  service: &WorkflowService<T, R>,
  assignment_id: &str,
  key: &str,
) -> Result<String>
where
  T: TemplateStore,
  R: AssignmentRepository + 'static,
{
  let snapshot = service.get_assignment_snapshot(assignment_id).await?;
  for stage in &snapshot.assignment.stages {
    if stage.template_ref == key {
      return Ok(stage.node_id.clone());
    }
    for step in &stage.steps {
      if step.template_ref == key {
        return Ok(step.node_id.clone());
      }
      for task in &step.tasks {
        if task.template_ref == key {
          return Ok(task.node_id.clone());
        }
      }
    }
  }
  anyhow::bail!("no node with key '{key}' in assignment {assignment_id}")
}

async fn serve(templates_dir: Option<PathBuf>, poll: u64, data_dir: PathBuf) -> Result<()> {
  tokio::fs::create_dir_all(&data_dir)
    .await
    .with_context(|| format!("failed to create data dir: {}", data_dir.display()))?;
  let db_path = data_dir.join("praxis.db");

  let options = sqlx::sqlite::SqliteConnectOptions::new()
    .filename(&db_path)
    .create_if_missing(true);
  let pool = sqlx::sqlite::SqlitePool::connect_with(options)
    .await
    .with_context(|| format!("failed to open database: {}", db_path.display()))?;
  let store = SqliteStore::new(pool);
  store.migrate().await.context("failed to run migrations")?;

  let templates = Arc::new(MemoryTemplateStore::new());
  if let Some(dir) = templates_dir {
    publish_templates_from(&templates, &dir).await?;
  }

  let repository = Arc::new(store);
  let cancel = CancellationToken::new();
  let service = Arc::new(WorkflowService::new(
    templates,
    repository.clone(),
    Arc::new(SystemClock),
    Arc::new(LogCollaborators),
    Arc::new(LogCollaborators),
    Arc::new(LogCollaborators),
    cancel.clone(),
  ));

  let scheduler = RecurrenceScheduler::new(
    service,
    repository,
    Arc::new(SystemClock),
    Arc::new(LogCollaborators),
    LocalLeaderLock::new(),
    SchedulerConfig {
      poll_interval: std::time::Duration::from_secs(poll.max(1)),
    },
  );

  let shutdown = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      shutdown.cancel();
    }
  });

  scheduler.run(cancel).await;
  Ok(())
}

async fn publish_templates_from(
  templates: &Arc<MemoryTemplateStore>,
  dir: &PathBuf,
) -> Result<()> {
  let mut entries = tokio::fs::read_dir(dir)
    .await
    .with_context(|| format!("failed to read template dir: {}", dir.display()))?;
  while let Some(entry) = entries.next_entry().await? {
    let path = entry.path();
    if path.extension().and_then(|e| e.to_str()) != Some("json") {
      continue;
    }
    let template = load_template(&path)?;
    let template_id = template.template_id.clone();
    let version = templates
      .publish(template)
      .await
      .with_context(|| format!("failed to publish {}", path.display()))?;
    eprintln!("published {template_id} v{version}");
  }
  Ok(())
}

fn load_template(path: &PathBuf) -> Result<WorkflowTemplate> {
  let content = std::fs::read_to_string(path)
    .with_context(|| format!("failed to read template file: {}", path.display()))?;
  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse template file: {}", path.display()))
}
