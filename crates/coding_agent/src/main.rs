use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use checkpoint_store::FileCheckpointStore;
use clap::Parser;
use coding_agent::config::{
    compose_instructions, system_instructions_from_env, AgentConfig, AutoApprovalSettings,
};
use coding_agent::console::ConsoleHost;
use coding_agent::logging::init_logging;
use coding_agent::providers;
use coding_agent::runtime::TaskRunner;
use coding_agent::state::Generation;
use coding_agent::surface::NullSurface;
use coding_agent::task::{Task, TaskContext, TaskPhase};
use coding_agent::workspace::Workspace;

/// Run a coding task against a workspace.
#[derive(Debug, Parser)]
#[command(name = "coding_agent", version)]
struct Cli {
    /// Workspace root the agent may read and write.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Turn file replayed by the scripted provider.
    #[arg(long)]
    script: Option<PathBuf>,

    /// Approve every action without asking.
    #[arg(long)]
    auto_approve: bool,

    /// Resume the task with this id from its latest checkpoint.
    #[arg(long, value_name = "TASK_ID", conflicts_with = "task_id")]
    resume: Option<String>,

    /// Id for a new task. Defaults to a timestamp.
    #[arg(long)]
    task_id: Option<String>,

    /// Task description.
    prompt: Vec<String>,
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let mut config = AgentConfig::from_env().context("loading agent config")?;
    if cli.auto_approve {
        config.auto_approval = AutoApprovalSettings::all();
    }

    let workspace_root = cli
        .workspace
        .canonicalize()
        .with_context(|| format!("resolving workspace {}", cli.workspace.display()))?;
    let workspace = Workspace::new(&workspace_root, &config).map_err(anyhow::Error::msg)?;
    let store = FileCheckpointStore::open(&config.checkpoint_dir_for(&workspace_root), &workspace_root)
        .context("opening checkpoint store")?;

    let script = match &cli.script {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading script {}", path.display()))?,
        ),
        None => None,
    };
    let provider =
        providers::provider_from_env(script.as_deref()).context("selecting model provider")?;
    let profile = provider.profile();
    tracing::info!(provider = %profile.provider_id, model = %profile.model_id, "provider ready");

    let prompt = cli.prompt.join(" ");
    let (task_id, resuming) = match cli.resume {
        Some(task_id) => (task_id, true),
        None => {
            if prompt.trim().is_empty() {
                bail!("a task prompt is required unless --resume is given");
            }
            (cli.task_id.unwrap_or_else(generated_task_id), false)
        }
    };

    let context = TaskContext {
        task_id: task_id.clone(),
        config,
        instructions: compose_instructions(&system_instructions_from_env()),
        workspace,
        surface: Box::new(NullSurface::default()),
        store: Box::new(store),
        generation: Generation::claim(&Arc::new(AtomicU64::new(0))),
    };

    let runner = TaskRunner::new(provider);
    let mut host = ConsoleHost::new(io::stdin().lock(), io::stdout());
    let phase = if resuming {
        let mut task = Task::resume(context).with_context(|| format!("resuming task {task_id}"))?;
        runner.resume(&mut task, &mut host)
    } else {
        let mut task = Task::new(context).context("creating task")?;
        runner.run(&mut task, &prompt, Vec::new(), &mut host)
    };

    match phase {
        TaskPhase::Completed => {
            println!("Task {task_id} completed.");
            Ok(())
        }
        other => bail!("task {task_id} ended as {other:?}; resume with --resume {task_id}"),
    }
}

fn generated_task_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis());
    format!("task-{millis}")
}
