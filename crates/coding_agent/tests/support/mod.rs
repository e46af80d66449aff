#![allow(dead_code)]

use std::fs;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use agent_provider::{RunEvent, RunId, RunMessage};
use checkpoint_store::{CheckpointStore, MemoryCheckpointStore};
use coding_agent::checkpoint::SharedStore;
use coding_agent::config::AgentConfig;
use coding_agent::state::Generation;
use coding_agent::surface::RecordingSurface;
use coding_agent::task::{ApprovalRequest, Presentation, Task, TaskContext, TaskHost};
use coding_agent::workspace::Workspace;
use tempfile::{tempdir, TempDir};

pub const TASK_ID: &str = "task-test";

#[derive(Default)]
pub struct HostSpy {
    next_run_id: RunId,
    pub started: Vec<(RunId, Vec<RunMessage>)>,
    pub cancelled_runs: Vec<RunId>,
    pub presented: Vec<Presentation>,
    pub approvals: Vec<ApprovalRequest>,
    pub start_error: Option<String>,
}

impl HostSpy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_run_id(&self) -> RunId {
        self.started.last().map(|(run_id, _)| *run_id).expect("a run was started")
    }

    /// Text of the newest user message sent with request `index`.
    pub fn user_input(&self, index: usize) -> &str {
        self.started[index]
            .1
            .iter()
            .rev()
            .find(|message| message.is_user())
            .map(RunMessage::text)
            .expect("request carries a user message")
    }

    pub fn last_user_input(&self) -> &str {
        self.user_input(self.started.len() - 1)
    }

    pub fn last_approval(&self) -> &ApprovalRequest {
        self.approvals.last().expect("an approval was requested")
    }

    pub fn narration(&self) -> Vec<String> {
        self.presented
            .iter()
            .filter_map(|presentation| match presentation {
                Presentation::Narration {
                    text,
                    partial: false,
                } => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

impl TaskHost for HostSpy {
    fn start_run(
        &mut self,
        messages: Vec<RunMessage>,
        _instructions: String,
    ) -> Result<RunId, String> {
        if let Some(error) = self.start_error.clone() {
            return Err(error);
        }
        self.next_run_id += 1;
        self.started.push((self.next_run_id, messages));
        Ok(self.next_run_id)
    }

    fn cancel_run(&mut self, run_id: RunId) {
        self.cancelled_runs.push(run_id);
    }

    fn present(&mut self, presentation: Presentation) {
        self.presented.push(presentation);
    }

    fn request_approval(&mut self, request: ApprovalRequest) {
        self.approvals.push(request);
    }
}

/// Temp workspace plus the shared collaborators a task is built from.
pub struct Fixture {
    pub dir: TempDir,
    pub store: SharedStore<MemoryCheckpointStore>,
    pub surface: RecordingSurface,
    pub generation: Generation,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            dir: tempdir().expect("temp workspace"),
            store: SharedStore::new(MemoryCheckpointStore::new()),
            surface: RecordingSurface::new(),
            generation: Generation::claim(&Arc::new(AtomicU64::new(0))),
        }
    }

    pub fn context(&self, config: AgentConfig) -> TaskContext {
        self.context_with_store(config, Box::new(self.store.clone()))
    }

    pub fn context_with_store(
        &self,
        config: AgentConfig,
        store: Box<dyn CheckpointStore>,
    ) -> TaskContext {
        TaskContext {
            task_id: TASK_ID.to_string(),
            workspace: Workspace::new(self.dir.path(), &config).expect("workspace root"),
            config,
            instructions: "test instructions".to_string(),
            surface: Box::new(self.surface.clone()),
            store,
            generation: self.generation.clone(),
        }
    }

    pub fn task(&self, config: AgentConfig) -> Task {
        Task::new(self.context(config)).expect("task should build")
    }

    pub fn write(&self, path: &str, content: &str) {
        fs::write(self.dir.path().join(path), content).expect("write fixture file");
    }

    pub fn read(&self, path: &str) -> Option<String> {
        fs::read_to_string(self.dir.path().join(path)).ok()
    }

    pub fn checkpoint_count(&self) -> usize {
        self.store.with(|store| store.history(TASK_ID).len())
    }
}

pub fn config_with(update: impl FnOnce(&mut AgentConfig)) -> AgentConfig {
    let mut config = AgentConfig::default();
    update(&mut config);
    config
}

/// One `<calls>` block with a single invocation.
pub fn call(name: &str, params: &[(&str, &str)]) -> String {
    let mut text = format!("<calls>\n<call name=\"{name}\">\n");
    for (key, value) in params {
        text.push_str(&format!("<param name=\"{key}\">{value}</param>\n"));
    }
    text.push_str("</call>\n</calls>\n");
    text
}

/// Streams `text` into the current run in word-sized chunks.
pub fn stream(task: &mut Task, host: &mut HostSpy, text: &str) {
    let run_id = host.last_run_id();
    for chunk in text.split_inclusive([' ', '\n']) {
        task.on_run_event(
            RunEvent::Chunk {
                run_id,
                text: chunk.to_string(),
            },
            host,
        );
    }
}

pub fn finish(task: &mut Task, host: &mut HostSpy, run_id: RunId) {
    task.on_run_event(RunEvent::Finished { run_id }, host);
}

/// Streams a whole reply into the current run and finishes it.
pub fn reply(task: &mut Task, host: &mut HostSpy, text: &str) {
    let run_id = host.last_run_id();
    task.on_run_event(RunEvent::Started { run_id }, host);
    stream(task, host, text);
    finish(task, host, run_id);
}
