use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use agent_provider::{RunEvent, RunFailure, RunId, RunMessage, RunProvider, RunRequest};

use crate::task::{ApprovalRequest, ApprovalResponse, Presentation, Task, TaskHost, TaskPhase};

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Human side of a running task.
pub trait ApprovalSource {
    fn present(&mut self, _presentation: &Presentation) {}

    /// Blocks until the human decides.
    fn decide(&mut self, request: &ApprovalRequest) -> ApprovalResponse;
}

#[derive(Default)]
struct EventQueue {
    events: Mutex<VecDeque<RunEvent>>,
    ready: Condvar,
}

impl EventQueue {
    fn push(&self, event: RunEvent) {
        lock_unpoisoned(&self.events).push_back(event);
        self.ready.notify_one();
    }

    fn pop_timeout(&self, timeout: Duration) -> Option<RunEvent> {
        let mut events = lock_unpoisoned(&self.events);
        if events.is_empty() {
            events = match self.ready.wait_timeout(events, timeout) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        events.pop_front()
    }

    fn is_empty(&self) -> bool {
        lock_unpoisoned(&self.events).is_empty()
    }
}

struct ActiveRun {
    run_id: RunId,
    cancel: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

/// Drives one task at a time against a provider.
///
/// Provider runs execute on worker threads and push their events into a
/// queue; the calling thread applies them to the task in order and asks the
/// [`ApprovalSource`] whenever the task waits for a human.
pub struct TaskRunner {
    provider: Arc<dyn RunProvider>,
    events: EventQueue,
    next_run_id: AtomicU64,
    active_run: Mutex<Option<ActiveRun>>,
}

impl TaskRunner {
    pub fn new(provider: Arc<dyn RunProvider>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            events: EventQueue::default(),
            next_run_id: AtomicU64::new(1),
            active_run: Mutex::new(None),
        })
    }

    /// Starts `task` with `prompt` and drives it to a terminal phase.
    pub fn run(
        self: &Arc<Self>,
        task: &mut Task,
        prompt: &str,
        images: Vec<String>,
        approvals: &mut dyn ApprovalSource,
    ) -> TaskPhase {
        let mut host = RunnerHost::new(Arc::clone(self), approvals);
        task.start(prompt, images, &mut host);
        self.drive(task, &mut host)
    }

    /// Continues a task rebuilt with [`Task::resume`].
    pub fn resume(self: &Arc<Self>, task: &mut Task, approvals: &mut dyn ApprovalSource) -> TaskPhase {
        let mut host = RunnerHost::new(Arc::clone(self), approvals);
        task.resume_turn(&mut host);
        self.drive(task, &mut host)
    }

    fn drive(&self, task: &mut Task, host: &mut RunnerHost<'_>) -> TaskPhase {
        loop {
            if let Some(request) = host.pending_approval.take() {
                let response = host.approvals.decide(&request);
                task.on_approval_response(response, host);
                continue;
            }
            if task.phase().is_terminal() {
                break;
            }
            if task.cancel_requested() {
                task.cancel(host);
                continue;
            }

            match self.events.pop_timeout(EVENT_POLL_INTERVAL) {
                Some(event) => {
                    // The task may start the next run while handling this one.
                    if event.is_terminal() {
                        self.clear_active_run_if_matching(event.run_id());
                    }
                    task.on_run_event(event, host);
                }
                None if !self.has_active_run() && self.events.is_empty() => {
                    tracing::error!(task_id = task.task_id(), phase = ?task.phase(), "task stalled without a run");
                    task.cancel(host);
                }
                None => {}
            }
        }

        self.shutdown();
        task.phase()
    }

    fn start_run_internal(
        self: &Arc<Self>,
        messages: Vec<RunMessage>,
        instructions: String,
    ) -> Result<RunId, String> {
        let mut active_run = self.lock_active_run();
        if active_run.is_some() {
            return Err("Run already active".to_string());
        }

        let run_id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        let cancel = Arc::new(AtomicBool::new(false));
        let request = RunRequest {
            run_id,
            messages,
            instructions,
        };
        let join_handle = self.spawn_worker(request, Arc::clone(&cancel))?;

        *active_run = Some(ActiveRun {
            run_id,
            cancel,
            join_handle: Some(join_handle),
        });

        Ok(run_id)
    }

    fn spawn_worker(
        self: &Arc<Self>,
        request: RunRequest,
        cancel: Arc<AtomicBool>,
    ) -> Result<JoinHandle<()>, String> {
        let run_id = request.run_id;
        let runner = Arc::clone(self);
        thread::Builder::new()
            .name(format!("coding-agent-run-{run_id}"))
            .spawn(move || runner.run_worker(request, cancel))
            .map_err(|error| format!("Failed to spawn run worker: {error}"))
    }

    fn run_worker(self: Arc<Self>, request: RunRequest, cancel: Arc<AtomicBool>) {
        let run_id = request.run_id;
        let terminal_emitted = AtomicBool::new(false);
        let provider = Arc::clone(&self.provider);

        let mut emit = |event: RunEvent| {
            if event.is_terminal() {
                terminal_emitted.store(true, Ordering::SeqCst);
            }
            self.events.push(event);
        };
        let run_outcome = catch_unwind(AssertUnwindSafe(|| {
            provider.run(request, Arc::clone(&cancel), &mut emit)
        }));

        if terminal_emitted.load(Ordering::SeqCst) {
            return;
        }
        let failure = match run_outcome {
            Ok(Ok(())) => RunFailure::provider("Model backend exited without terminal event"),
            Ok(Err(error)) => RunFailure::provider(error),
            Err(_) => RunFailure::provider("Model backend panicked"),
        };
        emit(RunEvent::Failed { run_id, failure });
    }

    fn clear_active_run_if_matching(&self, run_id: RunId) {
        let mut active_run = self.lock_active_run();
        let matches = active_run.as_ref().map(|active| active.run_id) == Some(run_id);
        if !matches {
            return;
        }

        let Some(mut completed) = active_run.take() else {
            return;
        };
        if let Some(join_handle) = completed.join_handle.take() {
            if join_handle.is_finished() {
                let _ = join_handle.join();
            }
        }
    }

    fn has_active_run(&self) -> bool {
        self.lock_active_run().is_some()
    }

    fn cancel_run_internal(&self, run_id: RunId) {
        let active_run = self.lock_active_run();
        if let Some(active_run) = active_run.as_ref() {
            if active_run.run_id == run_id {
                active_run.cancel.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Cancels and joins whatever run is still active, dropping its events.
    fn shutdown(&self) {
        let active = self.lock_active_run().take();
        if let Some(mut active) = active {
            active.cancel.store(true, Ordering::SeqCst);
            if let Some(join_handle) = active.join_handle.take() {
                let _ = join_handle.join();
            }
        }
        while self.events.pop_timeout(Duration::ZERO).is_some() {}
    }

    fn lock_active_run(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        lock_unpoisoned(&self.active_run)
    }
}

struct RunnerHost<'a> {
    runner: Arc<TaskRunner>,
    approvals: &'a mut dyn ApprovalSource,
    pending_approval: Option<ApprovalRequest>,
}

impl<'a> RunnerHost<'a> {
    fn new(runner: Arc<TaskRunner>, approvals: &'a mut dyn ApprovalSource) -> Self {
        Self {
            runner,
            approvals,
            pending_approval: None,
        }
    }
}

impl TaskHost for RunnerHost<'_> {
    fn start_run(
        &mut self,
        messages: Vec<RunMessage>,
        instructions: String,
    ) -> Result<RunId, String> {
        self.runner.start_run_internal(messages, instructions)
    }

    fn cancel_run(&mut self, run_id: RunId) {
        self.runner.cancel_run_internal(run_id);
    }

    fn present(&mut self, presentation: Presentation) {
        self.approvals.present(&presentation);
    }

    fn request_approval(&mut self, request: ApprovalRequest) {
        self.pending_approval = Some(request);
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
