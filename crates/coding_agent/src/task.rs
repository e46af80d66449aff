//! Task execution state machine.
//!
//! A [`Task`] owns one [`SessionState`] and advances it in response to three
//! kinds of events: model stream events ([`Task::on_run_event`]), human
//! responses ([`Task::on_approval_response`]) and cancellation
//! ([`Task::cancel`]). Everything the task needs from the outside world goes
//! through a [`TaskHost`], so every suspension point is an explicit return to
//! the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agent_provider::{RunEvent, RunFailure, RunFailureKind, RunId, RunMessage};
use checkpoint_store::CheckpointStore;

use crate::actions::{ActionInvocation, ActionName, ContentSegment};
use crate::checkpoint::Checkpointer;
use crate::config::AgentConfig;
use crate::error::{TaskErrorKind, TaskSetupError};
use crate::executor::{ActionExecutor, EditPreview, FollowUp};
use crate::parser;
use crate::state::{truncate_conversation, CheckpointPayload, Generation, SessionState};
use crate::surface::EditSurface;
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    WaitingFirstChunk,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalKind {
    /// Run the presented action?
    Action,
    /// Answer the model's question.
    Followup,
    /// Accept the completion, or give feedback.
    Completion,
    /// The model request failed; try again?
    RetryAfterFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    Idle,
    Streaming(StreamPhase),
    PresentingSegments,
    AwaitingApproval(ApprovalKind),
    Completed,
    Cancelled,
    Abandoned,
}

impl TaskPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Abandoned)
    }
}

/// Something the host should show the human.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presentation {
    /// Model narration. Partial narration is re-sent as it grows.
    Narration { text: String, partial: bool },
    /// A complete action about to run or awaiting approval.
    Action {
        invocation: ActionInvocation,
        auto_approved: bool,
        preview: Option<EditPreview>,
    },
    ActionResult {
        description: String,
        ok: bool,
        text: String,
    },
    /// A sibling action that was not executed.
    IgnoredAction { description: String },
    Notice { text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub kind: ApprovalKind,
    pub invocation: Option<ActionInvocation>,
    pub preview: Option<EditPreview>,
    pub message: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    /// Free-form reply. Treated as a rejection with feedback for actions.
    Message,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalResponse {
    pub decision: ApprovalDecision,
    pub text: Option<String>,
    pub images: Vec<String>,
    pub files: Vec<String>,
}

impl ApprovalResponse {
    #[must_use]
    pub fn approved() -> Self {
        Self::new(ApprovalDecision::Approved, None)
    }

    #[must_use]
    pub fn rejected() -> Self {
        Self::new(ApprovalDecision::Rejected, None)
    }

    #[must_use]
    pub fn message(text: impl Into<String>) -> Self {
        Self::new(ApprovalDecision::Message, Some(text.into()))
    }

    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    #[must_use]
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    #[must_use]
    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    fn new(decision: ApprovalDecision, text: Option<String>) -> Self {
        Self {
            decision,
            text,
            images: Vec::new(),
            files: Vec::new(),
        }
    }
}

/// Outside world as seen by a task.
pub trait TaskHost {
    fn start_run(
        &mut self,
        messages: Vec<RunMessage>,
        instructions: String,
    ) -> Result<RunId, String>;
    fn cancel_run(&mut self, run_id: RunId);
    fn present(&mut self, presentation: Presentation);
    /// The task stays in [`TaskPhase::AwaitingApproval`] until the host calls
    /// [`Task::on_approval_response`].
    fn request_approval(&mut self, request: ApprovalRequest);
}

/// Everything a task is built from.
pub struct TaskContext {
    pub task_id: String,
    pub config: AgentConfig,
    /// Full instructions sent with every model request.
    pub instructions: String,
    pub workspace: Workspace,
    pub surface: Box<dyn EditSurface>,
    pub store: Box<dyn CheckpointStore>,
    pub generation: Generation,
}

#[derive(Debug, Clone)]
struct Awaiting {
    kind: ApprovalKind,
    invocation: Option<ActionInvocation>,
}

const NO_ACTION_USED: &str = "[ERROR] You did not use an action in your previous response. Every response must either use exactly one action, or call attempt_completion when the task is done, or call ask_followup_question when you need more information from the user.";
const MISTAKE_GUIDANCE: &str = "You seem to be having trouble proceeding. Step back, re-read the task and the latest action results, and try a different approach. If the task is ambiguous, use ask_followup_question.";
const TASK_RESUMPTION: &str = "[TASK RESUMPTION] This task was interrupted. It may or may not be complete, so reassess the task context. Do not assume the last action succeeded unless its result is shown.";
const EMPTY_RESPONSE: &str = "[no response]";
const RESPONSE_INTERRUPTED: &str = "[Response interrupted by user]";

pub struct Task {
    config: AgentConfig,
    instructions: String,
    state: SessionState,
    phase: TaskPhase,
    executor: ActionExecutor,
    generation: Generation,
    cancel: Arc<AtomicBool>,
    active_run: Option<RunId>,
    cancelling_run: Option<RunId>,
    awaiting: Option<Awaiting>,
    turn_terminated: bool,
}

impl Task {
    pub fn new(context: TaskContext) -> Result<Self, TaskSetupError> {
        let state = SessionState::new(context.task_id.clone());
        Self::build(context, state)
    }

    /// Rebuilds a task from its latest checkpoint. Call
    /// [`Task::resume_turn`] to continue it.
    pub fn resume(context: TaskContext) -> Result<Self, TaskSetupError> {
        let checkpoint = context.store.latest(&context.task_id)?.ok_or_else(|| {
            TaskSetupError::MissingCheckpoint {
                task_id: context.task_id.clone(),
            }
        })?;
        let payload: CheckpointPayload = serde_json::from_value(checkpoint.payload)?;
        tracing::info!(
            task_id = context.task_id.as_str(),
            sequence = checkpoint.sequence,
            messages = payload.conversation.len(),
            "resuming task from checkpoint"
        );
        let state = SessionState::restore(context.task_id.clone(), payload);
        Self::build(context, state)
    }

    fn build(context: TaskContext, state: SessionState) -> Result<Self, TaskSetupError> {
        let TaskContext {
            task_id,
            config,
            instructions,
            workspace,
            surface,
            mut store,
            generation,
        } = context;

        store.claim(&task_id)?;
        let cancel = Arc::new(AtomicBool::new(false));
        let checkpointer = Checkpointer::spawn(store, task_id, generation.clone())
            .map_err(TaskSetupError::Spawn)?;
        let executor = ActionExecutor::new(
            workspace,
            surface,
            checkpointer,
            generation.clone(),
            Arc::clone(&cancel),
        );

        Ok(Self {
            config,
            instructions,
            state,
            phase: TaskPhase::Idle,
            executor,
            generation,
            cancel,
            active_run: None,
            cancelling_run: None,
            awaiting: None,
            turn_terminated: false,
        })
    }

    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.state.task_id
    }

    #[must_use]
    pub fn phase(&self) -> TaskPhase {
        self.phase
    }

    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    #[must_use]
    pub fn active_run(&self) -> Option<RunId> {
        self.active_run
    }

    /// Flag that requests cancellation when set from outside. Long-running
    /// commands poll it too.
    #[must_use]
    pub fn cancel_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    #[must_use]
    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Blocks until every checkpoint queued so far is written.
    pub fn flush_checkpoints(&self) {
        self.executor.flush_checkpoints();
    }

    pub fn start(&mut self, prompt: &str, images: Vec<String>, host: &mut dyn TaskHost) {
        if self.phase != TaskPhase::Idle {
            tracing::warn!(task_id = self.task_id(), phase = ?self.phase, "task already started");
            return;
        }
        tracing::info!(task_id = self.task_id(), "starting task");
        self.state.push_result(format!("<task>\n{}\n</task>", prompt.trim()));
        self.state.pending_images.extend(images);
        self.start_turn(host);
    }

    /// Continues a resumed task with a resumption notice ahead of any results
    /// that were pending when it stopped.
    pub fn resume_turn(&mut self, host: &mut dyn TaskHost) {
        if self.phase != TaskPhase::Idle {
            tracing::warn!(task_id = self.task_id(), phase = ?self.phase, "task already running");
            return;
        }
        self.state
            .pending_results
            .insert(0, TASK_RESUMPTION.to_string());
        self.start_turn(host);
    }

    pub fn on_run_event(&mut self, event: RunEvent, host: &mut dyn TaskHost) {
        let run_id = event.run_id();

        if self.phase.is_terminal() {
            if event.is_terminal() && self.cancelling_run == Some(run_id) {
                self.cancelling_run = None;
            }
            return;
        }
        if self.halt_if_superseded(host) {
            return;
        }

        if self.cancelling_run == Some(run_id) {
            if event.is_terminal() {
                self.cancelling_run = None;
                self.on_stream_end(host);
            }
            return;
        }

        if self.active_run != Some(run_id) {
            tracing::debug!(task_id = self.task_id(), run_id, "ignoring event from stale run");
            return;
        }

        match event {
            RunEvent::Started { .. } => {
                tracing::debug!(task_id = self.task_id(), run_id, "run started");
            }
            RunEvent::Chunk { text, .. } => self.on_chunk(&text, host),
            RunEvent::Finished { .. } | RunEvent::Cancelled { .. } => {
                self.active_run = None;
                self.on_stream_end(host);
            }
            RunEvent::Failed { failure, .. } => {
                self.active_run = None;
                self.on_run_failure(failure, host);
            }
        }
    }

    pub fn on_approval_response(&mut self, response: ApprovalResponse, host: &mut dyn TaskHost) {
        if self.phase.is_terminal() {
            return;
        }
        let Some(awaiting) = self.awaiting.take() else {
            tracing::debug!(task_id = self.task_id(), "approval response without a pending request");
            return;
        };
        if self.halt_if_superseded(host) {
            return;
        }

        let ApprovalResponse {
            decision,
            text,
            images,
            files,
        } = response;
        self.state.set_response(text, images, files);

        match (awaiting.kind, awaiting.invocation) {
            (ApprovalKind::Action, Some(invocation)) => {
                self.on_action_decision(invocation, decision, host);
            }
            (ApprovalKind::Followup, Some(invocation)) => self.on_followup_answer(&invocation),
            (ApprovalKind::Completion, _) => {
                if decision == ApprovalDecision::Approved && self.state.response_text.is_none() {
                    self.state.clear_response();
                    self.complete();
                    return;
                }
                self.on_completion_feedback();
            }
            (ApprovalKind::RetryAfterFailure, _) => {
                self.state.clear_response();
                if decision == ApprovalDecision::Rejected {
                    self.cancel(host);
                } else {
                    self.state.reset_stream();
                    self.launch_run(host);
                }
                return;
            }
            (kind, None) => {
                tracing::error!(task_id = self.task_id(), ?kind, "approval without an invocation");
            }
        }

        self.phase = TaskPhase::PresentingSegments;
        self.present_segments(host);
        self.maybe_finish_turn(host);
    }

    /// Stops the task. Reachable from every phase.
    pub fn cancel(&mut self, host: &mut dyn TaskHost) {
        if self.phase.is_terminal() {
            return;
        }
        self.cancel.store(true, Ordering::SeqCst);
        self.state.cancelled = true;
        self.awaiting = None;
        self.interrupt_stream(host);
        self.executor.discard_preview();
        self.phase = TaskPhase::Cancelled;

        self.executor.checkpoint(&self.state);
        self.executor.flush_checkpoints();
        tracing::info!(task_id = self.task_id(), "task cancelled");
    }

    /// Stops a task that a newer one replaced. Nothing persisted is touched
    /// afterwards.
    pub fn abandon(&mut self, host: &mut dyn TaskHost) {
        if self.phase.is_terminal() {
            return;
        }
        self.cancel.store(true, Ordering::SeqCst);
        self.state.abandoned = true;
        self.awaiting = None;
        self.interrupt_stream(host);
        self.executor.discard_preview();
        self.phase = TaskPhase::Abandoned;
        tracing::info!(task_id = self.task_id(), "task abandoned");
    }

    fn halt_if_superseded(&mut self, host: &mut dyn TaskHost) -> bool {
        if self.generation.is_current() {
            return false;
        }
        self.abandon(host);
        true
    }

    fn start_turn(&mut self, host: &mut dyn TaskHost) {
        if self.halt_if_superseded(host) {
            return;
        }
        if self.cancel_requested() {
            self.cancel(host);
            return;
        }

        if self.state.consecutive_mistakes >= self.config.max_consecutive_mistakes {
            tracing::warn!(
                task_id = self.task_id(),
                kind = %TaskErrorKind::ConsecutiveMistakeThresholdExceeded,
                mistakes = self.state.consecutive_mistakes,
                "injecting corrective guidance"
            );
            self.state.push_result(MISTAKE_GUIDANCE);
            self.state.consecutive_mistakes = 0;
            host.present(Presentation::Notice {
                text: "The model made several consecutive mistakes; guidance was added to its next request.".to_string(),
            });
        }

        let input = self.state.take_turn_input();
        self.state.conversation.push(input);
        self.state.begin_turn();
        self.turn_terminated = false;
        self.executor.checkpoint(&self.state);
        self.launch_run(host);
    }

    fn launch_run(&mut self, host: &mut dyn TaskHost) {
        self.state.request_count += 1;
        self.state.stream_in_flight = true;
        self.phase = TaskPhase::Streaming(StreamPhase::WaitingFirstChunk);

        match host.start_run(self.state.conversation.clone(), self.instructions.clone()) {
            Ok(run_id) => {
                tracing::debug!(
                    task_id = self.task_id(),
                    run_id,
                    request = self.state.request_count,
                    "model request started"
                );
                self.active_run = Some(run_id);
            }
            Err(error) => {
                self.state.stream_in_flight = false;
                self.on_run_failure(RunFailure::transport(error), host);
            }
        }
    }

    fn on_chunk(&mut self, text: &str, host: &mut dyn TaskHost) {
        if !self.state.first_chunk_seen {
            self.state.first_chunk_seen = true;
            self.phase = TaskPhase::Streaming(StreamPhase::Active);
        }
        self.state.buffer.push_str(text);
        if self.state.did_reject || self.turn_terminated {
            return;
        }
        self.state.segments = parser::parse(&self.state.buffer);
        self.present_segments(host);
    }

    fn on_stream_end(&mut self, host: &mut dyn TaskHost) {
        self.state.stream_in_flight = false;
        self.state.stream_drained = true;

        let mut response = if self.state.buffer.trim().is_empty() {
            EMPTY_RESPONSE.to_string()
        } else {
            self.state.buffer.clone()
        };
        if self.state.did_reject {
            response.push_str("\n\n");
            response.push_str(RESPONSE_INTERRUPTED);
        }
        self.state.conversation.push(RunMessage::assistant(response));

        if !self.state.did_reject && !self.turn_terminated {
            self.state.segments = parser::parse(&self.state.buffer);
            parser::finalize(&mut self.state.segments);
            self.present_segments(host);
        }
        self.maybe_finish_turn(host);
    }

    fn on_run_failure(&mut self, failure: RunFailure, host: &mut dyn TaskHost) {
        self.state.stream_in_flight = false;

        if self.state.action_used || self.state.did_reject || self.turn_terminated {
            tracing::warn!(task_id = self.task_id(), %failure, "stream failed after an action; ending the turn");
            self.on_stream_end(host);
            return;
        }

        self.executor.discard_preview();
        if failure.kind == RunFailureKind::ContextWindowExceeded {
            if !self.state.context_retry_used {
                self.state.context_retry_used = true;
                let removed = truncate_conversation(&mut self.state.conversation);
                tracing::warn!(
                    task_id = self.task_id(),
                    kind = %TaskErrorKind::ContextBudgetExceeded,
                    removed,
                    "context window exceeded; retrying with truncated history"
                );
                host.present(Presentation::Notice {
                    text: format!(
                        "Context window exceeded. Dropped {removed} older messages and retried."
                    ),
                });
                self.state.reset_stream();
                self.launch_run(host);
                return;
            }
            tracing::warn!(
                task_id = self.task_id(),
                kind = %TaskErrorKind::ContextBudgetExceeded,
                "context window exceeded again after truncation"
            );
        } else {
            tracing::warn!(task_id = self.task_id(), kind = ?failure.kind, %failure, "model request failed");
        }

        self.state.reset_stream();
        self.await_approval(
            ApprovalKind::RetryAfterFailure,
            None,
            None,
            format!("The model request failed: {failure}. Retry?"),
            Vec::new(),
            host,
        );
    }

    /// Presents parsed segments in order, starting at the first one not yet
    /// presented. Returns without doing anything while a human decision is
    /// pending.
    fn present_segments(&mut self, host: &mut dyn TaskHost) {
        if self.awaiting.is_some() || self.phase.is_terminal() {
            return;
        }
        self.phase = TaskPhase::PresentingSegments;

        while self.state.presented < self.state.segments.len() {
            if self.awaiting.is_some()
                || self.phase.is_terminal()
                || self.state.did_reject
                || self.turn_terminated
            {
                break;
            }

            match self.state.segments[self.state.presented].clone() {
                ContentSegment::Text {
                    value,
                    partial: true,
                } => {
                    if self.state.last_partial_text.as_deref() != Some(value.as_str()) {
                        host.present(Presentation::Narration {
                            text: value.clone(),
                            partial: true,
                        });
                        self.state.last_partial_text = Some(value);
                    }
                    break;
                }
                ContentSegment::Text { value, .. } => {
                    self.state.presented += 1;
                    self.state.last_partial_text = None;
                    host.present(Presentation::Narration {
                        text: value,
                        partial: false,
                    });
                }
                ContentSegment::Action(invocation) if invocation.partial => {
                    tracing::trace!(
                        kind = %TaskErrorKind::PartialSegmentIncomplete,
                        action = %invocation.name,
                        "waiting for the rest of the action"
                    );
                    if !self.state.action_used && invocation.name.is_edit() {
                        self.executor.stream_preview(&invocation);
                    }
                    break;
                }
                ContentSegment::Action(invocation) => {
                    self.state.presented += 1;
                    self.state.last_partial_text = None;
                    if self.state.action_used {
                        self.ignore_sibling(&invocation, host);
                    } else {
                        self.handle_action(invocation, host);
                    }
                }
            }
        }

        if self.awaiting.is_none() && !self.phase.is_terminal() && self.state.stream_in_flight {
            self.phase = TaskPhase::Streaming(StreamPhase::Active);
        }
    }

    fn ignore_sibling(&mut self, invocation: &ActionInvocation, host: &mut dyn TaskHost) {
        let description = invocation.describe();
        tracing::debug!(task_id = self.task_id(), action = %invocation.name, "ignoring additional action");
        self.state.push_result(format!(
            "Action {description} was not executed because an action has already been used in this message. Only one action may be used per message. You must assess the first action's result before using the next one."
        ));
        host.present(Presentation::IgnoredAction { description });
    }

    fn handle_action(&mut self, invocation: ActionInvocation, host: &mut dyn TaskHost) {
        let gated = invocation.missing_parameter().is_none()
            && !matches!(
                invocation.name,
                ActionName::AskFollowupQuestion | ActionName::AttemptCompletion
            );
        if !gated {
            self.run_action(invocation, host);
            return;
        }

        let preview = if invocation.name.is_edit() {
            self.executor.preview_edit(&invocation)
        } else {
            None
        };
        // A diff that cannot be applied fails without touching the file.
        if invocation.name == ActionName::ReplaceInFile && preview.is_none() {
            self.run_action(invocation, host);
            return;
        }

        let auto_approved = self.auto_approves(&invocation);
        host.present(Presentation::Action {
            invocation: invocation.clone(),
            auto_approved,
            preview: preview.clone(),
        });

        if auto_approved {
            self.state.consecutive_auto_approvals += 1;
            self.run_action(invocation, host);
        } else {
            let message = invocation.describe();
            self.await_approval(
                ApprovalKind::Action,
                Some(invocation),
                preview,
                message,
                Vec::new(),
                host,
            );
        }
    }

    fn auto_approves(&self, invocation: &ActionInvocation) -> bool {
        let settings = &self.config.auto_approval;
        if self.state.consecutive_auto_approvals >= settings.max_consecutive_auto_approvals {
            return false;
        }
        match invocation.name {
            ActionName::ListFiles | ActionName::SearchFiles | ActionName::ReadFile => {
                settings.read_files
            }
            ActionName::WriteToFile | ActionName::ReplaceInFile => settings.edit_files,
            ActionName::ExecuteCommand if invocation.flag("requires_approval") => {
                settings.execute_all_commands
            }
            ActionName::ExecuteCommand => {
                settings.execute_safe_commands || settings.execute_all_commands
            }
            ActionName::AskFollowupQuestion | ActionName::AttemptCompletion => false,
        }
    }

    fn run_action(&mut self, invocation: ActionInvocation, host: &mut dyn TaskHost) {
        let outcome = self.executor.execute(&invocation, &mut self.state);

        match outcome.follow_up {
            Some(FollowUp::Question { question, options }) => {
                self.await_approval(
                    ApprovalKind::Followup,
                    Some(invocation),
                    None,
                    question,
                    options,
                    host,
                );
            }
            Some(FollowUp::Completion { result, command }) => {
                self.terminate_turn(host);
                let message = match command {
                    Some(command) => format!("{result}\n\nSuggested command: {command}"),
                    None => result,
                };
                self.await_approval(
                    ApprovalKind::Completion,
                    Some(invocation),
                    None,
                    message,
                    Vec::new(),
                    host,
                );
            }
            None => {
                host.present(Presentation::ActionResult {
                    description: invocation.describe(),
                    ok: outcome.ok,
                    text: outcome.result_text,
                });
                if outcome.terminates_turn {
                    self.terminate_turn(host);
                }
            }
        }
    }

    fn on_action_decision(
        &mut self,
        invocation: ActionInvocation,
        decision: ApprovalDecision,
        host: &mut dyn TaskHost,
    ) {
        self.state.consecutive_auto_approvals = 0;

        if decision == ApprovalDecision::Approved {
            let feedback = self.state.take_feedback();
            self.run_action(invocation, host);
            if let Some(feedback) = feedback {
                self.state.push_result(format!(
                    "The user approved this operation and provided the following feedback:\n{feedback}"
                ));
            }
            return;
        }

        self.executor.discard_preview();
        self.state.did_reject = true;
        self.state.action_used = true;

        let description = invocation.describe();
        let mut result = format!("{description} The user denied this operation.");
        if let Some(feedback) = self.state.take_feedback() {
            result.push_str("\nThe user provided the following feedback:\n");
            result.push_str(&feedback);
        }
        self.state.push_result(result);
        tracing::info!(
            task_id = self.task_id(),
            kind = %TaskErrorKind::ApprovalRejected,
            action = %invocation.name,
            "action rejected"
        );
        host.present(Presentation::ActionResult {
            description,
            ok: false,
            text: "Denied.".to_string(),
        });

        self.executor.checkpoint(&self.state);
        self.interrupt_stream(host);
    }

    fn on_followup_answer(&mut self, invocation: &ActionInvocation) {
        let answer = self
            .state
            .take_tagged("answer")
            .unwrap_or_else(|| "The user declined to answer.".to_string());
        self.state
            .push_result(format!("{} Result:\n{answer}", invocation.describe()));
        self.executor.checkpoint(&self.state);
    }

    fn on_completion_feedback(&mut self) {
        let feedback = self
            .state
            .take_feedback()
            .unwrap_or_else(|| "<feedback>\nThe result was not accepted.\n</feedback>".to_string());
        self.state.push_result(format!(
            "The user has provided feedback on the results. Consider their input to continue the task, and then attempt completion again.\n{feedback}"
        ));
        self.executor.checkpoint(&self.state);
    }

    fn await_approval(
        &mut self,
        kind: ApprovalKind,
        invocation: Option<ActionInvocation>,
        preview: Option<EditPreview>,
        message: String,
        options: Vec<String>,
        host: &mut dyn TaskHost,
    ) {
        self.awaiting = Some(Awaiting {
            kind,
            invocation: invocation.clone(),
        });
        self.phase = TaskPhase::AwaitingApproval(kind);
        host.request_approval(ApprovalRequest {
            kind,
            invocation,
            preview,
            message,
            options,
        });
    }

    /// Stops presenting the rest of this turn and cancels its stream.
    fn terminate_turn(&mut self, host: &mut dyn TaskHost) {
        self.turn_terminated = true;
        self.interrupt_stream(host);
    }

    fn interrupt_stream(&mut self, host: &mut dyn TaskHost) {
        if let Some(run_id) = self.active_run.take() {
            tracing::debug!(task_id = self.task_id(), run_id, "cancelling model stream");
            self.cancelling_run = Some(run_id);
            host.cancel_run(run_id);
        }
    }

    fn maybe_finish_turn(&mut self, host: &mut dyn TaskHost) {
        let settled = self.awaiting.is_none()
            && !self.phase.is_terminal()
            && self.state.stream_drained
            && self.active_run.is_none()
            && self.cancelling_run.is_none();
        if settled {
            self.finish_turn(host);
        }
    }

    fn finish_turn(&mut self, host: &mut dyn TaskHost) {
        if !self.state.action_used {
            self.state.consecutive_mistakes += 1;
            self.state.push_result(NO_ACTION_USED);
            tracing::info!(
                task_id = self.task_id(),
                mistakes = self.state.consecutive_mistakes,
                "turn ended without an action"
            );
        }
        self.executor.checkpoint(&self.state);
        self.start_turn(host);
    }

    fn complete(&mut self) {
        self.phase = TaskPhase::Completed;
        self.executor.checkpoint(&self.state);
        self.executor.flush_checkpoints();
        tracing::info!(
            task_id = self.task_id(),
            requests = self.state.request_count,
            "task completed"
        );
    }
}
