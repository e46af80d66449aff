//! Runs one confirmed action against the workspace.
//!
//! Dispatch goes through [`handler`], an exhaustive table from
//! [`ActionName`] to a handler function. Every execution, successful or not,
//! is recorded into the session state and followed by a checkpoint.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use reconcile_engine::{describe_mismatch, parse_fragments, reconcile, ReconcileError};

use crate::actions::{ActionInvocation, ActionName};
use crate::checkpoint::Checkpointer;
use crate::error::TaskErrorKind;
use crate::state::{Generation, SessionState};
use crate::surface::{EditSurface, StreamingEdit};
use crate::workspace::{ToolOutput, Workspace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    /// The model asked the human something; the answer becomes the result.
    Question { question: String, options: Vec<String> },
    /// The model believes the task is done.
    Completion {
        result: String,
        command: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub ok: bool,
    pub result_text: String,
    /// Workspace paths the action wrote.
    pub attachments: Vec<String>,
    /// Stop presenting the rest of the turn and cancel its stream.
    pub terminates_turn: bool,
    pub follow_up: Option<FollowUp>,
    pub error_kind: Option<TaskErrorKind>,
}

impl ExecutionOutcome {
    fn from_output(output: ToolOutput) -> Self {
        let error_kind = (!output.ok).then_some(TaskErrorKind::ActionFailed);
        Self {
            ok: output.ok,
            result_text: output.content,
            attachments: Vec::new(),
            terminates_turn: false,
            follow_up: None,
            error_kind,
        }
    }

    fn success(result_text: impl Into<String>) -> Self {
        Self::from_output(ToolOutput::ok(result_text))
    }

    fn failure(result_text: impl Into<String>, kind: TaskErrorKind) -> Self {
        Self {
            error_kind: Some(kind),
            ..Self::from_output(ToolOutput::fail(result_text))
        }
    }
}

/// Original and proposed body of a file edit, shown before approval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditPreview {
    pub path: String,
    pub original: String,
    pub proposed: String,
}

type Handler = fn(&mut ActionExecutor, &ActionInvocation) -> ExecutionOutcome;

fn handler(name: ActionName) -> Handler {
    match name {
        ActionName::ListFiles => ActionExecutor::list_files,
        ActionName::SearchFiles => ActionExecutor::search_files,
        ActionName::ReadFile => ActionExecutor::read_file,
        ActionName::WriteToFile => ActionExecutor::write_to_file,
        ActionName::ReplaceInFile => ActionExecutor::replace_in_file,
        ActionName::ExecuteCommand => ActionExecutor::execute_command,
        ActionName::AskFollowupQuestion => ActionExecutor::ask_followup_question,
        ActionName::AttemptCompletion => ActionExecutor::attempt_completion,
    }
}

pub struct ActionExecutor {
    workspace: Workspace,
    surface: Box<dyn EditSurface>,
    checkpointer: Checkpointer,
    generation: Generation,
    cancel: Arc<AtomicBool>,
    streaming_edit: Option<StreamingEdit>,
}

impl ActionExecutor {
    pub fn new(
        workspace: Workspace,
        surface: Box<dyn EditSurface>,
        checkpointer: Checkpointer,
        generation: Generation,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            workspace,
            surface,
            checkpointer,
            generation,
            cancel,
            streaming_edit: None,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Runs `invocation` and records its result into `state`.
    pub fn execute(
        &mut self,
        invocation: &ActionInvocation,
        state: &mut SessionState,
    ) -> ExecutionOutcome {
        if !self.generation.is_current() {
            tracing::warn!(action = %invocation.name, "superseded task tried to execute an action");
            return ExecutionOutcome::failure(
                "The task was superseded; the action was not executed.",
                TaskErrorKind::ActionFailed,
            );
        }

        let outcome = match invocation.missing_parameter() {
            Some(parameter) => ExecutionOutcome::failure(
                format!(
                    "Missing value for required parameter '{parameter}'. Retry with a complete {} invocation.",
                    invocation.name
                ),
                TaskErrorKind::MissingParameter,
            ),
            None => handler(invocation.name)(self, invocation),
        };

        state.action_used = true;
        if outcome.ok {
            state.consecutive_mistakes = 0;
        } else if outcome.error_kind.is_some_and(TaskErrorKind::is_mistake) {
            state.consecutive_mistakes += 1;
        }
        if outcome.follow_up.is_none() {
            state.push_result(format!(
                "{} Result:\n{}",
                invocation.describe(),
                outcome.result_text
            ));
        }

        if outcome.ok {
            tracing::info!(task_id = state.task_id.as_str(), action = %invocation.name, "action executed");
        } else {
            tracing::warn!(
                task_id = state.task_id.as_str(),
                action = %invocation.name,
                kind = ?outcome.error_kind,
                mistakes = state.consecutive_mistakes,
                "action failed"
            );
        }

        self.checkpoint(state);
        outcome
    }

    /// Computes the proposed body of a complete edit and shows it on the
    /// surface. `None` when the edit cannot be computed; executing it will
    /// report why.
    pub fn preview_edit(&mut self, invocation: &ActionInvocation) -> Option<EditPreview> {
        let path = invocation.param("path")?;
        let original = self.workspace.read_for_edit(path).ok()?;
        let proposed = match invocation.name {
            ActionName::WriteToFile => invocation.param("content")?.to_string(),
            ActionName::ReplaceInFile => {
                let fragments = parse_fragments(invocation.param("diff")?).ok()?;
                reconcile(&original, &fragments, true).ok()?.content
            }
            _ => return None,
        };

        if self.ensure_streaming_edit(path, &original) {
            if let Some(edit) = self.streaming_edit.as_mut() {
                edit.finish(self.surface.as_mut(), &proposed);
            }
        }

        Some(EditPreview {
            path: path.to_string(),
            original,
            proposed,
        })
    }

    /// Updates the live preview of an edit whose segment is still streaming.
    pub fn stream_preview(&mut self, invocation: &ActionInvocation) {
        let body_key = match invocation.name {
            ActionName::WriteToFile => "content",
            ActionName::ReplaceInFile => "diff",
            _ => return,
        };
        // The path is complete once the body parameter has started.
        let (Some(path), Some(body)) = (invocation.param("path"), invocation.param(body_key))
        else {
            return;
        };

        let reuse = self
            .streaming_edit
            .as_ref()
            .is_some_and(|edit| edit.path() == path);
        if !reuse {
            let original = match self.workspace.read_for_edit(path) {
                Ok(original) => original,
                Err(error) => {
                    tracing::debug!(path, %error, "cannot preview edit");
                    return;
                }
            };
            if !self.ensure_streaming_edit(path, &original) {
                return;
            }
        }

        let Some(edit) = self.streaming_edit.as_mut() else {
            return;
        };
        let surface = self.surface.as_mut();
        match invocation.name {
            ActionName::WriteToFile => edit.show_content(surface, body),
            _ => edit.show_diff(surface, body),
        }
    }

    /// Closes the live preview, if any.
    pub fn discard_preview(&mut self) {
        if let Some(edit) = self.streaming_edit.take() {
            edit.close(self.surface.as_mut());
        }
    }

    pub fn has_preview(&self) -> bool {
        self.streaming_edit.is_some()
    }

    pub fn checkpoint(&self, state: &SessionState) {
        self.checkpointer.save(&state.snapshot());
    }

    pub fn flush_checkpoints(&self) {
        self.checkpointer.flush();
    }

    /// Makes sure a preview for `path` is open. Returns `false` when the
    /// surface refused to open one.
    fn ensure_streaming_edit(&mut self, path: &str, original: &str) -> bool {
        if self
            .streaming_edit
            .as_ref()
            .is_some_and(|edit| edit.path() == path)
        {
            return true;
        }
        self.discard_preview();
        match StreamingEdit::open(self.surface.as_mut(), path, original) {
            Ok(edit) => {
                self.streaming_edit = Some(edit);
                true
            }
            Err(error) => {
                tracing::debug!(path, %error, "edit surface refused preview");
                false
            }
        }
    }

    fn list_files(&mut self, invocation: &ActionInvocation) -> ExecutionOutcome {
        ExecutionOutcome::from_output(
            self.workspace
                .list_files(param(invocation, "path"), invocation.flag("recursive")),
        )
    }

    fn search_files(&mut self, invocation: &ActionInvocation) -> ExecutionOutcome {
        ExecutionOutcome::from_output(self.workspace.search_files(
            param(invocation, "path"),
            param(invocation, "expression"),
            invocation.param("file_pattern"),
        ))
    }

    fn read_file(&mut self, invocation: &ActionInvocation) -> ExecutionOutcome {
        ExecutionOutcome::from_output(self.workspace.read_file(param(invocation, "path")))
    }

    fn write_to_file(&mut self, invocation: &ActionInvocation) -> ExecutionOutcome {
        let path = param(invocation, "path");
        self.commit_edit(path, param(invocation, "content"), String::new())
    }

    fn replace_in_file(&mut self, invocation: &ActionInvocation) -> ExecutionOutcome {
        let path = param(invocation, "path");
        let original = match self.workspace.read_for_edit(path) {
            Ok(original) => original,
            Err(error) => return ExecutionOutcome::failure(error, TaskErrorKind::ActionFailed),
        };
        let fragments = match parse_fragments(param(invocation, "diff")) {
            Ok(fragments) => fragments,
            Err(error) => {
                return ExecutionOutcome::failure(
                    format!(
                        "The diff for {path} could not be parsed: {error}. Use ------- SEARCH / ======= / +++++++ REPLACE blocks. The file was not changed."
                    ),
                    TaskErrorKind::ReconciliationMatchFailure,
                );
            }
        };

        match reconcile(&original, &fragments, true) {
            Ok(reconciliation) => {
                let summary = reconciliation
                    .matches
                    .iter()
                    .map(|applied| {
                        format!(
                            "- block {}: lines {}-{} ({})",
                            applied.index + 1,
                            applied.original_lines.start + 1,
                            applied.original_lines.end,
                            applied.strategy
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                self.commit_edit(path, &reconciliation.content, summary)
            }
            Err(error) => {
                self.discard_preview();
                reconcile_failure(path, &original, error)
            }
        }
    }

    fn execute_command(&mut self, invocation: &ActionInvocation) -> ExecutionOutcome {
        let command = param(invocation, "command");
        tracing::info!(command, "running command");
        ExecutionOutcome::from_output(self.workspace.run_command(command, &self.cancel))
    }

    fn ask_followup_question(&mut self, invocation: &ActionInvocation) -> ExecutionOutcome {
        let question = param(invocation, "question").to_string();
        let options = invocation
            .param("options")
            .map(parse_options)
            .unwrap_or_default();
        ExecutionOutcome {
            follow_up: Some(FollowUp::Question {
                question: question.clone(),
                options,
            }),
            ..ExecutionOutcome::success(question)
        }
    }

    fn attempt_completion(&mut self, invocation: &ActionInvocation) -> ExecutionOutcome {
        let result = param(invocation, "result").to_string();
        let command = invocation
            .param("command")
            .map(str::to_string)
            .filter(|command| !command.is_empty());
        ExecutionOutcome {
            terminates_turn: true,
            follow_up: Some(FollowUp::Completion {
                result: result.clone(),
                command,
            }),
            ..ExecutionOutcome::success(result)
        }
    }

    fn commit_edit(&mut self, path: &str, content: &str, summary: String) -> ExecutionOutcome {
        if !self.generation.is_current() {
            return ExecutionOutcome::failure(
                "The task was superseded; the file was not written.",
                TaskErrorKind::ActionFailed,
            );
        }

        let output = self.workspace.write_file(path, content);
        self.discard_preview();
        if !output.ok {
            return ExecutionOutcome::from_output(output);
        }

        let mut result_text = format!("The content was successfully saved to {path}.");
        if !summary.is_empty() {
            result_text.push_str("\n\nApplied edits:\n");
            result_text.push_str(&summary);
        }
        ExecutionOutcome {
            attachments: vec![path.to_string()],
            ..ExecutionOutcome::success(result_text)
        }
    }
}

fn param<'a>(invocation: &'a ActionInvocation, key: &str) -> &'a str {
    invocation.param(key).unwrap_or_default()
}

fn parse_options(raw: &str) -> Vec<String> {
    if let Ok(options) = serde_json::from_str::<Vec<String>>(raw) {
        return options;
    }
    raw.lines()
        .map(|line| line.trim().trim_start_matches("- ").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn reconcile_failure(path: &str, original: &str, error: ReconcileError) -> ExecutionOutcome {
    match error {
        ReconcileError::NoMatch { index, search, .. } => ExecutionOutcome::failure(
            format!(
                "SEARCH block {} does not match anything in {path}. The file was not changed.\n\nExpected search text:\n{search}\n\n{}\n\nRead the file again and retry with SEARCH blocks copied exactly, in file order.",
                index + 1,
                describe_mismatch(original, &search)
            ),
            TaskErrorKind::ReconciliationMatchFailure,
        ),
        error @ ReconcileError::OrderViolation { .. } => ExecutionOutcome {
            terminates_turn: true,
            ..ExecutionOutcome::failure(
                format!(
                    "{error}. SEARCH blocks must follow the order of {path}. The file was not changed."
                ),
                TaskErrorKind::ReconciliationOrderViolation,
            )
        },
        error => ExecutionOutcome::failure(
            format!("{error}. The file {path} was not changed."),
            TaskErrorKind::ReconciliationMatchFailure,
        ),
    }
}
