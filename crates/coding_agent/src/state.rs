//! Mutable context owned by one task.
//!
//! Only the task state machine and the action executor touch a
//! [`SessionState`]. It is created when a task starts and dropped when the
//! task ends or is superseded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use agent_provider::RunMessage;
use serde::{Deserialize, Serialize};

use crate::actions::ContentSegment;

/// Monotonic counter shared by every task started in one slot.
///
/// Starting a newer task bumps the counter; older tasks notice they no longer
/// hold the current generation and stop writing shared state.
#[derive(Debug, Clone)]
pub struct Generation {
    counter: Arc<AtomicU64>,
    claimed: u64,
}

impl Generation {
    /// Claims a fresh generation, superseding every earlier claim on `counter`.
    #[must_use]
    pub fn claim(counter: &Arc<AtomicU64>) -> Self {
        let claimed = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Self {
            counter: Arc::clone(counter),
            claimed,
        }
    }

    /// A generation nobody else shares.
    #[must_use]
    pub fn standalone() -> Self {
        Self::claim(&Arc::new(AtomicU64::new(0)))
    }

    #[must_use]
    pub fn is_current(&self) -> bool {
        self.counter.load(Ordering::SeqCst) == self.claimed
    }

    /// Claims the next generation on the same counter.
    #[must_use]
    pub fn supersede(&self) -> Self {
        Self::claim(&self.counter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionState {
    pub task_id: String,
    /// Model-facing history replayed on every turn.
    pub conversation: Vec<RunMessage>,

    pub stream_in_flight: bool,
    pub first_chunk_seen: bool,
    pub stream_drained: bool,
    pub buffer: String,
    pub segments: Vec<ContentSegment>,
    /// Index of the next segment to present.
    pub presented: usize,
    pub last_partial_text: Option<String>,

    /// Result lines that become the next turn's user message.
    pub pending_results: Vec<String>,
    pub pending_images: Vec<String>,
    pub action_used: bool,
    pub did_reject: bool,

    pub response_text: Option<String>,
    pub response_images: Vec<String>,
    pub response_files: Vec<String>,

    pub consecutive_mistakes: u32,
    pub consecutive_auto_approvals: u32,
    pub request_count: u32,

    pub cancelled: bool,
    pub abandoned: bool,
    pub context_retry_used: bool,
}

impl SessionState {
    #[must_use]
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Self::default()
        }
    }

    /// Clears everything scoped to a single model turn.
    pub fn begin_turn(&mut self) {
        self.reset_stream();
        self.action_used = false;
        self.did_reject = false;
        self.context_retry_used = false;
        self.clear_response();
    }

    /// Clears stream bookkeeping, keeping turn-level flags.
    pub fn reset_stream(&mut self) {
        self.stream_in_flight = false;
        self.first_chunk_seen = false;
        self.stream_drained = false;
        self.buffer.clear();
        self.segments.clear();
        self.presented = 0;
        self.last_partial_text = None;
    }

    pub fn push_result(&mut self, text: impl Into<String>) {
        self.pending_results.push(text.into());
    }

    /// Assembles the pending results into the next user message.
    pub fn take_turn_input(&mut self) -> RunMessage {
        let text = std::mem::take(&mut self.pending_results).join("\n\n");
        RunMessage::User {
            text,
            images: std::mem::take(&mut self.pending_images),
        }
    }

    pub fn set_response(&mut self, text: Option<String>, images: Vec<String>, files: Vec<String>) {
        self.response_text = text.filter(|text| !text.trim().is_empty());
        self.response_images = images;
        self.response_files = files;
    }

    pub fn clear_response(&mut self) {
        self.response_text = None;
        self.response_images.clear();
        self.response_files.clear();
    }

    /// Wraps the human response as `<feedback>`, moving its images into the
    /// next turn's input.
    pub fn take_feedback(&mut self) -> Option<String> {
        self.take_tagged("feedback")
    }

    /// Wraps the human response text in `<tag>` followed by any attached file
    /// paths. Returns `None` when the response carried neither.
    pub fn take_tagged(&mut self, tag: &str) -> Option<String> {
        self.pending_images.append(&mut self.response_images);
        let files = std::mem::take(&mut self.response_files);
        let text = self.response_text.take();
        if text.is_none() && files.is_empty() {
            return None;
        }

        let mut tagged = format!("<{tag}>\n{}\n</{tag}>", text.unwrap_or_default());
        if !files.is_empty() {
            tagged.push_str(&format!("\n<files>\n{}\n</files>", files.join("\n")));
        }
        Some(tagged)
    }

    #[must_use]
    pub fn snapshot(&self) -> CheckpointPayload {
        CheckpointPayload {
            conversation: self.conversation.clone(),
            current_response: self.buffer.clone(),
            pending_results: self.pending_results.clone(),
            consecutive_mistakes: self.consecutive_mistakes,
            consecutive_auto_approvals: self.consecutive_auto_approvals,
            request_count: self.request_count,
        }
    }

    /// Rebuilds a state from a checkpoint. The interrupted turn's partial
    /// response, if any, is closed as an assistant message.
    #[must_use]
    pub fn restore(task_id: impl Into<String>, payload: CheckpointPayload) -> Self {
        let mut state = Self::new(task_id);
        state.conversation = payload.conversation;
        state.pending_results = payload.pending_results;
        state.consecutive_mistakes = payload.consecutive_mistakes;
        state.consecutive_auto_approvals = payload.consecutive_auto_approvals;
        state.request_count = payload.request_count;

        if state.conversation.last().is_some_and(RunMessage::is_user) {
            let response = if payload.current_response.trim().is_empty() {
                INTERRUPTED_RESPONSE.to_string()
            } else {
                payload.current_response
            };
            state.conversation.push(RunMessage::assistant(response));
        }
        state
    }
}

const INTERRUPTED_RESPONSE: &str = "[Response interrupted]";

/// Persisted view of a [`SessionState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub conversation: Vec<RunMessage>,
    #[serde(default)]
    pub current_response: String,
    #[serde(default)]
    pub pending_results: Vec<String>,
    #[serde(default)]
    pub consecutive_mistakes: u32,
    #[serde(default)]
    pub consecutive_auto_approvals: u32,
    #[serde(default)]
    pub request_count: u32,
}

/// Drops the older half of the history after the first message, in whole
/// user/assistant pairs. Returns how many messages were removed.
pub fn truncate_conversation(conversation: &mut Vec<RunMessage>) -> usize {
    let rest = conversation.len().saturating_sub(1);
    let removable = rest.saturating_sub(1) & !1;
    let remove = ((rest / 2) & !1).min(removable);
    if remove > 0 {
        conversation.drain(1..=remove);
    }
    remove
}
