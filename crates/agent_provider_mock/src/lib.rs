//! Deterministic scripted implementation of the shared `agent_provider` contract.
//!
//! Each run consumes the next [`TurnScript`] and replays it as word-sized
//! chunks. This crate contains no transport logic and backs both contract
//! tests and offline runs of the `coding_agent` CLI.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use agent_provider::{
    CancelSignal, ProviderProfile, RunEvent, RunFailure, RunFailureKind, RunProvider, RunRequest,
};

/// Stable provider identifier used for explicit startup selection.
pub const MOCK_PROVIDER_ID: &str = "mock";

/// Line separating turns in a script file.
pub const TURN_SEPARATOR: &str = "=== turn ===";

const FAILURE_PREFIX: &str = "!fail ";

/// What one run should stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnScript {
    /// Stream `text` and finish normally.
    Reply(String),
    /// Stream `text`, then fail with `failure`.
    ReplyThenFail { text: String, failure: RunFailure },
}

impl TurnScript {
    #[must_use]
    pub fn reply(text: impl Into<String>) -> Self {
        Self::Reply(text.into())
    }

    #[must_use]
    pub fn fail(failure: RunFailure) -> Self {
        Self::ReplyThenFail {
            text: String::new(),
            failure,
        }
    }
}

/// Deterministic provider that replays one script per run.
#[derive(Debug)]
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<TurnScript>>,
    requests: Mutex<Vec<RunRequest>>,
    token_delay: Duration,
}

impl ScriptedProvider {
    /// Creates a provider that replays `turns` in order without delays.
    #[must_use]
    pub fn new(turns: Vec<TurnScript>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            token_delay: Duration::ZERO,
        }
    }

    /// Convenience constructor for plain replies.
    #[must_use]
    pub fn from_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(replies.into_iter().map(TurnScript::reply).collect())
    }

    /// Parses a script file: turns separated by [`TURN_SEPARATOR`] lines, a
    /// turn whose first line is `!fail <kind>: <message>` fails instead of
    /// replying (`kind` is `context_window`, `transport` or `provider`).
    #[must_use]
    pub fn from_script_text(script: &str) -> Self {
        Self::new(parse_script(script))
    }

    /// Sleeps `delay` between emitted chunks.
    #[must_use]
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Returns every request received so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<RunRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    /// Returns how many scripted turns remain.
    #[must_use]
    pub fn remaining_turns(&self) -> usize {
        lock_unpoisoned(&self.turns).len()
    }

    fn stream_text(
        &self,
        run_id: u64,
        text: &str,
        cancel: &CancelSignal,
        emit: &mut dyn FnMut(RunEvent),
    ) -> bool {
        let mut pending_token = String::new();
        for ch in text.chars() {
            pending_token.push(ch);

            if matches!(ch, ' ' | '\n') {
                if cancel.load(Ordering::SeqCst) {
                    return false;
                }
                emit(RunEvent::Chunk {
                    run_id,
                    text: std::mem::take(&mut pending_token),
                });
                self.pause();
            }
        }

        if !pending_token.is_empty() {
            if cancel.load(Ordering::SeqCst) {
                return false;
            }
            emit(RunEvent::Chunk {
                run_id,
                text: pending_token,
            });
            self.pause();
        }

        true
    }

    fn pause(&self) {
        if !self.token_delay.is_zero() {
            thread::sleep(self.token_delay);
        }
    }
}

impl RunProvider for ScriptedProvider {
    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            provider_id: MOCK_PROVIDER_ID.to_string(),
            model_id: "scripted".to_string(),
        }
    }

    fn run(
        &self,
        req: RunRequest,
        cancel: CancelSignal,
        emit: &mut dyn FnMut(RunEvent),
    ) -> Result<(), String> {
        let run_id = req.run_id;
        lock_unpoisoned(&self.requests).push(req);
        let next = lock_unpoisoned(&self.turns).pop_front();

        emit(RunEvent::Started { run_id });

        let Some(script) = next else {
            emit(RunEvent::Failed {
                run_id,
                failure: RunFailure::provider("mock script exhausted"),
            });
            return Ok(());
        };

        let (text, failure) = match script {
            TurnScript::Reply(text) => (text, None),
            TurnScript::ReplyThenFail { text, failure } => (text, Some(failure)),
        };

        if !self.stream_text(run_id, &text, &cancel, emit) || cancel.load(Ordering::SeqCst) {
            emit(RunEvent::Cancelled { run_id });
            return Ok(());
        }

        match failure {
            Some(failure) => emit(RunEvent::Failed { run_id, failure }),
            None => emit(RunEvent::Finished { run_id }),
        }

        Ok(())
    }
}

/// Splits a script file into turns.
#[must_use]
pub fn parse_script(script: &str) -> Vec<TurnScript> {
    let mut turns = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in script.lines() {
        if line.trim() == TURN_SEPARATOR {
            turns.push(turn_from_lines(&current));
            current.clear();
        } else {
            current.push(line);
        }
    }

    if current.iter().any(|line| !line.trim().is_empty()) {
        turns.push(turn_from_lines(&current));
    }

    turns
}

fn turn_from_lines(lines: &[&str]) -> TurnScript {
    let text = lines.join("\n");
    let trimmed = text.trim_start();

    if let Some(directive) = trimmed.strip_prefix(FAILURE_PREFIX) {
        let (kind, message) = directive
            .split_once(':')
            .map(|(kind, message)| (kind.trim(), message.trim()))
            .unwrap_or((directive.trim(), ""));
        let kind = match kind {
            "context_window" => RunFailureKind::ContextWindowExceeded,
            "transport" => RunFailureKind::Transport,
            _ => RunFailureKind::Provider,
        };
        return TurnScript::fail(RunFailure::new(kind, message));
    }

    TurnScript::Reply(text)
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    use agent_provider::RunMessage;

    use super::*;

    fn collect_events(provider: &ScriptedProvider, cancel: CancelSignal) -> Vec<RunEvent> {
        let mut events = Vec::new();
        provider
            .run(
                RunRequest {
                    run_id: 7,
                    messages: vec![RunMessage::user("test")],
                    instructions: "system instructions".to_string(),
                },
                cancel,
                &mut |event| events.push(event),
            )
            .expect("mock run should succeed");
        events
    }

    fn streamed_text(events: &[RunEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                RunEvent::Chunk { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn profile_exposes_explicit_mock_provider_identity() {
        let profile = ScriptedProvider::new(Vec::new()).profile();

        assert_eq!(profile.provider_id, MOCK_PROVIDER_ID);
        assert_eq!(profile.model_id, "scripted");
    }

    #[test]
    fn run_emits_started_chunks_and_finished() {
        let provider = ScriptedProvider::from_replies(["one two\nthree"]);
        let events = collect_events(&provider, Arc::new(AtomicBool::new(false)));

        assert!(matches!(events.first(), Some(RunEvent::Started { run_id: 7 })));
        assert!(matches!(events.last(), Some(RunEvent::Finished { run_id: 7 })));
        assert_eq!(streamed_text(&events), "one two\nthree");
        assert!(events.len() > 3, "text should arrive as several chunks");
    }

    #[test]
    fn run_emits_cancelled_when_cancel_is_set() {
        let provider = ScriptedProvider::from_replies(["ignored words"]);
        let events = collect_events(&provider, Arc::new(AtomicBool::new(true)));

        assert!(matches!(events.first(), Some(RunEvent::Started { run_id: 7 })));
        assert!(matches!(events.last(), Some(RunEvent::Cancelled { run_id: 7 })));
        assert_eq!(streamed_text(&events), "");
    }

    #[test]
    fn scripts_are_consumed_in_order_and_requests_recorded() {
        let provider = ScriptedProvider::from_replies(["first", "second"]);

        let first = collect_events(&provider, Arc::new(AtomicBool::new(false)));
        let second = collect_events(&provider, Arc::new(AtomicBool::new(false)));
        let third = collect_events(&provider, Arc::new(AtomicBool::new(false)));

        assert_eq!(streamed_text(&first), "first");
        assert_eq!(streamed_text(&second), "second");
        assert!(matches!(
            third.last(),
            Some(RunEvent::Failed { failure, .. }) if failure.message == "mock script exhausted"
        ));
        assert_eq!(provider.requests().len(), 3);
        assert_eq!(provider.remaining_turns(), 0);
    }

    #[test]
    fn script_text_splits_turns_and_failure_directives() {
        let script = "hello\n=== turn ===\n!fail context_window: prompt too long\n=== turn ===\nbye\n";
        let turns = parse_script(script);

        assert_eq!(
            turns,
            vec![
                TurnScript::Reply("hello".to_string()),
                TurnScript::fail(RunFailure::context_window("prompt too long")),
                TurnScript::Reply("bye".to_string()),
            ]
        );
    }

    #[test]
    fn failing_turn_emits_failed_event_after_text() {
        let provider = ScriptedProvider::new(vec![TurnScript::ReplyThenFail {
            text: "partial".to_string(),
            failure: RunFailure::transport("connection reset"),
        }]);
        let events = collect_events(&provider, Arc::new(AtomicBool::new(false)));

        assert_eq!(streamed_text(&events), "partial");
        assert_eq!(
            events.last(),
            Some(&RunEvent::Failed {
                run_id: 7,
                failure: RunFailure::transport("connection reset"),
            })
        );
    }
}
