//! Provider-agnostic contract for streaming one model turn as text.
//!
//! A run is a lazy, append-only sequence of text chunks terminated by exactly
//! one terminal event. Runs are not restartable: every task turn starts a new
//! run with a fresh [`RunId`]. Action invocations travel inside the text, so
//! this crate carries no tool-calling envelope.

use std::fmt;
use std::sync::{atomic::AtomicBool, Arc};

use serde::{Deserialize, Serialize};

/// Identifier for one provider run.
pub type RunId = u64;

/// Shared cancellation flag for a run.
pub type CancelSignal = Arc<AtomicBool>;

/// Error returned while constructing/configuring a provider before any run starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInitError {
    message: String,
}

impl ProviderInitError {
    /// Creates a new provider initialization error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Returns the underlying error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for ProviderInitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ProviderInitError {}

impl From<String> for ProviderInitError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for ProviderInitError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Provider-neutral model-facing message history item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum RunMessage {
    User {
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        images: Vec<String>,
    },
    Assistant {
        text: String,
    },
}

impl RunMessage {
    /// Builds a text-only user message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            text: text.into(),
            images: Vec::new(),
        }
    }

    /// Builds an assistant message.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::Assistant { text: text.into() }
    }

    /// Returns the message text regardless of role.
    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Self::User { text, .. } | Self::Assistant { text } => text,
        }
    }

    #[must_use]
    pub fn is_user(&self) -> bool {
        matches!(self, Self::User { .. })
    }
}

/// Input required to start a provider run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub run_id: RunId,
    pub messages: Vec<RunMessage>,
    pub instructions: String,
}

/// Classification of a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunFailureKind {
    /// The request did not fit into the model context window.
    ContextWindowExceeded,
    /// The stream could not be delivered (connection, timeout, protocol).
    Transport,
    /// The provider rejected or aborted the request for any other reason.
    Provider,
}

/// Terminal failure reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFailure {
    pub kind: RunFailureKind,
    pub message: String,
}

impl RunFailure {
    #[must_use]
    pub fn new(kind: RunFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn context_window(message: impl Into<String>) -> Self {
        Self::new(RunFailureKind::ContextWindowExceeded, message)
    }

    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(RunFailureKind::Transport, message)
    }

    #[must_use]
    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(RunFailureKind::Provider, message)
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Provider-emitted lifecycle event for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Started { run_id: RunId },
    Chunk { run_id: RunId, text: String },
    Finished { run_id: RunId },
    Failed { run_id: RunId, failure: RunFailure },
    Cancelled { run_id: RunId },
}

impl RunEvent {
    /// Returns the run identifier associated with this event.
    #[must_use]
    pub fn run_id(&self) -> RunId {
        match self {
            Self::Started { run_id }
            | Self::Chunk { run_id, .. }
            | Self::Finished { run_id }
            | Self::Failed { run_id, .. }
            | Self::Cancelled { run_id } => *run_id,
        }
    }

    /// Returns true when this event terminates the run lifecycle.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}

/// Immutable metadata describing a run provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderProfile {
    pub provider_id: String,
    pub model_id: String,
}

/// Provider interface for streaming one run request.
pub trait RunProvider: Send + Sync + 'static {
    /// Returns provider/model identity metadata.
    fn profile(&self) -> ProviderProfile;

    /// Executes a run request and emits lifecycle events in provider order.
    ///
    /// Implementations must emit exactly one terminal event and should poll
    /// `cancel` between chunks.
    fn run(
        &self,
        req: RunRequest,
        cancel: CancelSignal,
        emit: &mut dyn FnMut(RunEvent),
    ) -> Result<(), String>;
}

#[cfg(test)]
mod tests {
    use super::{
        CancelSignal, ProviderInitError, ProviderProfile, RunEvent, RunFailure, RunFailureKind,
        RunMessage, RunProvider, RunRequest,
    };

    struct MinimalProvider;

    impl RunProvider for MinimalProvider {
        fn profile(&self) -> ProviderProfile {
            ProviderProfile {
                provider_id: "minimal".to_string(),
                model_id: "minimal-model".to_string(),
            }
        }

        fn run(
            &self,
            req: RunRequest,
            _cancel: CancelSignal,
            emit: &mut dyn FnMut(RunEvent),
        ) -> Result<(), String> {
            emit(RunEvent::Started { run_id: req.run_id });
            emit(RunEvent::Finished { run_id: req.run_id });
            Ok(())
        }
    }

    #[test]
    fn run_event_run_id_returns_event_run_id() {
        let run_id = 42;
        let events = [
            RunEvent::Started { run_id },
            RunEvent::Chunk {
                run_id,
                text: "partial".to_string(),
            },
            RunEvent::Finished { run_id },
            RunEvent::Failed {
                run_id,
                failure: RunFailure::transport("reset"),
            },
            RunEvent::Cancelled { run_id },
        ];

        for event in events {
            assert_eq!(event.run_id(), run_id);
        }
    }

    #[test]
    fn run_event_terminal_detection_matches_lifecycle() {
        assert!(!RunEvent::Started { run_id: 1 }.is_terminal());
        assert!(!RunEvent::Chunk {
            run_id: 1,
            text: "hello".to_string(),
        }
        .is_terminal());
        assert!(RunEvent::Finished { run_id: 1 }.is_terminal());
        assert!(RunEvent::Failed {
            run_id: 1,
            failure: RunFailure::provider("boom"),
        }
        .is_terminal());
        assert!(RunEvent::Cancelled { run_id: 1 }.is_terminal());
    }

    #[test]
    fn provider_init_error_preserves_message() {
        let error = ProviderInitError::new("missing script");
        assert_eq!(error.message(), "missing script");
        assert_eq!(error.to_string(), "missing script");
    }

    #[test]
    fn failure_constructors_set_kind() {
        assert_eq!(
            RunFailure::context_window("too long").kind,
            RunFailureKind::ContextWindowExceeded
        );
        assert_eq!(RunFailure::transport("eof").kind, RunFailureKind::Transport);
        assert_eq!(RunFailure::provider("400").to_string(), "400");
    }

    #[test]
    fn run_message_serializes_with_role_tag() {
        let message = RunMessage::user("list files");
        let json = serde_json::to_value(&message).expect("message should serialize");
        assert_eq!(json, serde_json::json!({"role": "user", "text": "list files"}));

        let restored: RunMessage =
            serde_json::from_value(serde_json::json!({"role": "assistant", "text": "ok"}))
                .expect("assistant message should deserialize");
        assert_eq!(restored, RunMessage::assistant("ok"));
        assert_eq!(restored.text(), "ok");
        assert!(!restored.is_user());
    }

    #[test]
    fn minimal_provider_emits_started_then_finished() {
        let mut events = Vec::new();
        MinimalProvider
            .run(
                RunRequest {
                    run_id: 3,
                    messages: vec![RunMessage::user("hi")],
                    instructions: "system".to_string(),
                },
                CancelSignal::default(),
                &mut |event| events.push(event),
            )
            .expect("run should succeed");

        assert_eq!(
            events,
            vec![
                RunEvent::Started { run_id: 3 },
                RunEvent::Finished { run_id: 3 }
            ]
        );
        assert_eq!(MinimalProvider.profile().provider_id, "minimal");
    }
}
