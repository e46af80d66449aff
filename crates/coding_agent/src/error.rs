use std::fmt;

use checkpoint_store::CheckpointStoreError;
use thiserror::Error;

/// Classification of the recoverable conditions a task runs into.
///
/// None of these abort a task on their own. They are attached to log events
/// and to [`crate::executor::ExecutionOutcome`] so callers and tests can tell
/// failures apart without matching on result text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskErrorKind {
    /// Unknown action or parameter names dropped by the parser.
    ParseLeniencyDrop,
    /// An action segment is still streaming. Transient.
    PartialSegmentIncomplete,
    /// No matching strategy located a fragment's search text.
    ReconciliationMatchFailure,
    /// A fragment matched only before the previous fragment's position.
    ReconciliationOrderViolation,
    ApprovalRejected,
    ConsecutiveMistakeThresholdExceeded,
    ContextBudgetExceeded,
    /// A required parameter is absent or blank.
    MissingParameter,
    /// Workspace I/O or process failure while running an action.
    ActionFailed,
}

impl TaskErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ParseLeniencyDrop => "parse_leniency_drop",
            Self::PartialSegmentIncomplete => "partial_segment_incomplete",
            Self::ReconciliationMatchFailure => "reconciliation_match_failure",
            Self::ReconciliationOrderViolation => "reconciliation_order_violation",
            Self::ApprovalRejected => "approval_rejected",
            Self::ConsecutiveMistakeThresholdExceeded => "consecutive_mistake_threshold_exceeded",
            Self::ContextBudgetExceeded => "context_budget_exceeded",
            Self::MissingParameter => "missing_parameter",
            Self::ActionFailed => "action_failed",
        }
    }

    /// Whether the condition counts toward the consecutive-mistake limit.
    #[must_use]
    pub fn is_mistake(self) -> bool {
        matches!(
            self,
            Self::MissingParameter
                | Self::ReconciliationMatchFailure
                | Self::ReconciliationOrderViolation
        )
    }
}

impl fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures while creating or resuming a task. These happen before any model
/// turn runs and are returned to the caller.
#[derive(Debug, Error)]
pub enum TaskSetupError {
    #[error("{0}")]
    Spawn(String),
    #[error(transparent)]
    Store(#[from] CheckpointStoreError),
    #[error("no checkpoint found for task {task_id}")]
    MissingCheckpoint { task_id: String },
    #[error("checkpoint payload is not a task snapshot: {0}")]
    Payload(#[from] serde_json::Error),
}
