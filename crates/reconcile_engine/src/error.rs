use thiserror::Error;

use crate::matcher::MatchStrategy;

/// Malformed marker structure in an edit block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FragmentParseError {
    #[error("invalid edit block: line {line} has a `=======` separator outside of a SEARCH section")]
    UnexpectedSeparator { line: usize },

    #[error("invalid edit block: line {line} has a REPLACE marker outside of a replace section")]
    UnexpectedReplaceMarker { line: usize },

    #[error("invalid edit block: line {line} opens a SEARCH section before the previous fragment was closed")]
    UnterminatedFragment { line: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Parse(#[from] FragmentParseError),

    #[error(
        "fragment {index}: search text does not match the file (tried {})",
        strategy_list(.attempted)
    )]
    NoMatch {
        index: usize,
        attempted: Vec<MatchStrategy>,
        search: String,
    },

    #[error(
        "fragment {index}: search text only matches at line {found_line}, before line {cursor_line} which an earlier fragment already consumed"
    )]
    OrderViolation {
        index: usize,
        found_line: usize,
        cursor_line: usize,
    },

    #[error("fragment {index}: empty search text is only allowed as the first fragment of a new file")]
    EmptySearch { index: usize },

    #[error("fragment list shrank from {previous} to {current} entries between updates")]
    FragmentsRewound { previous: usize, current: usize },

    #[error("reconciliation was already finalized")]
    AlreadyFinished,
}

impl ReconcileError {
    /// Index of the fragment the error refers to, when there is one.
    #[must_use]
    pub fn fragment_index(&self) -> Option<usize> {
        match self {
            Self::NoMatch { index, .. }
            | Self::OrderViolation { index, .. }
            | Self::EmptySearch { index } => Some(*index),
            Self::Parse(_) | Self::FragmentsRewound { .. } | Self::AlreadyFinished => None,
        }
    }
}

fn strategy_list(strategies: &[MatchStrategy]) -> String {
    strategies
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
