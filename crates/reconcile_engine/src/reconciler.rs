//! Incremental application of edit fragments to an original text.

use std::ops::Range;

use crate::error::ReconcileError;
use crate::fragment::EditFragment;
use crate::matcher::{cascade_strategies, find_match, line_of, line_span, MatchStrategy};

/// Where a confirmed fragment landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentMatch {
    pub index: usize,
    pub strategy: MatchStrategy,
    /// Zero-based lines of the original that were replaced.
    pub original_lines: Range<usize>,
    /// Zero-based lines of the output holding the replacement.
    pub output_lines: Range<usize>,
}

/// Preview of the still-streaming last fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionalEdit {
    pub index: usize,
    pub strategy: MatchStrategy,
    pub original_lines: Range<usize>,
    pub output_lines: Range<usize>,
}

/// Result of one [`Reconciler::update`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileUpdate {
    /// Full reconstructed text: confirmed output, provisional replacement
    /// when it could be located, then the unconsumed original tail.
    pub content: String,
    /// Every fragment confirmed so far, in order.
    pub confirmed: Vec<FragmentMatch>,
    pub provisional: Option<ProvisionalEdit>,
}

/// Final result of a one-shot reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    pub content: String,
    pub matches: Vec<FragmentMatch>,
}

struct Located {
    strategy: MatchStrategy,
    range: Range<usize>,
}

/// Applies a growing fragment list against a fixed original.
///
/// Confirmed fragments are never re-applied. While the stream is open the
/// last fragment stays provisional: it may still grow, so it is previewed and
/// its match failures are not reported.
#[derive(Debug, Clone)]
pub struct Reconciler {
    original: String,
    cursor: usize,
    output: String,
    confirmed: Vec<FragmentMatch>,
    finished: bool,
}

impl Reconciler {
    #[must_use]
    pub fn new(original: impl Into<String>) -> Self {
        Self {
            original: original.into(),
            cursor: 0,
            output: String::new(),
            confirmed: Vec::new(),
            finished: false,
        }
    }

    /// Number of fragments confirmed so far.
    #[must_use]
    pub fn confirmed_count(&self) -> usize {
        self.confirmed.len()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feeds the full fragment list seen so far.
    ///
    /// With `is_final` every fragment is confirmed and the reconciler closes;
    /// further calls return [`ReconcileError::AlreadyFinished`].
    pub fn update(
        &mut self,
        fragments: &[EditFragment],
        is_final: bool,
    ) -> Result<ReconcileUpdate, ReconcileError> {
        if self.finished {
            return Err(ReconcileError::AlreadyFinished);
        }
        if fragments.len() < self.confirmed.len() {
            return Err(ReconcileError::FragmentsRewound {
                previous: self.confirmed.len(),
                current: fragments.len(),
            });
        }

        let confirm_until = if is_final {
            fragments.len()
        } else {
            fragments.len().saturating_sub(1)
        };

        for index in self.confirmed.len()..confirm_until {
            self.confirm(index, &fragments[index])?;
        }

        if is_final {
            self.finished = true;
            return Ok(ReconcileUpdate {
                content: self.assemble(None),
                confirmed: self.confirmed.clone(),
                provisional: None,
            });
        }

        let provisional = fragments.get(confirm_until).and_then(|fragment| {
            self.locate(confirm_until, fragment)
                .ok()
                .map(|located| (fragment, located))
        });

        let Some((fragment, located)) = provisional else {
            return Ok(ReconcileUpdate {
                content: self.assemble(None),
                confirmed: self.confirmed.clone(),
                provisional: None,
            });
        };

        let output_start = self.output.len() + self.pending_gap(&located).len();
        let content = self.assemble(Some((&located, fragment.replace.as_str())));
        let output_range = output_start..output_start + fragment.replace.len();
        let edit = ProvisionalEdit {
            index: confirm_until,
            strategy: located.strategy,
            original_lines: self.original_lines(&located),
            output_lines: line_span(&content, &output_range),
        };

        Ok(ReconcileUpdate {
            content,
            confirmed: self.confirmed.clone(),
            provisional: Some(edit),
        })
    }

    fn confirm(&mut self, index: usize, fragment: &EditFragment) -> Result<(), ReconcileError> {
        let located = self.locate(index, fragment)?;
        let original_lines = self.original_lines(&located);

        if located.strategy == MatchStrategy::NewFile {
            self.original.clear();
            self.cursor = 0;
            self.output.clear();
        } else {
            let gap_end = located.range.start;
            self.output.push_str(&self.original[self.cursor..gap_end]);
            self.cursor = located.range.end;
        }

        let output_start = self.output.len();
        self.output.push_str(&fragment.replace);
        let output_lines = line_span(&self.output, &(output_start..self.output.len()));

        self.confirmed.push(FragmentMatch {
            index,
            strategy: located.strategy,
            original_lines,
            output_lines,
        });
        Ok(())
    }

    fn locate(&self, index: usize, fragment: &EditFragment) -> Result<Located, ReconcileError> {
        if fragment.search.is_empty() {
            if index == 0 {
                return Ok(Located {
                    strategy: MatchStrategy::NewFile,
                    range: 0..self.original.len(),
                });
            }
            return Err(ReconcileError::EmptySearch { index });
        }

        if let Some((strategy, range)) = find_match(&self.original, &fragment.search, self.cursor)
        {
            return Ok(Located { strategy, range });
        }

        if self.cursor > 0 {
            if let Some((_, earlier)) = find_match(&self.original, &fragment.search, 0) {
                if earlier.start < self.cursor {
                    return Err(ReconcileError::OrderViolation {
                        index,
                        found_line: line_of(&self.original, earlier.start) + 1,
                        cursor_line: line_of(&self.original, self.cursor) + 1,
                    });
                }
            }
        }

        Err(ReconcileError::NoMatch {
            index,
            attempted: cascade_strategies(),
            search: fragment.search.clone(),
        })
    }

    fn original_lines(&self, located: &Located) -> Range<usize> {
        if located.strategy == MatchStrategy::NewFile {
            return 0..0;
        }
        line_span(&self.original, &located.range)
    }

    fn pending_gap(&self, located: &Located) -> &str {
        if located.strategy == MatchStrategy::NewFile {
            ""
        } else {
            &self.original[self.cursor..located.range.start]
        }
    }

    fn assemble(&self, provisional: Option<(&Located, &str)>) -> String {
        let mut content = self.output.clone();
        match provisional {
            Some((located, replace)) if located.strategy == MatchStrategy::NewFile => {
                content.clear();
                content.push_str(replace);
            }
            Some((located, replace)) => {
                content.push_str(self.pending_gap(located));
                content.push_str(replace);
                content.push_str(&self.original[located.range.end..]);
            }
            None => content.push_str(&self.original[self.cursor..]),
        }
        content
    }
}

/// Applies `fragments` to `original` in one call.
///
/// With `is_final == false` the last fragment is treated as provisional and
/// does not appear in `matches`.
pub fn reconcile(
    original: &str,
    fragments: &[EditFragment],
    is_final: bool,
) -> Result<Reconciliation, ReconcileError> {
    let update = Reconciler::new(original).update(fragments, is_final)?;
    Ok(Reconciliation {
        content: update.content,
        matches: update.confirmed,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    fn fragment(search: &str, replace: &str) -> EditFragment {
        EditFragment::new(search, replace)
    }

    #[test]
    fn confirmed_fragments_are_not_reapplied() {
        let mut reconciler = Reconciler::new("a\nb\nc\n");
        let first = fragment("a\n", "A\n");
        let second = fragment("c\n", "C\n");

        let update = reconciler
            .update(&[first.clone(), second.clone()], false)
            .expect("streaming update");
        assert_eq!(update.confirmed.len(), 1);
        assert_eq!(update.content, "A\nb\nC\n");
        assert_eq!(update.provisional.as_ref().map(|edit| edit.index), Some(1));

        let update = reconciler
            .update(&[first, second], true)
            .expect("final update");
        assert_eq!(update.content, "A\nb\nC\n");
        assert_eq!(update.confirmed.len(), 2);
        assert!(reconciler.is_finished());
    }

    #[test]
    fn provisional_failure_is_silent_until_final() {
        let mut reconciler = Reconciler::new("a\n");
        let fragments = [fragment("zzz\n", "y\n")];

        let update = reconciler.update(&fragments, false).expect("provisional");
        assert_eq!(update.content, "a\n");
        assert_eq!(update.provisional, None);

        let error = reconciler.update(&fragments, true).expect_err("final");
        assert_matches!(error, ReconcileError::NoMatch { index: 0, .. });
    }

    #[test]
    fn shrinking_fragment_list_is_rejected() {
        let mut reconciler = Reconciler::new("a\nb\n");
        reconciler
            .update(&[fragment("a\n", "x\n"), fragment("b\n", "y\n")], false)
            .expect("first update");
        let error = reconciler.update(&[], false).expect_err("rewound");
        assert_eq!(
            error,
            ReconcileError::FragmentsRewound {
                previous: 1,
                current: 0
            }
        );
    }

    #[test]
    fn finished_reconciler_refuses_updates() {
        let mut reconciler = Reconciler::new("a\n");
        reconciler
            .update(&[fragment("a\n", "b\n")], true)
            .expect("final");
        assert_eq!(
            reconciler.update(&[], true),
            Err(ReconcileError::AlreadyFinished)
        );
    }

    #[test]
    fn line_ranges_follow_replacements() {
        let result = reconcile(
            "one\ntwo\nthree\nfour\n",
            &[fragment("two\nthree\n", "2\n")],
            true,
        )
        .expect("reconcile");

        assert_eq!(result.content, "one\n2\nfour\n");
        assert_eq!(result.matches[0].original_lines, 1..3);
        assert_eq!(result.matches[0].output_lines, 1..2);
    }
}
