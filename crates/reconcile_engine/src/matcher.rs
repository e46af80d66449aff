//! Locating a fragment's search text inside the original content.
//!
//! Strategies run in a fixed order and the first hit wins. Every strategy only
//! considers text at or after the cursor, so fragments apply in file order.

use std::fmt;
use std::ops::Range;

/// Strategy that located a fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchStrategy {
    /// Literal match anchored at line boundaries.
    Exact,
    /// Line-by-line comparison ignoring surrounding whitespace.
    LineTrimmed,
    /// First and last lines match, interior lines are free.
    BlockAnchor,
    /// Empty search on the first fragment: the file is written from scratch.
    NewFile,
}

impl MatchStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::LineTrimmed => "line-trimmed",
            Self::BlockAnchor => "block-anchor",
            Self::NewFile => "new-file",
        }
    }
}

impl fmt::Display for MatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(content, search, cursor) -> byte range in content`.
pub type Matcher = fn(&str, &str, usize) -> Option<Range<usize>>;

pub const CASCADE: [(MatchStrategy, Matcher); 3] = [
    (MatchStrategy::Exact, exact_match),
    (MatchStrategy::LineTrimmed, line_trimmed_match),
    (MatchStrategy::BlockAnchor, block_anchor_match),
];

/// Minimum search height for anchor matching.
const BLOCK_ANCHOR_MIN_LINES: usize = 3;

/// Runs the cascade from `cursor` and returns the first hit.
#[must_use]
pub fn find_match(
    content: &str,
    search: &str,
    cursor: usize,
) -> Option<(MatchStrategy, Range<usize>)> {
    CASCADE
        .iter()
        .find_map(|(strategy, matcher)| matcher(content, search, cursor).map(|range| (*strategy, range)))
}

/// Strategies the cascade tries, in order.
#[must_use]
pub fn cascade_strategies() -> Vec<MatchStrategy> {
    CASCADE.iter().map(|(strategy, _)| *strategy).collect()
}

pub fn exact_match(content: &str, search: &str, cursor: usize) -> Option<Range<usize>> {
    if search.is_empty() || cursor > content.len() {
        return None;
    }

    let mut from = cursor;
    while let Some(offset) = content.get(from..)?.find(search) {
        let start = from + offset;
        let end = start + search.len();
        if is_line_start(content, start) && (search.ends_with('\n') || is_line_end(content, end)) {
            return Some(start..end);
        }
        from = start + content[start..].chars().next().map_or(1, char::len_utf8);
    }
    None
}

pub fn line_trimmed_match(content: &str, search: &str, cursor: usize) -> Option<Range<usize>> {
    let wanted = search_lines(search)?;
    let lines = lines_from(content, cursor);
    if wanted.len() > lines.len() {
        return None;
    }

    (0..=lines.len() - wanted.len()).find_map(|first| {
        let window = &lines[first..first + wanted.len()];
        let equal = window
            .iter()
            .zip(&wanted)
            .all(|(line, search_line)| line.text(content).trim() == search_line.trim());
        equal.then(|| span(content, window, &wanted, search))
    })
}

pub fn block_anchor_match(content: &str, search: &str, cursor: usize) -> Option<Range<usize>> {
    let wanted = search_lines(search)?;
    if wanted.len() < BLOCK_ANCHOR_MIN_LINES {
        return None;
    }

    let first_anchor = wanted[0].trim();
    let last_anchor = wanted[wanted.len() - 1].trim();
    if first_anchor.is_empty() || last_anchor.is_empty() {
        return None;
    }

    let lines = lines_from(content, cursor);
    if wanted.len() > lines.len() {
        return None;
    }

    (0..=lines.len() - wanted.len()).find_map(|first| {
        let window = &lines[first..first + wanted.len()];
        let anchored = window[0].text(content).trim() == first_anchor
            && window[window.len() - 1].text(content).trim() == last_anchor;
        anchored.then(|| span(content, window, &wanted, search))
    })
}

/// Zero-based index of the line containing byte `offset`.
#[must_use]
pub fn line_of(content: &str, offset: usize) -> usize {
    let offset = offset.min(content.len());
    content.as_bytes()[..offset]
        .iter()
        .filter(|byte| **byte == b'\n')
        .count()
}

/// Lines touched by a byte range, as zero-based half-open line indices.
#[must_use]
pub fn line_span(content: &str, range: &Range<usize>) -> Range<usize> {
    let start = line_of(content, range.start);
    if range.is_empty() {
        return start..start;
    }
    start..line_of(content, range.end - 1) + 1
}

#[derive(Debug, Clone, Copy)]
struct Line {
    start: usize,
    /// End of the text, excluding the line break.
    text_end: usize,
    /// End including the line break.
    end: usize,
}

impl Line {
    fn text<'a>(&self, content: &'a str) -> &'a str {
        &content[self.start..self.text_end]
    }
}

fn search_lines(search: &str) -> Option<Vec<&str>> {
    let lines: Vec<&str> = search.lines().collect();
    if lines.is_empty() || lines.iter().all(|line| line.trim().is_empty()) {
        return None;
    }
    Some(lines)
}

/// Whole lines starting at or after `cursor`.
fn lines_from(content: &str, cursor: usize) -> Vec<Line> {
    let mut lines = Vec::new();
    let mut start = 0;
    for raw in content.split_inclusive('\n') {
        let end = start + raw.len();
        if start >= cursor {
            let text = raw.strip_suffix('\n').unwrap_or(raw);
            let text = text.strip_suffix('\r').unwrap_or(text);
            lines.push(Line {
                start,
                text_end: start + text.len(),
                end,
            });
        }
        start = end;
    }
    lines
}

/// Byte span replaced for a line-based match.
///
/// Starts at the first non-blank character when the search itself starts
/// unindented, so the original indentation survives. Ends after the line break
/// only when the search ends with one.
fn span(content: &str, window: &[Line], wanted: &[&str], search: &str) -> Range<usize> {
    let first = window[0];
    let last = window[window.len() - 1];

    let first_text = first.text(content);
    let start = if wanted[0].starts_with(char::is_whitespace) {
        first.start
    } else {
        first.start + (first_text.len() - first_text.trim_start().len())
    };

    let end = if search.ends_with('\n') {
        last.end
    } else {
        let last_text = last.text(content);
        last.start + last_text.trim_end().len()
    };

    start..end.max(start)
}

fn is_line_start(content: &str, offset: usize) -> bool {
    offset == 0 || content.as_bytes().get(offset - 1) == Some(&b'\n')
}

fn is_line_end(content: &str, offset: usize) -> bool {
    let rest = &content.as_bytes()[offset..];
    rest.is_empty() || rest[0] == b'\n' || rest.starts_with(b"\r\n")
}
