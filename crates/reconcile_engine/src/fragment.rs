//! Parsing of SEARCH/REPLACE edit blocks.
//!
//! ```text
//! ------- SEARCH
//! old lines
//! =======
//! new lines
//! +++++++ REPLACE
//! ```
//!
//! The legacy `<<<<<<< SEARCH` / `>>>>>>> REPLACE` markers are accepted too.
//! Parsing is total over truncated input: a fragment whose separator has been
//! seen but whose REPLACE marker has not is returned with `closed = false`.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::FragmentParseError;

static SEARCH_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:-{3,}|<{3,}) ?SEARCH>?$").expect("valid search marker regex"));
static SEPARATOR_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^={3,}$").expect("valid separator regex"));
static REPLACE_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\+{3,}|>{3,}) ?REPLACE>?$").expect("valid replace marker regex")
});

/// One search/replace pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditFragment {
    pub search: String,
    pub replace: String,
    /// Whether the closing REPLACE marker was seen.
    pub closed: bool,
}

impl EditFragment {
    #[must_use]
    pub fn new(search: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            search: search.into(),
            replace: replace.into(),
            closed: true,
        }
    }
}

enum Section {
    Outside,
    Search { search: String },
    Replace { search: String, replace: String },
}

/// Parses every fragment found in `diff`.
pub fn parse_fragments(diff: &str) -> Result<Vec<EditFragment>, FragmentParseError> {
    let mut fragments = Vec::new();
    let mut section = Section::Outside;

    for (line_index, raw_line) in diff.split_inclusive('\n').enumerate() {
        let line_number = line_index + 1;
        let marker = raw_line.trim_end_matches(['\n', '\r']).trim_end();

        section = match section {
            Section::Outside => {
                if SEARCH_MARKER.is_match(marker) {
                    Section::Search {
                        search: String::new(),
                    }
                } else if SEPARATOR_MARKER.is_match(marker) {
                    return Err(FragmentParseError::UnexpectedSeparator { line: line_number });
                } else if REPLACE_MARKER.is_match(marker) {
                    return Err(FragmentParseError::UnexpectedReplaceMarker {
                        line: line_number,
                    });
                } else {
                    Section::Outside
                }
            }
            Section::Search { mut search } => {
                if SEPARATOR_MARKER.is_match(marker) {
                    Section::Replace {
                        search,
                        replace: String::new(),
                    }
                } else if SEARCH_MARKER.is_match(marker) {
                    return Err(FragmentParseError::UnterminatedFragment { line: line_number });
                } else if REPLACE_MARKER.is_match(marker) {
                    return Err(FragmentParseError::UnexpectedReplaceMarker {
                        line: line_number,
                    });
                } else {
                    search.push_str(raw_line);
                    Section::Search { search }
                }
            }
            Section::Replace {
                search,
                mut replace,
            } => {
                if REPLACE_MARKER.is_match(marker) {
                    fragments.push(EditFragment {
                        search,
                        replace,
                        closed: true,
                    });
                    Section::Outside
                } else if SEARCH_MARKER.is_match(marker) {
                    return Err(FragmentParseError::UnterminatedFragment { line: line_number });
                } else {
                    replace.push_str(raw_line);
                    Section::Replace { search, replace }
                }
            }
        };
    }

    if let Section::Replace {
        search,
        mut replace,
    } = section
    {
        strip_trailing_marker_prefix(&mut replace);
        fragments.push(EditFragment {
            search,
            replace,
            closed: false,
        });
    }

    Ok(fragments)
}

/// Drops an unterminated last line that is the beginning of a REPLACE marker.
fn strip_trailing_marker_prefix(replace: &mut String) {
    let last_line_start = replace.rfind('\n').map_or(0, |index| index + 1);
    let tail = &replace[last_line_start..];
    if !tail.is_empty() && is_replace_marker_prefix(tail) {
        replace.truncate(last_line_start);
    }
}

fn is_replace_marker_prefix(tail: &str) -> bool {
    let Some(marker_char) = tail.chars().next().filter(|ch| matches!(ch, '+' | '>')) else {
        return false;
    };
    let rest = tail.trim_start_matches(marker_char);
    let rest = rest.strip_prefix(' ').unwrap_or(rest);
    "REPLACE>".starts_with(rest)
}
