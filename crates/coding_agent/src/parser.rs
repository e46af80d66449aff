//! Streaming parser for action invocations embedded in model narration.
//!
//! The parser is re-run on the whole buffer every time text arrives, so it
//! holds no state. Given a buffer and any extension of it, the segments that
//! were complete for the shorter buffer are unchanged for the longer one.
//!
//! ```text
//! I'll look at the manifest first.
//! <calls>
//! <call name="read_file">
//! <param name="path">Cargo.toml</param>
//! </call>
//! </calls>
//! ```

use once_cell::sync::Lazy;
use regex::Regex;

use crate::actions::{
    coerce_bool, ActionInvocation, ActionName, ActionParams, ContentSegment, BOOLEAN_PARAMETERS,
    VERBATIM_PARAMETERS,
};
use crate::error::TaskErrorKind;

const CALLS_OPEN: &str = "<calls>";
const CALLS_CLOSE: &str = "</calls>";
const CALL_CLOSE: &str = "</call>";
const PARAM_CLOSE: &str = "</param>";

/// Markers a trailing `<...` fragment may still grow into.
const MARKER_STEMS: [&str; 6] = [
    CALLS_OPEN,
    CALLS_CLOSE,
    "<call ",
    CALL_CLOSE,
    "<param ",
    PARAM_CLOSE,
];

static CALL_OPEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^<call\s+name\s*=\s*"([^"<>]*)"\s*>"#).expect("valid call regex")
});
static PARAM_OPEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^<param\s+name\s*=\s*"([^"<>]*)"\s*>"#).expect("valid param regex")
});

/// Splits `buffer` into narration and action segments.
#[must_use]
pub fn parse(buffer: &str) -> Vec<ContentSegment> {
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut cursor = 0;
    let mut text_end = buffer.len();

    while let Some(offset) = buffer[cursor..].find('<') {
        let at = cursor + offset;
        let rest = &buffer[at..];

        if rest.starts_with(CALLS_OPEN) || rest.starts_with(CALLS_CLOSE) {
            push_text(&mut segments, &buffer[text_start..at], false);
            let marker_len = if rest.starts_with(CALLS_OPEN) {
                CALLS_OPEN.len()
            } else {
                CALLS_CLOSE.len()
            };
            cursor = at + marker_len;
            text_start = cursor;
            continue;
        }

        if let Some(open) = CALL_OPEN.captures(rest) {
            let raw_name = open.get(1).map_or("", |name| name.as_str());
            let body_start = at + open.get(0).map_or(0, |whole| whole.end());
            let body = parse_call_body(buffer, body_start);

            // The opening tag already confirmed the narration before it, so
            // a malformed body degrades to a text segment of its own.
            push_text(&mut segments, &buffer[text_start..at], false);
            text_start = at;

            if body.malformed {
                tracing::debug!(
                    kind = ?TaskErrorKind::ParseLeniencyDrop,
                    action = raw_name,
                    "malformed invocation degraded to text"
                );
                match body.end {
                    Some(end) => {
                        cursor = end;
                        continue;
                    }
                    None => break,
                }
            }

            let partial = body.end.is_none();
            match ActionName::resolve(raw_name) {
                Some(name) => segments.push(ContentSegment::Action(build_invocation(
                    name,
                    body.params,
                    partial,
                ))),
                None => tracing::debug!(
                    kind = ?TaskErrorKind::ParseLeniencyDrop,
                    action = raw_name,
                    "dropping invocation of unknown action"
                ),
            }

            match body.end {
                Some(end) => {
                    cursor = end;
                    text_start = end;
                    continue;
                }
                None => {
                    text_start = buffer.len();
                    break;
                }
            }
        }

        if is_pending_marker(rest) {
            text_end = at;
            break;
        }

        cursor = at + 1;
    }

    if text_start < text_end {
        push_text(&mut segments, &buffer[text_start..text_end], true);
    }

    segments
}

/// Marks every segment complete. Used once the stream has ended.
pub fn finalize(segments: &mut [ContentSegment]) {
    for segment in segments {
        match segment {
            ContentSegment::Text { partial, .. } => *partial = false,
            ContentSegment::Action(invocation) => {
                if invocation.partial {
                    invocation.partial = false;
                    apply_defaults(invocation);
                }
            }
        }
    }
}

struct CallBody {
    params: Vec<(String, String)>,
    /// Byte offset just past `</call>`, when present.
    end: Option<usize>,
    malformed: bool,
}

fn parse_call_body(buffer: &str, start: usize) -> CallBody {
    let mut params = Vec::new();
    let mut cursor = start;

    loop {
        let trimmed = buffer[cursor..].trim_start();
        cursor = buffer.len() - trimmed.len();
        let rest = &buffer[cursor..];

        if rest.is_empty() {
            return CallBody {
                params,
                end: None,
                malformed: false,
            };
        }

        if rest.starts_with(CALL_CLOSE) {
            return CallBody {
                params,
                end: Some(cursor + CALL_CLOSE.len()),
                malformed: false,
            };
        }

        if let Some(open) = PARAM_OPEN.captures(rest) {
            let key = open.get(1).map_or("", |key| key.as_str()).to_string();
            let value_start = cursor + open.get(0).map_or(0, |whole| whole.end());
            match buffer[value_start..].find(PARAM_CLOSE) {
                Some(offset) => {
                    params.push((key, buffer[value_start..value_start + offset].to_string()));
                    cursor = value_start + offset + PARAM_CLOSE.len();
                    continue;
                }
                None => {
                    let value = strip_pending_close(&buffer[value_start..], PARAM_CLOSE);
                    params.push((key, value.to_string()));
                    return CallBody {
                        params,
                        end: None,
                        malformed: false,
                    };
                }
            }
        }

        if is_pending_marker(rest) {
            return CallBody {
                params,
                end: None,
                malformed: false,
            };
        }

        return CallBody {
            params,
            end: buffer[cursor..]
                .find(CALL_CLOSE)
                .map(|offset| cursor + offset + CALL_CLOSE.len()),
            malformed: true,
        };
    }
}

fn build_invocation(
    name: ActionName,
    raw_params: Vec<(String, String)>,
    partial: bool,
) -> ActionInvocation {
    let mut params = ActionParams::new();
    for (raw_key, raw_value) in raw_params {
        let Some(key) = name.canonical_parameter(&raw_key) else {
            tracing::debug!(
                kind = ?TaskErrorKind::ParseLeniencyDrop,
                action = %name,
                parameter = raw_key.as_str(),
                "dropping unknown parameter"
            );
            continue;
        };
        params.insert(key, normalize_value(key, &raw_value));
    }

    let mut invocation = ActionInvocation {
        name,
        params,
        partial,
    };
    if !partial {
        apply_defaults(&mut invocation);
    }
    invocation
}

fn normalize_value(key: &str, raw: &str) -> String {
    if BOOLEAN_PARAMETERS.contains(&key) {
        return coerce_bool(raw).to_string();
    }
    if VERBATIM_PARAMETERS.contains(&key) {
        let value = raw.strip_prefix("\r\n").or_else(|| raw.strip_prefix('\n'));
        return value.unwrap_or(raw).to_string();
    }
    raw.trim().to_string()
}

fn apply_defaults(invocation: &mut ActionInvocation) {
    for key in invocation.name.parameters() {
        if invocation.params.contains(key) {
            continue;
        }
        if let Some(default) = invocation.name.default_for(key) {
            invocation.params.insert(*key, default);
        }
    }
}

fn push_text(segments: &mut Vec<ContentSegment>, raw: &str, partial: bool) {
    let value = raw.trim();
    if value.is_empty() {
        return;
    }
    segments.push(ContentSegment::Text {
        value: value.to_string(),
        partial,
    });
}

/// True when `rest` (the buffer tail from a `<`) could still become a marker.
fn is_pending_marker(rest: &str) -> bool {
    if rest.contains('>') || rest.contains('\n') {
        return false;
    }
    MARKER_STEMS
        .iter()
        .any(|stem| stem.starts_with(rest) || rest.starts_with(stem))
}

/// Drops a trailing prefix of `marker` from a still-open value.
fn strip_pending_close<'a>(value: &'a str, marker: &str) -> &'a str {
    let Some(at) = value.rfind('<') else {
        return value;
    };
    if marker.starts_with(&value[at..]) {
        &value[..at]
    } else {
        value
    }
}
