//! Action vocabulary and the segment types produced by the parser.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Every action the agent can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionName {
    ListFiles,
    SearchFiles,
    ReadFile,
    WriteToFile,
    ReplaceInFile,
    ExecuteCommand,
    AskFollowupQuestion,
    AttemptCompletion,
}

impl ActionName {
    pub const ALL: [ActionName; 8] = [
        Self::ListFiles,
        Self::SearchFiles,
        Self::ReadFile,
        Self::WriteToFile,
        Self::ReplaceInFile,
        Self::ExecuteCommand,
        Self::AskFollowupQuestion,
        Self::AttemptCompletion,
    ];

    /// Resolves a raw name from model output, accepting known aliases.
    #[must_use]
    pub fn resolve(raw: &str) -> Option<Self> {
        let name = match raw.trim() {
            "list_files" | "LS" | "Glob" => Self::ListFiles,
            "search_files" | "Grep" => Self::SearchFiles,
            "read_file" | "Read" => Self::ReadFile,
            "write_to_file" | "Write" => Self::WriteToFile,
            "replace_in_file" | "Edit" => Self::ReplaceInFile,
            "execute_command" | "Bash" => Self::ExecuteCommand,
            "ask_followup_question" => Self::AskFollowupQuestion,
            "attempt_completion" => Self::AttemptCompletion,
            _ => return None,
        };
        Some(name)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ListFiles => "list_files",
            Self::SearchFiles => "search_files",
            Self::ReadFile => "read_file",
            Self::WriteToFile => "write_to_file",
            Self::ReplaceInFile => "replace_in_file",
            Self::ExecuteCommand => "execute_command",
            Self::AskFollowupQuestion => "ask_followup_question",
            Self::AttemptCompletion => "attempt_completion",
        }
    }

    /// Canonical parameter names, required ones first.
    #[must_use]
    pub fn parameters(self) -> &'static [&'static str] {
        match self {
            Self::ListFiles => &["path", "recursive"],
            Self::SearchFiles => &["path", "expression", "file_pattern"],
            Self::ReadFile => &["path"],
            Self::WriteToFile => &["path", "content"],
            Self::ReplaceInFile => &["path", "diff"],
            Self::ExecuteCommand => &["command", "requires_approval"],
            Self::AskFollowupQuestion => &["question", "options"],
            Self::AttemptCompletion => &["result", "command"],
        }
    }

    #[must_use]
    pub fn required_parameters(self) -> &'static [&'static str] {
        match self {
            Self::ListFiles | Self::ReadFile => &["path"],
            Self::SearchFiles => &["path", "expression"],
            Self::WriteToFile => &["path", "content"],
            Self::ReplaceInFile => &["path", "diff"],
            Self::ExecuteCommand => &["command"],
            Self::AskFollowupQuestion => &["question"],
            Self::AttemptCompletion => &["result"],
        }
    }

    /// Value filled in for an absent parameter once the invocation is complete.
    #[must_use]
    pub fn default_for(self, parameter: &str) -> Option<&'static str> {
        match (self, parameter) {
            (Self::ListFiles, "recursive") => Some("false"),
            (Self::ExecuteCommand, "requires_approval") => Some("true"),
            _ => None,
        }
    }

    /// Maps a raw parameter name to this action's canonical name.
    #[must_use]
    pub fn canonical_parameter(self, raw: &str) -> Option<&'static str> {
        let normalized = match raw.trim() {
            "pattern" | "regex" => "expression",
            "file_path" => "path",
            "cmd" => "command",
            "glob" | "include" => "file_pattern",
            "edits" => "diff",
            other => other,
        };
        self.parameters()
            .iter()
            .copied()
            .find(|candidate| *candidate == normalized)
    }

    /// Whether the action changes workspace files.
    #[must_use]
    pub fn is_edit(self) -> bool {
        matches!(self, Self::WriteToFile | Self::ReplaceInFile)
    }
}

impl fmt::Display for ActionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters whose values are coerced to `"true"` / `"false"`.
pub const BOOLEAN_PARAMETERS: [&str; 2] = ["recursive", "requires_approval"];

/// Parameters whose values keep surrounding whitespace.
pub const VERBATIM_PARAMETERS: [&str; 2] = ["content", "diff"];

#[must_use]
pub fn coerce_bool(raw: &str) -> &'static str {
    let truthy = ["true", "yes", "y", "1", "on"]
        .iter()
        .any(|candidate| raw.trim().eq_ignore_ascii_case(candidate));
    if truthy {
        "true"
    } else {
        "false"
    }
}

/// Insertion-ordered parameter map. Re-inserting a key replaces its value in
/// place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionParams(Vec<(String, String)>);

impl ActionParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ActionParams {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut params = Self::new();
        for (key, value) in iter {
            params.insert(key, value);
        }
        params
    }
}

/// One parsed action request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionInvocation {
    pub name: ActionName,
    pub params: ActionParams,
    /// The closing marker has not been seen yet.
    pub partial: bool,
}

impl ActionInvocation {
    #[must_use]
    pub fn new(name: ActionName, params: ActionParams) -> Self {
        Self {
            name,
            params,
            partial: false,
        }
    }

    #[must_use]
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key)
    }

    /// First required parameter that is absent or blank.
    #[must_use]
    pub fn missing_parameter(&self) -> Option<&'static str> {
        self.name
            .required_parameters()
            .iter()
            .copied()
            .find(|key| self.param(key).map_or(true, |value| value.trim().is_empty()))
    }

    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.param(key) == Some("true")
    }

    /// Short human-readable label, e.g. `[read_file for 'src/lib.rs']`.
    #[must_use]
    pub fn describe(&self) -> String {
        let subject = match self.name {
            ActionName::ExecuteCommand => self.param("command"),
            ActionName::SearchFiles => self.param("expression"),
            ActionName::AskFollowupQuestion | ActionName::AttemptCompletion => None,
            _ => self.param("path"),
        };
        match subject {
            Some(subject) => format!("[{} for '{}']", self.name, subject),
            None => format!("[{}]", self.name),
        }
    }
}

/// One unit of parsed model output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentSegment {
    Text { value: String, partial: bool },
    Action(ActionInvocation),
}

impl ContentSegment {
    #[must_use]
    pub fn is_partial(&self) -> bool {
        match self {
            Self::Text { partial, .. } => *partial,
            Self::Action(invocation) => invocation.partial,
        }
    }

    #[must_use]
    pub fn as_action(&self) -> Option<&ActionInvocation> {
        match self {
            Self::Action(invocation) => Some(invocation),
            Self::Text { .. } => None,
        }
    }
}
