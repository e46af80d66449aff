use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub const CONFIG_PATH_ENV_VAR: &str = "CODING_AGENT_CONFIG_PATH";
pub const SYSTEM_INSTRUCTIONS_ENV_VAR: &str = "CODING_AGENT_SYSTEM_INSTRUCTIONS";

pub const DEFAULT_MAX_CONSECUTIVE_MISTAKES: u32 = 3;
pub const DEFAULT_MAX_CONSECUTIVE_AUTO_APPROVALS: u32 = 20;
pub const DEFAULT_COMMAND_TIMEOUT_SEC: u64 = 30;
pub const DEFAULT_READ_MAX_BYTES: usize = 200 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid config value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Which actions may run without asking the human.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AutoApprovalSettings {
    pub read_files: bool,
    pub edit_files: bool,
    /// Commands the model marked `requires_approval=false`.
    pub execute_safe_commands: bool,
    pub execute_all_commands: bool,
    pub max_consecutive_auto_approvals: u32,
}

impl Default for AutoApprovalSettings {
    fn default() -> Self {
        Self {
            read_files: false,
            edit_files: false,
            execute_safe_commands: false,
            execute_all_commands: false,
            max_consecutive_auto_approvals: DEFAULT_MAX_CONSECUTIVE_AUTO_APPROVALS,
        }
    }
}

impl AutoApprovalSettings {
    /// Everything auto-approved, as with `--auto-approve`.
    #[must_use]
    pub fn all() -> Self {
        Self {
            read_files: true,
            edit_files: true,
            execute_safe_commands: true,
            execute_all_commands: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub max_consecutive_mistakes: u32,
    pub auto_approval: AutoApprovalSettings,
    pub command_timeout_sec: u64,
    pub read_max_bytes: usize,
    /// Defaults to `<workspace>/.agent/checkpoints`.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_consecutive_mistakes: DEFAULT_MAX_CONSECUTIVE_MISTAKES,
            auto_approval: AutoApprovalSettings::default(),
            command_timeout_sec: DEFAULT_COMMAND_TIMEOUT_SEC,
            read_max_bytes: DEFAULT_READ_MAX_BYTES,
            checkpoint_dir: None,
        }
    }
}

impl AgentConfig {
    /// Loads the file named by `CODING_AGENT_CONFIG_PATH`, or defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV_VAR)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        match path {
            Some(path) => Self::from_path(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw).map_err(|error| match error {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_consecutive_mistakes == 0 {
            return Err(positive("max_consecutive_mistakes"));
        }
        if self.auto_approval.max_consecutive_auto_approvals == 0 {
            return Err(positive("auto_approval.max_consecutive_auto_approvals"));
        }
        if self.command_timeout_sec == 0 {
            return Err(positive("command_timeout_sec"));
        }
        if self.read_max_bytes == 0 {
            return Err(positive("read_max_bytes"));
        }
        Ok(())
    }

    #[must_use]
    pub fn checkpoint_dir_for(&self, workspace: &Path) -> PathBuf {
        match &self.checkpoint_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => workspace.join(dir),
            None => checkpoint_store::checkpoint_root(workspace),
        }
    }
}

fn positive(field: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        field,
        reason: "must be > 0".to_string(),
    }
}

pub const DEFAULT_SYSTEM_INSTRUCTIONS: &str =
    "You are a careful coding agent working inside a single workspace. Follow user requests exactly, inspect files before changing them, and fail explicitly when constraints cannot be satisfied.";

pub fn system_instructions_from_env() -> String {
    let from_env = std::env::var(SYSTEM_INSTRUCTIONS_ENV_VAR).ok();
    sanitize_system_instructions(from_env)
}

fn sanitize_system_instructions(raw: Option<String>) -> String {
    let Some(value) = raw else {
        return DEFAULT_SYSTEM_INSTRUCTIONS.to_string();
    };

    let trimmed = value.trim();
    if trimmed.is_empty() {
        DEFAULT_SYSTEM_INSTRUCTIONS.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Base instructions followed by the action protocol the parser understands.
#[must_use]
pub fn compose_instructions(base: &str) -> String {
    format!("{base}\n\n{ACTION_PROTOCOL}")
}

const ACTION_PROTOCOL: &str = r#"Action protocol:
- Use exactly one action per message, then wait for its result.
- Write an action like this, one <param> per parameter:
<calls>
<call name="read_file">
<param name="path">src/lib.rs</param>
</call>
</calls>
- Actions:
  list_files(path, recursive): list a directory.
  search_files(path, expression, file_pattern?): regex search with line numbers.
  read_file(path): read a UTF-8 file.
  write_to_file(path, content): write a whole file.
  replace_in_file(path, diff): edit a file with SEARCH/REPLACE blocks:
------- SEARCH
exact existing lines
=======
replacement lines
+++++++ REPLACE
  execute_command(command, requires_approval): run a shell command in the workspace.
  ask_followup_question(question, options?): ask the user for information.
  attempt_completion(result, command?): present the final result."#;
