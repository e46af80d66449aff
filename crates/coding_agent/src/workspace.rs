use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use glob::Pattern;
use ignore::WalkBuilder;
use regex::Regex;
use wait_timeout::ChildExt;

use crate::config::AgentConfig;

const DEFAULT_COMMAND_MAX_OUTPUT_BYTES: usize = 100 * 1024;
const LIST_FILES_LIMIT: usize = 200;
const SEARCH_RESULTS_LIMIT: usize = 300;
const SEARCH_LINE_MAX_CHARS: usize = 500;
const COMMAND_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub ok: bool,
    pub content: String,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            ok: true,
            content: content.into(),
        }
    }

    pub fn fail(content: impl Into<String>) -> Self {
        Self {
            ok: false,
            content: content.into(),
        }
    }
}

/// File and process access confined to one workspace root.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    command_timeout: Duration,
    command_max_output_bytes: usize,
    read_max_bytes: usize,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, config: &AgentConfig) -> Result<Self, String> {
        let root = root.into();
        let canonical_root = root
            .canonicalize()
            .map_err(|err| format!("Failed to resolve workspace root: {err}"))?;

        if !canonical_root.is_dir() {
            return Err("Workspace root must be a directory".to_string());
        }

        Ok(Self {
            root: canonical_root,
            command_timeout: Duration::from_secs(config.command_timeout_sec),
            command_max_output_bytes: DEFAULT_COMMAND_MAX_OUTPUT_BYTES,
            read_max_bytes: config.read_max_bytes,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn list_files(&self, path: &str, recursive: bool) -> ToolOutput {
        let dir = match self.resolve_existing_path(path) {
            Ok(path) => path,
            Err(error) => return ToolOutput::fail(error),
        };
        if !dir.is_dir() {
            return ToolOutput::fail(format!("Not a directory: {}", self.relative_display(&dir)));
        }

        let mut builder = WalkBuilder::new(&dir);
        builder.hidden(false).filter_entry(|entry| entry.file_name() != ".git");
        if !recursive {
            builder.max_depth(Some(1));
        }

        let mut entries = Vec::new();
        for entry in builder.build().flatten() {
            if entry.depth() == 0 {
                continue;
            }
            let is_dir = entry.file_type().is_some_and(|kind| kind.is_dir());
            let mut display = self.relative_display(entry.path());
            if is_dir {
                display.push('/');
            }
            entries.push(display);
        }
        entries.sort();

        if entries.is_empty() {
            return ToolOutput::ok("No files found.");
        }

        let total = entries.len();
        entries.truncate(LIST_FILES_LIMIT);
        let mut content = entries.join("\n");
        if total > LIST_FILES_LIMIT {
            content.push_str(&format!(
                "\n\n[truncated: showing {LIST_FILES_LIMIT} of {total} entries]"
            ));
        }
        ToolOutput::ok(content)
    }

    pub fn search_files(&self, path: &str, expression: &str, file_pattern: Option<&str>) -> ToolOutput {
        let regex = match Regex::new(expression) {
            Ok(regex) => regex,
            Err(error) => return ToolOutput::fail(format!("Invalid regex: {error}")),
        };
        let pattern = match file_pattern.map(str::trim).filter(|glob| !glob.is_empty()) {
            Some(glob) => match Pattern::new(glob) {
                Ok(pattern) => Some(pattern),
                Err(error) => return ToolOutput::fail(format!("Invalid file pattern: {error}")),
            },
            None => None,
        };
        let start = match self.resolve_existing_path(path) {
            Ok(path) => path,
            Err(error) => return ToolOutput::fail(error),
        };

        let mut results = Vec::new();
        let mut truncated = false;
        'files: for entry in WalkBuilder::new(&start).build().flatten() {
            if !entry.file_type().is_some_and(|kind| kind.is_file()) {
                continue;
            }
            let relative = self.relative_display(entry.path());
            if let Some(pattern) = &pattern {
                let name_matches = entry
                    .path()
                    .file_name()
                    .is_some_and(|name| pattern.matches(&name.to_string_lossy()));
                if !name_matches && !pattern.matches(&relative) {
                    continue;
                }
            }
            let Ok(content) = fs::read_to_string(entry.path()) else {
                continue;
            };

            for (index, line) in content.lines().enumerate() {
                if !regex.is_match(line) {
                    continue;
                }
                if results.len() == SEARCH_RESULTS_LIMIT {
                    truncated = true;
                    break 'files;
                }
                let line: String = line.chars().take(SEARCH_LINE_MAX_CHARS).collect();
                results.push(format!("{relative}:{}:{line}", index + 1));
            }
        }

        if results.is_empty() {
            return ToolOutput::ok("Found 0 results.");
        }

        let mut content = format!("Found {} results.\n\n{}", results.len(), results.join("\n"));
        if truncated {
            content.push_str(&format!(
                "\n\n[truncated: showing the first {SEARCH_RESULTS_LIMIT} results]"
            ));
        }
        ToolOutput::ok(content)
    }

    pub fn read_file(&self, path: &str) -> ToolOutput {
        let resolved = match self.resolve_existing_path(path) {
            Ok(path) => path,
            Err(error) => return ToolOutput::fail(error),
        };

        let bytes = match fs::read(&resolved) {
            Ok(bytes) => bytes,
            Err(error) => {
                return ToolOutput::fail(format!(
                    "Failed to read file {}: {error}",
                    self.relative_display(&resolved)
                ));
            }
        };

        if bytes.len() > self.read_max_bytes {
            return ToolOutput::fail(format!(
                "File exceeds max read size ({} bytes > {} bytes)",
                bytes.len(),
                self.read_max_bytes
            ));
        }

        match String::from_utf8(bytes) {
            Ok(content) => ToolOutput::ok(content),
            Err(_) => ToolOutput::fail("File is not valid UTF-8 text".to_string()),
        }
    }

    /// Current body of a file about to be edited; empty when it does not exist.
    pub fn read_for_edit(&self, path: &str) -> Result<String, String> {
        let resolved = self.resolve_write_path(path)?;
        if !resolved.exists() {
            return Ok(String::new());
        }
        let output = self.read_file(path);
        if output.ok {
            Ok(output.content)
        } else {
            Err(output.content)
        }
    }

    pub fn write_file(&self, path: &str, content: &str) -> ToolOutput {
        let resolved = match self.resolve_write_path(path) {
            Ok(path) => path,
            Err(error) => return ToolOutput::fail(error),
        };

        if let Some(parent) = resolved.parent() {
            if let Err(error) = fs::create_dir_all(parent) {
                return ToolOutput::fail(format!(
                    "Failed to create parent directories {}: {error}",
                    parent.display()
                ));
            }

            let canonical_parent = match parent.canonicalize() {
                Ok(path) => path,
                Err(error) => {
                    return ToolOutput::fail(format!(
                        "Failed to resolve write parent {}: {error}",
                        parent.display()
                    ));
                }
            };

            if let Err(error) = self.ensure_inside_workspace(&canonical_parent) {
                return ToolOutput::fail(error);
            }
        }

        if let Err(error) = fs::write(&resolved, content) {
            return ToolOutput::fail(format!(
                "Failed to write file {}: {error}",
                self.relative_display(&resolved)
            ));
        }

        ToolOutput::ok(format!("Wrote {}", self.relative_display(&resolved)))
    }

    /// Runs `command` with `bash -lc` in the workspace root.
    ///
    /// The child is killed when the timeout elapses or `cancel` is raised.
    pub fn run_command(&self, command: &str, cancel: &AtomicBool) -> ToolOutput {
        let mut child = match Command::new("bash")
            .arg("-lc")
            .arg(command)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(error) => {
                return ToolOutput::fail(format!("Failed to launch bash command: {error}"));
            }
        };

        let stdout = spawn_pipe_reader(child.stdout.take());
        let stderr = spawn_pipe_reader(child.stderr.take());

        let timeout_sec = self.command_timeout.as_secs();
        let (ending, status) = match wait_for_exit(&mut child, self.command_timeout, cancel) {
            Ok(waited) => waited,
            Err(error) => {
                let _ = child.kill();
                return ToolOutput::fail(format!("Failed waiting for bash command: {error}"));
            }
        };

        let stdout = join_pipe_reader(stdout);
        let stderr = join_pipe_reader(stderr);

        let status_label = match ending {
            CommandEnding::Exited => format_exit_status(status),
            CommandEnding::TimedOut => format!("timeout after {timeout_sec}s"),
            CommandEnding::Cancelled => "cancelled".to_string(),
        };

        let content = truncate_to_byte_limit(
            format!(
                "status: {status_label}\nstdout:\n{}\nstderr:\n{}",
                String::from_utf8_lossy(&stdout),
                String::from_utf8_lossy(&stderr)
            ),
            self.command_max_output_bytes,
        );

        ToolOutput {
            ok: ending == CommandEnding::Exited && status.success(),
            content,
        }
    }

    fn resolve_existing_path(&self, path: &str) -> Result<PathBuf, String> {
        if path.trim().is_empty() {
            return Err("Path must not be empty".to_string());
        }

        let candidate = self.absolute_candidate(path);
        let canonical = candidate
            .canonicalize()
            .map_err(|error| format!("Failed to resolve path {}: {error}", candidate.display()))?;

        self.ensure_inside_workspace(&canonical)?;
        Ok(canonical)
    }

    fn resolve_write_path(&self, path: &str) -> Result<PathBuf, String> {
        if path.trim().is_empty() {
            return Err("Path must not be empty".to_string());
        }

        let candidate = self.absolute_candidate(path);
        let parent = candidate.parent().ok_or_else(|| {
            format!(
                "Path {} has no parent directory and cannot be written safely",
                candidate.display()
            )
        })?;

        let anchor = canonicalize_existing_ancestor(parent)?;
        self.ensure_inside_workspace(&anchor)?;
        if candidate.exists() {
            let canonical = candidate.canonicalize().map_err(|error| {
                format!("Failed to resolve path {}: {error}", candidate.display())
            })?;
            self.ensure_inside_workspace(&canonical)?;
        }

        Ok(candidate)
    }

    fn absolute_candidate(&self, path: &str) -> PathBuf {
        let path = Path::new(path.trim());
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn ensure_inside_workspace(&self, canonical_path: &Path) -> Result<(), String> {
        if canonical_path.starts_with(&self.root) {
            Ok(())
        } else {
            Err(format!(
                "Path escapes workspace root: {}",
                canonical_path.display()
            ))
        }
    }

    fn relative_display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .map(|relative| relative.display().to_string())
            .unwrap_or_else(|_| path.display().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommandEnding {
    Exited,
    TimedOut,
    Cancelled,
}

fn wait_for_exit(
    child: &mut Child,
    timeout: Duration,
    cancel: &AtomicBool,
) -> std::io::Result<(CommandEnding, ExitStatus)> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.wait_timeout(COMMAND_POLL_INTERVAL)? {
            return Ok((CommandEnding::Exited, status));
        }

        let ending = if cancel.load(Ordering::SeqCst) {
            CommandEnding::Cancelled
        } else if Instant::now() >= deadline {
            CommandEnding::TimedOut
        } else {
            continue;
        };

        let _ = child.kill();
        let status = child.wait()?;
        return Ok((ending, status));
    }
}

fn spawn_pipe_reader(pipe: Option<impl Read + Send + 'static>) -> Option<JoinHandle<Vec<u8>>> {
    let mut pipe = pipe?;
    thread::Builder::new()
        .name("coding-agent-command-pipe".to_string())
        .spawn(move || {
            let mut bytes = Vec::new();
            let _ = pipe.read_to_end(&mut bytes);
            bytes
        })
        .ok()
}

fn join_pipe_reader(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|reader| reader.join().ok())
        .unwrap_or_default()
}

pub(crate) fn truncate_to_byte_limit(content: String, max_bytes: usize) -> String {
    if content.len() <= max_bytes {
        return content;
    }

    let mut cutoff = max_bytes.min(content.len());
    while cutoff > 0 && !content.is_char_boundary(cutoff) {
        cutoff -= 1;
    }

    let mut truncated = content[..cutoff].to_string();
    truncated.push_str("\n[truncated]");
    truncated
}

fn canonicalize_existing_ancestor(path: &Path) -> Result<PathBuf, String> {
    for ancestor in path.ancestors() {
        if ancestor.exists() {
            return ancestor.canonicalize().map_err(|error| {
                format!("Failed to resolve path {}: {error}", ancestor.display())
            });
        }
    }

    Err(format!(
        "No existing ancestor found for path {}",
        path.display()
    ))
}

fn format_exit_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit_code={code}"),
        None => "exit_code=terminated_by_signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_respects_char_boundaries() {
        let truncated = truncate_to_byte_limit("héllo".to_string(), 2);
        assert_eq!(truncated, "h\n[truncated]");
        assert_eq!(truncate_to_byte_limit("short".to_string(), 10), "short");
    }
}
