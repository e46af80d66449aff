use std::path::{Path, PathBuf};

use crate::error::CheckpointStoreError;

pub const CHECKPOINT_DIR: [&str; 2] = [".agent", "checkpoints"];

#[must_use]
pub fn checkpoint_root(workspace: &Path) -> PathBuf {
    workspace.join(CHECKPOINT_DIR[0]).join(CHECKPOINT_DIR[1])
}

#[must_use]
pub fn checkpoint_file_name(task_id: &str) -> String {
    format!("{task_id}.jsonl")
}

#[must_use]
pub fn lock_file_name(task_id: &str) -> String {
    format!("{task_id}.lock")
}

/// Task ids become file names, so they are restricted to a conservative set.
pub fn validate_task_id(task_id: &str) -> Result<(), CheckpointStoreError> {
    let valid = !task_id.is_empty()
        && task_id.len() <= 128
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !task_id.starts_with('.');

    if valid {
        Ok(())
    } else {
        Err(CheckpointStoreError::InvalidTaskId {
            task_id: task_id.to_string(),
        })
    }
}
