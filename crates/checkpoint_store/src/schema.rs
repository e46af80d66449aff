use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Task,
    Checkpoint,
}

/// First line of every checkpoint stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointHeader {
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub version: u32,
    pub task_id: String,
    pub created_at: String,
    pub workspace: String,
}

impl CheckpointHeader {
    #[must_use]
    pub fn v1(
        task_id: impl Into<String>,
        created_at: impl Into<String>,
        workspace: impl Into<String>,
    ) -> Self {
        Self {
            record_type: RecordType::Task,
            version: 1,
            task_id: task_id.into(),
            created_at: created_at.into(),
            workspace: workspace.into(),
        }
    }
}

/// One persisted checkpoint line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointRecord {
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub id: String,
    pub sequence: u64,
    pub created_at: String,
    pub payload: Value,
}

/// A checkpoint as handed back to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub id: String,
    pub task_id: String,
    /// Starts at 1 and increases by one per save.
    pub sequence: u64,
    pub created_at: String,
    pub payload: Value,
}

impl Checkpoint {
    pub(crate) fn from_record(task_id: &str, record: CheckpointRecord) -> Self {
        Self {
            id: record.id,
            task_id: task_id.to_string(),
            sequence: record.sequence,
            created_at: record.created_at,
            payload: record.payload,
        }
    }

    pub(crate) fn to_record(&self) -> CheckpointRecord {
        CheckpointRecord {
            record_type: RecordType::Checkpoint,
            id: self.id.clone(),
            sequence: self.sequence,
            created_at: self.created_at.clone(),
            payload: self.payload.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub(crate) enum JsonLine {
    Header(CheckpointHeader),
    Record(CheckpointRecord),
}
