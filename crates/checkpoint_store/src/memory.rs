use std::collections::HashMap;

use serde_json::Value;

use crate::error::CheckpointStoreError;
use crate::paths::validate_task_id;
use crate::schema::Checkpoint;
use crate::store::{now_rfc3339, CheckpointStore};

/// In-process store for tests and ephemeral runs.
#[derive(Debug, Default, Clone)]
pub struct MemoryCheckpointStore {
    tasks: HashMap<String, Vec<Checkpoint>>,
}

impl MemoryCheckpointStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn history(&self, task_id: &str) -> &[Checkpoint] {
        self.tasks.get(task_id).map_or(&[], Vec::as_slice)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn save(&mut self, task_id: &str, payload: Value) -> Result<Checkpoint, CheckpointStoreError> {
        validate_task_id(task_id)?;
        let history = self.tasks.entry(task_id.to_string()).or_default();
        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            sequence: history.last().map_or(1, |last| last.sequence + 1),
            created_at: now_rfc3339()?,
            payload,
        };
        history.push(checkpoint.clone());
        Ok(checkpoint)
    }

    fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>, CheckpointStoreError> {
        Ok(self.history(task_id).last().cloned())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sequences_are_per_task() {
        let mut store = MemoryCheckpointStore::new();
        store.save("a", json!(1)).expect("save a1");
        store.save("b", json!(2)).expect("save b1");
        let second = store.save("a", json!(3)).expect("save a2");

        assert_eq!(second.sequence, 2);
        assert_eq!(store.history("b").len(), 1);
        assert_eq!(
            store.latest("a").expect("latest").map(|c| c.payload),
            Some(json!(3))
        );
        assert_eq!(store.latest("missing").expect("latest"), None);
    }
}
