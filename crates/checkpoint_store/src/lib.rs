mod error;
mod memory;
mod paths;
mod schema;
mod store;

pub use error::CheckpointStoreError;
pub use memory::MemoryCheckpointStore;
pub use paths::{checkpoint_file_name, checkpoint_root, lock_file_name, validate_task_id};
pub use schema::{Checkpoint, CheckpointHeader, CheckpointRecord, RecordType};
pub use store::{now_rfc3339, CheckpointStore, FileCheckpointStore};
