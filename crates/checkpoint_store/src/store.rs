use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::CheckpointStoreError;
use crate::paths::{checkpoint_file_name, lock_file_name, validate_task_id};
use crate::schema::{Checkpoint, CheckpointHeader, JsonLine, RecordType};

/// Persistence for task checkpoints, keyed by task id.
///
/// Payloads are opaque to the store. `save` appends; `latest` returns the
/// most recent checkpoint of a task, if any.
pub trait CheckpointStore: Send {
    fn save(&mut self, task_id: &str, payload: Value) -> Result<Checkpoint, CheckpointStoreError>;

    fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>, CheckpointStoreError>;

    /// Claims the task's stream before any save. Fails when another writer
    /// holds it.
    fn claim(&mut self, task_id: &str) -> Result<(), CheckpointStoreError> {
        validate_task_id(task_id)
    }
}

/// Current UTC time formatted as RFC3339.
pub fn now_rfc3339() -> Result<String, CheckpointStoreError> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(CheckpointStoreError::ClockFormat)
}

/// Exclusive claim on one task's checkpoint stream.
///
/// Holds an OS advisory lock on `<task_id>.lock`. The lock goes away with the
/// handle, including when the owning process dies, so a stale lock file left
/// by a crash never blocks a resumed task.
#[derive(Debug)]
struct TaskLock {
    _file: File,
}

impl TaskLock {
    fn acquire(task_id: &str, path: PathBuf) -> Result<Self, CheckpointStoreError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| {
                CheckpointStoreError::io("opening checkpoint lock file", &path, source)
            })?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(CheckpointStoreError::LockContended {
                    task_id: task_id.to_string(),
                    path,
                });
            }
            Err(TryLockError::Error(source)) => {
                return Err(CheckpointStoreError::io(
                    "locking checkpoint lock file",
                    path,
                    source,
                ));
            }
        }

        // Owner pid, for humans inspecting the directory.
        let _ = file
            .set_len(0)
            .and_then(|()| writeln!(file, "{}", std::process::id()));
        Ok(Self { _file: file })
    }
}

#[derive(Debug)]
struct TaskStream {
    _lock: TaskLock,
    file: File,
    last_sequence: u64,
}

/// JSONL checkpoint store: one `<task_id>.jsonl` file per task under `root`.
///
/// The first save for a task claims its lock file, so two stores never append
/// to the same stream. Reading with `latest` needs no lock.
#[derive(Debug)]
pub struct FileCheckpointStore {
    root: PathBuf,
    workspace: PathBuf,
    streams: HashMap<String, TaskStream>,
}

impl FileCheckpointStore {
    /// Opens (creating if needed) a store rooted at `root` for `workspace`.
    pub fn open(root: &Path, workspace: &Path) -> Result<Self, CheckpointStoreError> {
        fs::create_dir_all(root).map_err(|source| {
            CheckpointStoreError::io("creating checkpoint directory", root, source)
        })?;

        Ok(Self {
            root: root.to_path_buf(),
            workspace: workspace.to_path_buf(),
            streams: HashMap::new(),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn task_path(&self, task_id: &str) -> PathBuf {
        self.root.join(checkpoint_file_name(task_id))
    }

    /// Reads and validates every checkpoint of `task_id`, oldest first.
    pub fn history(&self, task_id: &str) -> Result<Vec<Checkpoint>, CheckpointStoreError> {
        validate_task_id(task_id)?;
        let path = self.task_path(task_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_stream(&path, task_id)
    }

    fn stream(&mut self, task_id: &str) -> Result<&mut TaskStream, CheckpointStoreError> {
        match self.streams.entry(task_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let stream = open_stream(&self.root, &self.workspace, task_id)?;
                Ok(entry.insert(stream))
            }
        }
    }
}

fn open_stream(
    root: &Path,
    workspace: &Path,
    task_id: &str,
) -> Result<TaskStream, CheckpointStoreError> {
    let lock = TaskLock::acquire(task_id, root.join(lock_file_name(task_id)))?;
    let path = root.join(checkpoint_file_name(task_id));

    let last_sequence = if path.exists() {
        read_stream(&path, task_id)?
            .last()
            .map_or(0, |checkpoint| checkpoint.sequence)
    } else {
        let header = CheckpointHeader::v1(task_id, now_rfc3339()?, workspace.display().to_string());
        let line = serde_json::to_string(&header)
            .map_err(|source| CheckpointStoreError::json_serialize(&path, source))?;
        let mut file = File::create(&path)
            .map_err(|source| CheckpointStoreError::io("creating checkpoint file", &path, source))?;
        writeln!(file, "{line}").map_err(|source| {
            CheckpointStoreError::io("writing checkpoint header", &path, source)
        })?;
        0
    };

    let file = OpenOptions::new()
        .append(true)
        .open(&path)
        .map_err(|source| {
            CheckpointStoreError::io("opening checkpoint file for append", &path, source)
        })?;

    Ok(TaskStream {
        _lock: lock,
        file,
        last_sequence,
    })
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&mut self, task_id: &str, payload: Value) -> Result<Checkpoint, CheckpointStoreError> {
        validate_task_id(task_id)?;
        let path = self.task_path(task_id);
        let created_at = now_rfc3339()?;
        let stream = self.stream(task_id)?;

        let checkpoint = Checkpoint {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            sequence: stream.last_sequence + 1,
            created_at,
            payload,
        };
        let line = serde_json::to_string(&checkpoint.to_record())
            .map_err(|source| CheckpointStoreError::json_serialize(&path, source))?;

        writeln!(stream.file, "{line}")
            .and_then(|()| stream.file.flush())
            .map_err(|source| CheckpointStoreError::io("appending checkpoint", &path, source))?;
        stream.last_sequence = checkpoint.sequence;

        Ok(checkpoint)
    }

    fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>, CheckpointStoreError> {
        Ok(self.history(task_id)?.pop())
    }

    fn claim(&mut self, task_id: &str) -> Result<(), CheckpointStoreError> {
        validate_task_id(task_id)?;
        self.stream(task_id).map(|_| ())
    }
}

fn read_stream(path: &Path, task_id: &str) -> Result<Vec<Checkpoint>, CheckpointStoreError> {
    let file = File::open(path)
        .map_err(|source| CheckpointStoreError::io("opening checkpoint file", path, source))?;
    let reader = BufReader::new(file);

    let mut header_seen = false;
    let mut checkpoints: Vec<Checkpoint> = Vec::new();

    for (line_index, line_result) in reader.lines().enumerate() {
        let line_number = line_index + 1;
        let line =
            line_result.map_err(|source| CheckpointStoreError::io_line(path, line_number, source))?;
        if line.trim().is_empty() {
            continue;
        }
        let parsed = serde_json::from_str::<JsonLine>(&line)
            .map_err(|source| CheckpointStoreError::json_line(path, line_number, source))?;

        if !header_seen {
            let JsonLine::Header(header) = parsed else {
                return Err(CheckpointStoreError::InvalidHeaderRecord {
                    path: path.to_path_buf(),
                    line: line_number,
                });
            };
            validate_header(path, line_number, task_id, &header)?;
            header_seen = true;
            continue;
        }

        let record = match parsed {
            JsonLine::Record(record) if record.record_type == RecordType::Checkpoint => record,
            _ => {
                return Err(CheckpointStoreError::InvalidCheckpointRecord {
                    path: path.to_path_buf(),
                    line: line_number,
                })
            }
        };
        validate_rfc3339(path, line_number, "created_at", &record.created_at)?;

        let expected = checkpoints.last().map_or(1, |last| last.sequence + 1);
        if record.sequence != expected {
            return Err(CheckpointStoreError::SequenceGap {
                path: path.to_path_buf(),
                line: line_number,
                expected,
                found: record.sequence,
            });
        }
        checkpoints.push(Checkpoint::from_record(task_id, record));
    }

    if !header_seen {
        return Err(CheckpointStoreError::MissingHeader {
            path: path.to_path_buf(),
        });
    }

    Ok(checkpoints)
}

fn validate_header(
    path: &Path,
    line_number: usize,
    task_id: &str,
    header: &CheckpointHeader,
) -> Result<(), CheckpointStoreError> {
    if header.record_type != RecordType::Task {
        return Err(CheckpointStoreError::InvalidHeaderRecord {
            path: path.to_path_buf(),
            line: line_number,
        });
    }
    if header.version != 1 {
        return Err(CheckpointStoreError::UnsupportedVersion {
            path: path.to_path_buf(),
            line: line_number,
            found: header.version,
        });
    }
    if header.task_id != task_id {
        return Err(CheckpointStoreError::TaskMismatch {
            path: path.to_path_buf(),
            expected: task_id.to_string(),
            found: header.task_id.clone(),
        });
    }
    validate_rfc3339(path, line_number, "created_at", &header.created_at)
}

fn validate_rfc3339(
    path: &Path,
    line_number: usize,
    field: &'static str,
    value: &str,
) -> Result<(), CheckpointStoreError> {
    if OffsetDateTime::parse(value, &Rfc3339).is_err() {
        return Err(CheckpointStoreError::InvalidTimestamp {
            path: path.to_path_buf(),
            line: line_number,
            field,
            value: value.to_string(),
        });
    }

    Ok(())
}
