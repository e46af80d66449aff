use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use checkpoint_store::{Checkpoint, CheckpointStore, CheckpointStoreError};
use serde_json::Value;

use crate::state::{CheckpointPayload, Generation};

enum WriterCommand {
    Save(Value),
    Flush(Sender<()>),
}

/// Serializes checkpoint writes for one task on a background thread.
///
/// Writes are fire-and-forget; failures are logged. [`Checkpointer::flush`]
/// blocks until every queued write has been attempted. Once the task's
/// generation is superseded queued writes are dropped.
pub struct Checkpointer {
    sender: Option<Sender<WriterCommand>>,
    worker: Option<JoinHandle<()>>,
}

impl Checkpointer {
    pub fn spawn(
        store: Box<dyn CheckpointStore>,
        task_id: impl Into<String>,
        generation: Generation,
    ) -> Result<Self, String> {
        let task_id = task_id.into();
        let (sender, receiver) = mpsc::channel();
        let worker = thread::Builder::new()
            .name(format!("coding-agent-checkpoint-{task_id}"))
            .spawn(move || write_loop(store, &task_id, &generation, &receiver))
            .map_err(|error| format!("Failed to spawn checkpoint writer: {error}"))?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub fn save(&self, payload: &CheckpointPayload) {
        let value = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(error) => {
                tracing::error!(%error, "failed to serialize checkpoint payload");
                return;
            }
        };
        self.send(WriterCommand::Save(value));
    }

    pub fn flush(&self) {
        let (done, wait) = mpsc::channel();
        if self.send(WriterCommand::Flush(done)) {
            let _ = wait.recv();
        }
    }

    fn send(&self, command: WriterCommand) -> bool {
        match &self.sender {
            Some(sender) => sender.send(command).is_ok(),
            None => false,
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn write_loop(
    mut store: Box<dyn CheckpointStore>,
    task_id: &str,
    generation: &Generation,
    receiver: &Receiver<WriterCommand>,
) {
    for command in receiver {
        match command {
            WriterCommand::Save(payload) => {
                if !generation.is_current() {
                    tracing::debug!(task_id, "dropping checkpoint of superseded task");
                    continue;
                }
                match store.save(task_id, payload) {
                    Ok(checkpoint) => {
                        tracing::debug!(task_id, sequence = checkpoint.sequence, "checkpoint saved");
                    }
                    Err(error) => tracing::error!(task_id, %error, "checkpoint write failed"),
                }
            }
            WriterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Store handle whose clones share one underlying store.
///
/// Lets a caller keep reading a store after handing it to a [`Checkpointer`].
#[derive(Debug, Default)]
pub struct SharedStore<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for SharedStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: CheckpointStore> SharedStore<S> {
    #[must_use]
    pub fn new(store: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(store)),
        }
    }

    pub fn with<R>(&self, read: impl FnOnce(&S) -> R) -> R {
        read(&lock_unpoisoned(&self.inner))
    }
}

impl<S: CheckpointStore> CheckpointStore for SharedStore<S> {
    fn save(&mut self, task_id: &str, payload: Value) -> Result<Checkpoint, CheckpointStoreError> {
        lock_unpoisoned(&self.inner).save(task_id, payload)
    }

    fn latest(&self, task_id: &str) -> Result<Option<Checkpoint>, CheckpointStoreError> {
        lock_unpoisoned(&self.inner).latest(task_id)
    }

    fn claim(&mut self, task_id: &str) -> Result<(), CheckpointStoreError> {
        lock_unpoisoned(&self.inner).claim(task_id)
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
