//! Events emitted to the UI and other collaborators.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::task::TaskStatus;

/// Progress of one file, reported after each chunk lands.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkProgress {
    pub task_id: String,
    pub chunk_index: u64,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub speed: f64, // bytes per second
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusChanged {
    pub task_id: String,
    pub status: TaskStatus,
    pub error: Option<String>,
}

/// User-facing failure notification material.
#[derive(Debug, Clone, Serialize)]
pub struct UploadFailed {
    pub task_id: String,
    pub file_name: String,
    pub parent_folder_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum UploadEvent {
    ChunkProgress(ChunkProgress),
    TaskStatusChanged(TaskStatusChanged),
    UploadFailed(UploadFailed),
    /// The volume is close to the minimum required for chunk staging.
    LowLocalSpace { available: u64 },
    /// A sub-queue has no more work.
    QueueEmpty { queue: String },
}

/// Fan-out bus for engine events. Emission never blocks and never fails;
/// subscribers that fall behind lose the oldest events (broadcast
/// semantics), which is acceptable for progress reporting.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<UploadEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: UploadEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }
}
