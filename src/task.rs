//! Upload task and per-chunk state.

use std::path::PathBuf;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::range::DataRange;

/// Why a chunk (and possibly its task) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkErrorKind {
    /// Retryable transport failure.
    Network,
    /// Remote rejection that retrying cannot fix.
    Fatal,
    /// Local read failure.
    Io,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkStatus {
    NotStarted,
    InFlight,
    Uploaded { remote_id: String },
    Failed { kind: ChunkErrorKind },
}

impl ChunkStatus {
    /// Split into the status column and the remote id column.
    pub fn db_encode(&self) -> (&'static str, Option<&str>) {
        match self {
            ChunkStatus::NotStarted => ("not_started", None),
            ChunkStatus::InFlight => ("in_flight", None),
            ChunkStatus::Uploaded { remote_id } => ("uploaded", Some(remote_id)),
            ChunkStatus::Failed { kind: ChunkErrorKind::Network } => ("failed_network", None),
            ChunkStatus::Failed { kind: ChunkErrorKind::Fatal } => ("failed_fatal", None),
            ChunkStatus::Failed { kind: ChunkErrorKind::Io } => ("failed_io", None),
        }
    }

    pub fn db_decode(status: &str, remote_id: Option<String>) -> Self {
        match status {
            "uploaded" => ChunkStatus::Uploaded {
                remote_id: remote_id.unwrap_or_default(),
            },
            "in_flight" => ChunkStatus::InFlight,
            "failed_network" => ChunkStatus::Failed { kind: ChunkErrorKind::Network },
            "failed_fatal" => ChunkStatus::Failed { kind: ChunkErrorKind::Fatal },
            "failed_io" => ChunkStatus::Failed { kind: ChunkErrorKind::Io },
            _ => ChunkStatus::NotStarted,
        }
    }
}

/// State of one chunk of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkState {
    pub index: u64,
    pub range: DataRange,
    pub status: ChunkStatus,
    pub retry_count: u32,
    pub last_attempt_at: Option<i64>,
}

impl ChunkState {
    pub fn new(index: u64, range: DataRange) -> Self {
        Self {
            index,
            range,
            status: ChunkStatus::NotStarted,
            retry_count: 0,
            last_attempt_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Splitting,
    Uploading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Splitting => write!(f, "splitting"),
            TaskStatus::Uploading => write!(f, "uploading"),
            TaskStatus::Paused => write!(f, "paused"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl From<String> for TaskStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "splitting" => TaskStatus::Splitting,
            "uploading" => TaskStatus::Uploading,
            "paused" => TaskStatus::Paused,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            _ => TaskStatus::Pending,
        }
    }
}

/// One file's upload across all its chunks.
///
/// Owned exclusively by the scheduler worker; transfer units never touch it
/// directly, they report outcomes back over the command channel.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: String,
    pub file_path: PathBuf,
    pub file_name: String,
    pub file_size: u64,
    pub file_mtime: i64,
    pub user_id: i64,
    pub drive_id: i64,
    pub parent_folder_id: i64,
    pub queue: String,
    pub status: TaskStatus,
    pub last_error: Option<String>,
    pub ranges: Vec<DataRange>,
    pub chunks: Vec<ChunkState>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl UploadTask {
    /// Move to `next` if the state machine allows it. Invalid transitions
    /// are ignored and logged; the caller's view of the task may be stale.
    pub fn try_transition(&mut self, next: TaskStatus) -> bool {
        if !transition_allowed(self.status, next) {
            warn!(
                "task_transition_rejected: {} {} -> {}",
                self.id, self.status, next
            );
            return false;
        }
        self.status = next;
        true
    }

    /// Install computed ranges and a fresh chunk state per range.
    pub fn attach_ranges(&mut self, ranges: Vec<DataRange>) {
        self.chunks = ranges
            .iter()
            .enumerate()
            .map(|(index, range)| ChunkState::new(index as u64, *range))
            .collect();
        self.ranges = ranges;
    }

    pub fn chunk_mut(&mut self, index: u64) -> Option<&mut ChunkState> {
        self.chunks.get_mut(index as usize)
    }

    pub fn total_chunks(&self) -> u64 {
        self.ranges.len() as u64
    }

    /// A task is complete exactly when every chunk made it to the remote.
    pub fn all_uploaded(&self) -> bool {
        !self.chunks.is_empty()
            && self
                .chunks
                .iter()
                .all(|chunk| matches!(chunk.status, ChunkStatus::Uploaded { .. }))
    }

    /// Finalize may only be issued for a task still uploading whose chunks
    /// have all landed.
    pub fn can_finalize(&self) -> bool {
        self.status == TaskStatus::Uploading && self.all_uploaded()
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|chunk| matches!(chunk.status, ChunkStatus::Uploaded { .. }))
            .map(|chunk| chunk.range.len())
            .sum()
    }

    pub fn next_not_started(&self) -> Option<u64> {
        self.chunks
            .iter()
            .find(|chunk| chunk.status == ChunkStatus::NotStarted)
            .map(|chunk| chunk.index)
    }

    pub fn in_flight_count(&self) -> usize {
        self.chunks
            .iter()
            .filter(|chunk| chunk.status == ChunkStatus::InFlight)
            .count()
    }

    /// Convert in-flight chunks back to not-started so they can be resumed
    /// cleanly. Returns how many were reset.
    pub fn reset_in_flight(&mut self) -> usize {
        let mut reset = 0;
        for chunk in &mut self.chunks {
            if chunk.status == ChunkStatus::InFlight {
                chunk.status = ChunkStatus::NotStarted;
                reset += 1;
            }
        }
        reset
    }

    /// Give failed chunks another run. Returns how many were reset.
    pub fn reset_failed(&mut self) -> usize {
        let mut reset = 0;
        for chunk in &mut self.chunks {
            if matches!(chunk.status, ChunkStatus::Failed { .. }) {
                chunk.status = ChunkStatus::NotStarted;
                reset += 1;
            }
        }
        reset
    }
}

fn transition_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    use TaskStatus::*;
    match (from, to) {
        (Pending, Splitting) => true,
        (Splitting, Uploading) => true,
        (Uploading, Paused) | (Paused, Uploading) => true,
        (Uploading, Completed) => true,
        // Retry re-enters scheduling from a failed terminal record.
        (Failed, Uploading) => true,
        // Any live state can fail or be cancelled.
        (Pending | Splitting | Uploading | Paused, Failed) => true,
        (Pending | Splitting | Uploading | Paused, Cancelled) => true,
        _ => false,
    }
}
