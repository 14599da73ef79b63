//! Engine configuration with the defaults used in production.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Default sub-queue for user-triggered uploads.
pub const GLOBAL_QUEUE: &str = "global";
/// Sub-queue for photo-library background uploads.
pub const PHOTO_QUEUE: &str = "photo";

fn default_queues() -> Vec<String> {
    vec![GLOBAL_QUEUE.to_string(), PHOTO_QUEUE.to_string()]
}

/// Size policy used to split a file into ranges.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChunkPolicy {
    /// Smallest chunk the remote API accepts (1 MiB).
    pub chunk_min_size: u64,
    /// Largest chunk this client is willing to stage in memory (50 MiB).
    pub chunk_max_size_client: u64,
    /// Largest chunk the server accepts (1 GiB).
    pub chunk_max_size_server: u64,
    /// Chunk count the splitter aims for on large files.
    pub optimal_chunk_count: u64,
    /// Hard cap on chunks per file.
    pub max_total_chunks: u64,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            chunk_min_size: 1024 * 1024,
            chunk_max_size_client: 50 * 1024 * 1024,
            chunk_max_size_server: 1024 * 1024 * 1024,
            optimal_chunk_count: 200,
            max_total_chunks: 10_000,
        }
    }
}

impl ChunkPolicy {
    /// The lower of the client and server ceilings is authoritative.
    pub fn effective_max_chunk_size(&self) -> u64 {
        self.chunk_max_size_client.min(self.chunk_max_size_server)
    }

    /// Largest file the engine will accept.
    pub fn max_file_size(&self) -> u64 {
        self.max_total_chunks * self.effective_max_chunk_size()
    }
}

/// Engine-wide settings. `Default` matches production values; hosts may
/// deserialize overrides from their own config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub chunk_policy: ChunkPolicy,
    /// Retries per chunk after the first attempt.
    pub max_chunk_retries: u32,
    /// First backoff delay, doubled after every failed attempt.
    #[serde(with = "duration_ms")]
    pub retry_backoff_base: Duration,
    /// Per-attempt transmit timeout.
    #[serde(with = "duration_ms")]
    pub chunk_timeout: Duration,
    /// Terminal records older than this are purged on startup.
    #[serde(with = "duration_ms")]
    pub stale_task_max_age: Duration,
    /// Named sub-queues, first entry is the default for enqueue.
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,
    /// Location of the task database.
    pub database_path: PathBuf,
    /// Buffered events per subscriber before the oldest are dropped.
    pub event_capacity: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_policy: ChunkPolicy::default(),
            max_chunk_retries: 3,
            retry_backoff_base: Duration::from_millis(250),
            chunk_timeout: Duration::from_secs(90),
            stale_task_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            queues: default_queues(),
            database_path: PathBuf::from("uploads.db"),
            event_capacity: 256,
        }
    }
}

impl UploadConfig {
    pub fn default_queue(&self) -> &str {
        self.queues.first().map(String::as_str).unwrap_or(GLOBAL_QUEUE)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
