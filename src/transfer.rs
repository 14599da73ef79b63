//! Transfer unit owning exactly one chunk of one task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use sha2::{Digest, Sha256};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::events::{EventBus, UploadEvent};
use crate::free_space::{FreeSpaceGuard, SpaceCheck};
use crate::range::DataRange;
use crate::reader::ChunkReader;
use crate::transport::{ChunkPayload, ChunkTransport, TransportError};

/// How a transfer unit ended. Applied to shared state by the scheduler
/// worker; the unit itself mutates nothing outside its own buffer.
#[derive(Debug)]
pub(crate) enum ChunkOutcome {
    Uploaded { remote_id: String, retries: u32 },
    NetworkFailed { retries: u32, message: String },
    Fatal { status: u16, message: String },
    Io { message: String },
    SpaceExhausted { available: u64, required: u64 },
    Cancelled,
}

/// The slice of `UploadConfig` a unit needs.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TransferSettings {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub chunk_timeout: Duration,
}

impl From<&UploadConfig> for TransferSettings {
    fn from(config: &UploadConfig) -> Self {
        Self {
            max_retries: config.max_chunk_retries,
            backoff_base: config.retry_backoff_base,
            chunk_timeout: config.chunk_timeout,
        }
    }
}

pub(crate) struct ChunkTransferUnit {
    pub task_id: String,
    pub chunk_index: u64,
    pub range: DataRange,
    pub file_path: PathBuf,
    pub total_chunks: u64,
}

impl ChunkTransferUnit {
    /// Read the chunk, verify local space, transmit with bounded retries.
    ///
    /// Cancellation is honored at every await point; a cancelled unit
    /// reports `Cancelled` and the worker resets its chunk to not-started.
    pub(crate) async fn run(
        self,
        transport: Arc<dyn ChunkTransport>,
        settings: TransferSettings,
        guard: Arc<FreeSpaceGuard>,
        events: EventBus,
        cancel: CancellationToken,
    ) -> ChunkOutcome {
        match guard.check(&self.file_path) {
            SpaceCheck::Exhausted { available, required } => {
                warn!(
                    "chunk_space_exhausted: {} chunk={} available={} required={}",
                    self.task_id, self.chunk_index, available, required
                );
                return ChunkOutcome::SpaceExhausted { available, required };
            }
            SpaceCheck::Low { available } => {
                events.emit(UploadEvent::LowLocalSpace { available });
            }
            SpaceCheck::Ok => {}
        }

        let bytes = tokio::select! {
            _ = cancel.cancelled() => return ChunkOutcome::Cancelled,
            read = self.read_chunk() => match read {
                Ok(bytes) => bytes,
                Err(error) => return ChunkOutcome::Io { message: error.to_string() },
            },
        };

        let chunk_hash = hex::encode(Sha256::digest(&bytes));
        let mut attempt: u32 = 0;
        loop {
            let payload = ChunkPayload {
                session_id: self.task_id.clone(),
                chunk_index: self.chunk_index,
                total_chunks: self.total_chunks,
                chunk_hash: chunk_hash.clone(),
                bytes: bytes.clone(),
            };

            let sent = tokio::select! {
                _ = cancel.cancelled() => return ChunkOutcome::Cancelled,
                sent = timeout(settings.chunk_timeout, transport.send_chunk(payload)) => sent,
            };

            let message = match sent {
                Ok(Ok(remote)) => {
                    debug!(
                        "chunk_uploaded: {} chunk={} retries={}",
                        self.task_id, self.chunk_index, attempt
                    );
                    return ChunkOutcome::Uploaded {
                        remote_id: remote.remote_id,
                        retries: attempt,
                    };
                }
                Ok(Err(TransportError::Fatal { status, message })) => {
                    return ChunkOutcome::Fatal { status, message };
                }
                Ok(Err(TransportError::Network(message))) => message,
                Err(_) => format!(
                    "chunk transmit timed out after {:?}",
                    settings.chunk_timeout
                ),
            };

            if attempt >= settings.max_retries {
                return ChunkOutcome::NetworkFailed {
                    retries: attempt,
                    message,
                };
            }

            let backoff = settings.backoff_base * 2u32.saturating_pow(attempt);
            debug!(
                "chunk_retry: {} chunk={} attempt={} backoff={:?} error={}",
                self.task_id, self.chunk_index, attempt, backoff, message
            );
            tokio::select! {
                _ = cancel.cancelled() => return ChunkOutcome::Cancelled,
                _ = sleep(backoff) => {}
            }
            attempt += 1;
        }
    }

    async fn read_chunk(&self) -> Result<Vec<u8>, UploadError> {
        let mut reader = ChunkReader::open(&self.file_path, vec![self.range]).await?;
        reader
            .next_chunk()
            .await?
            .ok_or_else(|| UploadError::Io(std::io::Error::other("range list was empty")))
    }
}
