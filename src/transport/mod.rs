//! Abstract transport sending chunks to the remote storage service.

use async_trait::async_trait;
use thiserror::Error;

mod http;

pub use http::HttpChunkTransport;

/// One chunk's worth of data plus the identifiers the remote service needs
/// to file it under the right upload session.
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub session_id: String,
    /// 0-based internally; implementations number chunks from 1 on the wire.
    pub chunk_index: u64,
    pub total_chunks: u64,
    /// Hex SHA-256 of `bytes`.
    pub chunk_hash: String,
    pub bytes: Vec<u8>,
}

/// Identifier the remote service assigned to a stored chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChunk {
    pub remote_id: String,
}

/// The assembled remote file returned by finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub remote_id: String,
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Worth retrying: connection trouble, timeout, server-side hiccup.
    #[error("network: {0}")]
    Network(String),

    /// Not worth retrying: quota exceeded, permission revoked, bad session.
    #[error("rejected by remote: {status} {message}")]
    Fatal { status: u16, message: String },
}

/// Sends chunk bytes and assembles them remotely. Implementations must be
/// safe to call concurrently for disjoint chunks of the same session.
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    async fn send_chunk(&self, payload: ChunkPayload) -> Result<RemoteChunk, TransportError>;

    /// Ask the remote service to assemble all uploaded chunks into a file.
    /// Callers only invoke this once every chunk of the session succeeded.
    async fn finalize(&self, session_id: &str, total_chunks: u64)
        -> Result<RemoteFile, TransportError>;
}
