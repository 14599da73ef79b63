//! Error taxonomy for the upload engine.

use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum UploadError {
    /// Empty files cannot be chunked.
    #[error("file is empty, nothing to upload")]
    FileTooSmall,

    /// File is over the supported size.
    #[error("file of {size} bytes exceeds the supported maximum of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    /// Unable to read file system metadata.
    #[error("unable to read file attributes: {0}")]
    UnableToReadFileAttributes(#[source] std::io::Error),

    /// Local read failed for a chunk.
    #[error("local read failed: {0}")]
    Io(#[from] std::io::Error),

    /// Retryable transport failure (connection, timeout, 5xx).
    #[error("network error: {0}")]
    Network(String),

    /// Remote service rejected the upload, retrying will not help.
    #[error("remote service rejected the upload: {status} {message}")]
    FatalRemote { status: u16, message: String },

    /// Free space is below the hard floor required for chunk staging.
    #[error("not enough local space: {available} bytes available, {required} required")]
    NotEnoughLocalSpace { available: u64, required: u64 },

    /// The task was cancelled by an explicit request.
    #[error("task cancelled")]
    TaskCancelled,

    /// In-flight work was torn down to be resumed later.
    #[error("task rescheduled before completion")]
    TaskRescheduled,

    #[error("no task with id {0}")]
    TaskNotFound(String),

    /// Task store failure (open, read or write).
    #[error("task store error: {0}")]
    Store(String),

    /// The scheduler worker is gone, no commands can be processed.
    #[error("upload scheduler is shut down")]
    QueueShutDown,
}

impl From<TransportError> for UploadError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::Network(message) => UploadError::Network(message),
            TransportError::Fatal { status, message } => UploadError::FatalRemote { status, message },
        }
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for UploadError {
    fn from(value: Box<dyn std::error::Error + Send + Sync>) -> Self {
        UploadError::Store(value.to_string())
    }
}
