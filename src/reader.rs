//! Pull-based reader yielding one chunk's bytes at a time.

use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use crate::error::UploadError;
use crate::range::DataRange;

/// Reads the chunks of a file in range order, one buffer resident at a time.
///
/// The range list is immutable; progress is an explicit cursor so a reader
/// can be reopened at any index after a restart. Not safe to share across
/// tasks; each transfer unit opens its own.
pub struct ChunkReader {
    file: File,
    ranges: Vec<DataRange>,
    cursor: usize,
}

impl ChunkReader {
    pub async fn open(path: &Path, ranges: Vec<DataRange>) -> Result<Self, UploadError> {
        let file = File::open(path).await?;
        Ok(Self { file, ranges, cursor: 0 })
    }

    /// Resume from a given range index.
    pub fn seek_to(mut self, cursor: usize) -> Self {
        self.cursor = cursor.min(self.ranges.len());
        self
    }

    pub fn remaining(&self) -> usize {
        self.ranges.len() - self.cursor
    }

    /// Read the next range's bytes. Returns `None` once all ranges are
    /// consumed; calling again stays `None`.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, UploadError> {
        let Some(range) = self.ranges.get(self.cursor).copied() else {
            return Ok(None);
        };

        self.file.seek(SeekFrom::Start(range.lower)).await?;
        let mut buffer = vec![0u8; range.len() as usize];
        self.file.read_exact(&mut buffer).await?;

        self.cursor += 1;
        Ok(Some(buffer))
    }
}
