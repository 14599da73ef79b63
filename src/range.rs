//! Splits a file byte length into the ranges uploaded as chunks.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::ChunkPolicy;
use crate::error::UploadError;

/// A closed interval of byte offsets into a file. `lower == upper` is a
/// one-byte range; offset 0 is the first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRange {
    pub lower: u64,
    pub upper: u64,
}

impl DataRange {
    pub fn new(lower: u64, upper: u64) -> Self {
        debug_assert!(lower <= upper);
        Self { lower, upper }
    }

    /// Number of bytes covered, both ends inclusive. Never zero.
    pub fn len(&self) -> u64 {
        self.upper - self.lower + 1
    }
}

/// Read a file's byte length and modification time.
///
/// The mtime is kept with persisted tasks so a resumed upload can detect the
/// file changed underneath it.
pub async fn file_byte_size(path: &Path) -> Result<(u64, i64), UploadError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(UploadError::UnableToReadFileAttributes)?;
    let mtime = metadata
        .modified()
        .map(|t| {
            t.duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64
        })
        .unwrap_or(0);
    Ok((metadata.len(), mtime))
}

/// Chunk size the remote API prefers for a given file size: aim for
/// `optimal_chunk_count` chunks, clamped to the policy bounds and never
/// larger than the file itself.
pub fn preferred_chunk_size(file_size: u64, policy: &ChunkPolicy) -> u64 {
    let potential = file_size / policy.optimal_chunk_count;
    let chunk_size = potential
        .max(policy.chunk_min_size)
        .min(policy.effective_max_chunk_size());
    chunk_size.min(file_size)
}

/// Compute the ordered ranges covering `[0, file_size - 1]`.
///
/// Full chunks of the preferred size come first; a shorter trailing range
/// absorbs the remainder. Deterministic for a given size and policy.
pub fn build_ranges(file_size: u64, policy: &ChunkPolicy) -> Result<Vec<DataRange>, UploadError> {
    if file_size == 0 {
        return Err(UploadError::FileTooSmall);
    }
    if file_size >= policy.max_file_size() {
        return Err(UploadError::FileTooLarge {
            size: file_size,
            max: policy.max_file_size(),
        });
    }

    let chunk_size = preferred_chunk_size(file_size, policy);
    let full_chunks = file_size / chunk_size;
    let remainder = file_size % chunk_size;

    let mut ranges = Vec::with_capacity(full_chunks as usize + 1);
    for index in 0..full_chunks {
        let lower = index * chunk_size;
        ranges.push(DataRange::new(lower, lower + chunk_size - 1));
    }
    if remainder != 0 {
        ranges.push(DataRange::new(full_chunks * chunk_size, file_size - 1));
    }

    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_exact_cover(ranges: &[DataRange], file_size: u64) {
        assert!(!ranges.is_empty());
        assert_eq!(ranges[0].lower, 0);
        assert_eq!(ranges.last().unwrap().upper, file_size - 1);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].upper + 1, pair[1].lower, "ranges must be gapless");
        }
        let total: u64 = ranges.iter().map(DataRange::len).sum();
        assert_eq!(total, file_size);
    }

    #[test]
    fn one_byte_file_is_a_single_range() {
        let ranges = build_ranges(1, &ChunkPolicy::default()).unwrap();
        assert_eq!(ranges, vec![DataRange::new(0, 0)]);
    }

    #[test]
    fn empty_file_is_rejected() {
        assert!(matches!(
            build_ranges(0, &ChunkPolicy::default()),
            Err(UploadError::FileTooSmall)
        ));
    }

    #[test]
    fn oversized_file_is_rejected_with_no_partial_output() {
        let policy = ChunkPolicy::default();
        assert!(matches!(
            build_ranges(policy.max_file_size(), &policy),
            Err(UploadError::FileTooLarge { .. })
        ));
        assert!(matches!(
            build_ranges(policy.max_file_size() + 1, &policy),
            Err(UploadError::FileTooLarge { .. })
        ));
    }

    #[test]
    fn small_file_is_one_chunk() {
        let policy = ChunkPolicy::default();
        // Below the minimum chunk size the whole file fits in one range.
        let ranges = build_ranges(100, &policy).unwrap();
        assert_eq!(ranges, vec![DataRange::new(0, 99)]);
    }

    #[test]
    fn remainder_lands_in_a_trailing_range() {
        let policy = ChunkPolicy::default();
        let chunk = preferred_chunk_size(policy.chunk_min_size * 3 + 100, &policy);
        let file_size = chunk * 3 + 100;
        let ranges = build_ranges(file_size, &policy).unwrap();

        assert_eq!(ranges.len(), 4);
        for range in &ranges[..3] {
            assert_eq!(range.len(), chunk);
        }
        assert_eq!(ranges[3].len(), 100);
        assert_exact_cover(&ranges, file_size);
    }

    #[test]
    fn large_files_target_the_optimal_chunk_count() {
        let policy = ChunkPolicy::default();
        // 400 MiB / 200 chunks = 2 MiB per chunk, inside the bounds.
        let file_size = 400 * 1024 * 1024;
        let ranges = build_ranges(file_size, &policy).unwrap();
        assert_eq!(ranges.len(), policy.optimal_chunk_count as usize);
        assert_exact_cover(&ranges, file_size);
    }

    #[test]
    fn preferred_size_saturates_at_the_client_ceiling() {
        let policy = ChunkPolicy::default();
        let huge = policy.chunk_max_size_client * policy.optimal_chunk_count * 4;
        assert_eq!(
            preferred_chunk_size(huge, &policy),
            policy.effective_max_chunk_size()
        );
    }

    #[test]
    fn ranges_are_deterministic() {
        let policy = ChunkPolicy::default();
        for file_size in [1, 4096, 1024 * 1024 + 1, 333 * 1024 * 1024 + 17] {
            let first = build_ranges(file_size, &policy).unwrap();
            let second = build_ranges(file_size, &policy).unwrap();
            assert_eq!(first, second);
            assert_exact_cover(&first, file_size);
        }
    }
}
