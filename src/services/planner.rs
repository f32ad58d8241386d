//! Chunk boundary planning.
//!
//! `plan_chunks` answers "how would an object of this length be split" up
//! front; `ChunkSplitter` makes the same cuts incrementally while an upload
//! streams in and its length is not known yet.

use bytes::{Bytes, BytesMut};
use std::ops::Range;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
}

/// Chunk lengths for an object of `total_len` bytes.
///
/// Every length is at most `max_chunk`, the last one takes the remainder, and
/// the lengths sum to `total_len`. An empty object plans a single empty chunk.
pub fn plan_chunks(total_len: u64, max_chunk: u64) -> Result<Vec<u64>, PlanError> {
    if max_chunk == 0 {
        return Err(PlanError::ZeroChunkSize);
    }
    if total_len == 0 {
        return Ok(vec![0]);
    }

    let full = total_len / max_chunk;
    let rest = total_len % max_chunk;
    let mut lengths = vec![max_chunk; full as usize];
    if rest > 0 {
        lengths.push(rest);
    }
    Ok(lengths)
}

/// Byte ranges matching `plan_chunks`, for slicing a buffered payload.
pub fn chunk_ranges(total_len: u64, max_chunk: u64) -> Result<Vec<Range<u64>>, PlanError> {
    let mut start = 0;
    Ok(plan_chunks(total_len, max_chunk)?
        .into_iter()
        .map(|len| {
            let range = start..start + len;
            start += len;
            range
        })
        .collect())
}

/// Objects shorter than one full chunk are stored inline under the root key.
pub fn is_inline(total_len: u64, max_chunk: u64) -> bool {
    total_len < max_chunk
}

/// Cuts a byte stream into `max_chunk`-sized pieces as data arrives.
#[derive(Debug)]
pub struct ChunkSplitter {
    max_chunk: usize,
    buffer: BytesMut,
}

impl ChunkSplitter {
    pub fn new(max_chunk: usize) -> Result<Self, PlanError> {
        if max_chunk == 0 {
            return Err(PlanError::ZeroChunkSize);
        }
        Ok(Self {
            max_chunk,
            buffer: BytesMut::new(),
        })
    }

    /// Feed more input, returning every chunk that is now complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);
        let mut ready = Vec::new();
        while self.buffer.len() >= self.max_chunk {
            ready.push(self.buffer.split_to(self.max_chunk).freeze());
        }
        ready
    }

    /// Bytes still buffered, shorter than one full chunk.
    pub fn finish(self) -> Bytes {
        self.buffer.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M: u64 = 8;

    #[test]
    fn plans_match_boundary_lengths() {
        assert_eq!(plan_chunks(0, M).unwrap(), vec![0]);
        assert_eq!(plan_chunks(1, M).unwrap(), vec![1]);
        assert_eq!(plan_chunks(M - 1, M).unwrap(), vec![M - 1]);
        assert_eq!(plan_chunks(M, M).unwrap(), vec![M]);
        assert_eq!(plan_chunks(M + 1, M).unwrap(), vec![M, 1]);
        assert_eq!(plan_chunks(3 * M, M).unwrap(), vec![M, M, M]);
        assert_eq!(plan_chunks(3 * M + 1, M).unwrap(), vec![M, M, M, 1]);
    }

    #[test]
    fn plans_sum_to_total_and_respect_ceiling() {
        for total in 0..100u64 {
            for max in 1..12u64 {
                let plan = plan_chunks(total, max).unwrap();
                assert_eq!(plan.iter().sum::<u64>(), total);
                assert!(plan.iter().all(|len| *len <= max));
                if total > 0 {
                    assert!(plan.iter().all(|len| *len > 0));
                }
            }
        }
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        assert_eq!(plan_chunks(10, 0), Err(PlanError::ZeroChunkSize));
        assert!(ChunkSplitter::new(0).is_err());
    }

    #[test]
    fn ranges_are_contiguous() {
        let ranges = chunk_ranges(20, M).unwrap();
        assert_eq!(ranges, vec![0..8, 8..16, 16..20]);
    }

    #[test]
    fn splitter_agrees_with_plan_for_uneven_input() {
        let payload: Vec<u8> = (0..(3 * M + 1) as u8).collect();
        let mut splitter = ChunkSplitter::new(M as usize).unwrap();
        let mut chunks = Vec::new();
        for piece in payload.chunks(3) {
            chunks.extend(splitter.push(piece));
        }
        let rest = splitter.finish();
        if !rest.is_empty() {
            chunks.push(rest);
        }

        let lengths: Vec<u64> = chunks.iter().map(|c| c.len() as u64).collect();
        assert_eq!(lengths, plan_chunks(payload.len() as u64, M).unwrap());
        assert_eq!(chunks.concat(), payload);
    }

    #[test]
    fn inline_threshold() {
        assert!(is_inline(0, M));
        assert!(is_inline(M - 1, M));
        assert!(!is_inline(M, M));
    }
}
