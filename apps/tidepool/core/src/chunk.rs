use std::ops::Range;

use crate::domain::{CellIndex, Domain, DomainError};

/// Splits the domain into fixed-size contiguous chunks, the unit of on-demand
/// state transfer. The last chunk is shorter when the domain size is not a
/// multiple of the chunk size; every range handed out is clipped to the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPartitioner {
    domain: Domain,
    chunk_size: u64,
}

impl ChunkPartitioner {
    pub fn new(domain: Domain, chunk_size: u64) -> Result<Self, DomainError> {
        if chunk_size == 0 {
            return Err(DomainError::EmptyChunk);
        }
        Ok(Self { domain, chunk_size })
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> u64 {
        self.domain.size().div_ceil(self.chunk_size)
    }

    pub fn chunk_of(&self, index: CellIndex) -> u64 {
        index / self.chunk_size
    }

    /// `[k * chunk_size, min((k + 1) * chunk_size, N))`. Chunks at or beyond the
    /// end of the domain yield an empty range.
    pub fn range_of(&self, chunk: u64) -> Range<CellIndex> {
        let size = self.domain.size();
        let start = chunk.saturating_mul(self.chunk_size).min(size);
        let end = chunk
            .saturating_add(1)
            .saturating_mul(self.chunk_size)
            .min(size);
        start..end
    }

    /// Signed variant used for wire requests; negative chunks are empty.
    pub fn range_of_raw(&self, chunk: i64) -> Range<CellIndex> {
        match u64::try_from(chunk) {
            Ok(chunk) => self.range_of(chunk),
            Err(_) => 0..0,
        }
    }

    /// Chunk indices overlapping `range` after clipping it to the domain.
    pub fn chunks_covering(&self, range: Range<CellIndex>) -> Range<u64> {
        let end = range.end.min(self.domain.size());
        if range.start >= end {
            return 0..0;
        }
        self.chunk_of(range.start)..self.chunk_of(end - 1) + 1
    }
}
