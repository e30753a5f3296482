use serde::{Deserialize, Serialize};

use crate::common::ChunkId;
use crate::error::{GfsError, Result};

/// Default chunk size is 1MB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Fixed chunk size and the limits derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkGeometry {
    pub chunk_size: u64,
}

/// A slice of a file-level write that lands inside a single chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WritePiece<'a> {
    pub chunk_index: u64,
    pub offset: u64,
    pub data: &'a [u8],
}

impl ChunkGeometry {
    pub fn new(chunk_size: u64) -> ChunkGeometry {
        ChunkGeometry { chunk_size }
    }

    /// Largest single write or record append. A quarter chunk keeps the
    /// space wasted when a chunk is sealed early small.
    pub fn max_write(&self) -> u64 {
        self.chunk_size / 4
    }

    /// Map a file offset to (chunk index, offset within chunk).
    pub fn locate(&self, file_offset: u64) -> (u64, u64) {
        (file_offset / self.chunk_size, file_offset % self.chunk_size)
    }

    /// Split a file-level write so that no piece crosses a chunk boundary or
    /// exceeds `max_write`. A write running past the largest file offset is
    /// refused whole.
    pub fn split_write<'a>(&self, file_offset: u64, data: &'a [u8]) -> Result<Vec<WritePiece<'a>>> {
        let len = data.len() as u64;
        if file_offset.checked_add(len).is_none() {
            return Err(GfsError::WriteTooLarge { len, max: u64::MAX - file_offset });
        }

        let mut pieces = vec![];
        let max = self.max_write().max(1) as usize;
        let mut start = 0usize;

        while start < data.len() {
            let (chunk_index, offset) = self.locate(file_offset + start as u64);
            let room = (self.chunk_size - offset) as usize;
            let end = std::cmp::min(start + std::cmp::min(room, max), data.len());
            pieces.push(WritePiece { chunk_index, offset, data: &data[start..end] });
            start = end;
        }

        Ok(pieces)
    }
}

impl Default for ChunkGeometry {
    fn default() -> Self {
        ChunkGeometry::new(DEFAULT_CHUNK_SIZE)
    }
}

/// Metadata a chunkserver keeps for every chunk it stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub id: ChunkId,
    /// crc32 over the used bytes.
    pub checksum: u32,
    pub used: u64,
    /// Set once a write would have crossed the chunk boundary. A full chunk
    /// takes no more mutations.
    pub full: bool,
}
