//! Sequential byte accumulator with chunk-boundary detection
//!
//! Callers append arbitrary-sized writes, then drain every complete
//! `chunk_size` span as it becomes available. The short remainder is only
//! taken at the end, once the declared total (if any) has been reached.

use blobseal_core::{BlobsealError, BlobsealResult};

#[derive(Debug, Clone)]
pub struct ChunkBuffer {
    chunk_size: usize,
    buf: Vec<u8>,
    declared_size: Option<u64>,
    total_written: u64,
}

impl ChunkBuffer {
    /// Buffer for a stream of unknown length.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            buf: Vec::new(),
            declared_size: None,
            total_written: 0,
        }
    }

    /// Buffer for a stream of exactly `declared_size` bytes.
    pub fn with_declared_size(chunk_size: usize, declared_size: u64) -> Self {
        Self {
            declared_size: Some(declared_size),
            ..Self::new(chunk_size)
        }
    }

    /// Append `bytes`. Fails without buffering anything if the declared total
    /// would be exceeded.
    pub fn write(&mut self, bytes: &[u8]) -> BlobsealResult<()> {
        let attempted = self.total_written + bytes.len() as u64;
        if let Some(declared) = self.declared_size {
            if attempted > declared {
                return Err(BlobsealError::DataBiggerThanDeclared {
                    declared,
                    attempted,
                });
            }
        }
        self.buf.extend_from_slice(bytes);
        self.total_written = attempted;
        Ok(())
    }

    pub fn has_full_chunk(&self) -> bool {
        self.buf.len() >= self.chunk_size
    }

    pub fn number_of_full_chunks(&self) -> usize {
        self.buf.len() / self.chunk_size
    }

    /// The `i`-th complete chunk currently buffered.
    pub fn full_chunk(&self, i: usize) -> Option<&[u8]> {
        if i >= self.number_of_full_chunks() {
            return None;
        }
        let start = i * self.chunk_size;
        Some(&self.buf[start..start + self.chunk_size])
    }

    /// Evict every complete chunk, keeping the partial tail.
    pub fn free_full_chunks(&mut self) {
        let full = self.number_of_full_chunks() * self.chunk_size;
        self.buf.drain(..full);
    }

    /// Drain whatever is buffered (at most one partial chunk after
    /// `free_full_chunks`).
    pub fn read_chunk(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// True once exactly the declared number of bytes has been written.
    pub fn is_fully_filled(&self) -> bool {
        self.declared_size == Some(self.total_written)
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn declared_size(&self) -> Option<u64> {
        self.declared_size
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
