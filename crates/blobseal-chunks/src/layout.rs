//! Fixed-size chunk layout arithmetic
//!
//! A file of `F` plaintext bytes split into chunks of `C` bytes has
//! `ceil(F / C)` chunks; every chunk except possibly the last is full. Each
//! chunk grows by its PKCS#7 padding plus the 48-byte HMAC+IV header once
//! encrypted, so encrypted chunk `i` starts at `i * encrypted_chunk_size(C)`.
//!
//! The shorter final chunk is accounted with its real encrypted size
//! everywhere (declared upload sizes, corruption checks, slice clamping).

use std::ops::RangeInclusive;

use blobseal_core::{encrypted_chunk_size, BlobsealError, BlobsealResult, ChunkIndex, HASH_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    chunk_size: u64,
}

impl ChunkLayout {
    pub fn new(chunk_size: u64) -> BlobsealResult<Self> {
        if chunk_size == 0 {
            return Err(BlobsealError::Config("chunk_size must be positive".into()));
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Encrypted size of one full chunk
    pub fn encrypted_chunk_size(&self) -> u64 {
        encrypted_chunk_size(self.chunk_size)
    }

    pub fn number_of_chunks(&self, plain_size: u64) -> u64 {
        plain_size.div_ceil(self.chunk_size)
    }

    /// Index of the chunk holding plaintext byte `pos`
    pub fn chunk_index(&self, pos: u64) -> ChunkIndex {
        pos / self.chunk_size
    }

    /// Plaintext offset of the first byte of chunk `index`
    pub fn chunk_offset(&self, index: ChunkIndex) -> u64 {
        index * self.chunk_size
    }

    /// Offset of chunk `index` in the encrypted file
    pub fn encrypted_offset(&self, index: ChunkIndex) -> u64 {
        index * self.encrypted_chunk_size()
    }

    /// Offset of chunk `index`'s entry in the checksum blob
    pub fn checksum_offset(&self, index: ChunkIndex) -> u64 {
        index * HASH_SIZE as u64
    }

    /// Plaintext length of chunk `index` in a file of `plain_size` bytes
    /// (0 past the end).
    pub fn plain_chunk_len(&self, index: ChunkIndex, plain_size: u64) -> u64 {
        plain_size
            .saturating_sub(self.chunk_offset(index))
            .min(self.chunk_size)
    }

    /// Total encrypted size, including the real size of a short final chunk.
    pub fn encrypted_file_size(&self, plain_size: u64) -> u64 {
        let full = plain_size / self.chunk_size;
        let rest = plain_size % self.chunk_size;
        let mut size = full * self.encrypted_chunk_size();
        if rest > 0 {
            size += encrypted_chunk_size(rest);
        }
        size
    }

    /// Size of the checksum blob for a file of `plain_size` bytes.
    pub fn checksum_size(&self, plain_size: u64) -> u64 {
        self.number_of_chunks(plain_size) * HASH_SIZE as u64
    }

    /// Chunk indices touched by `[pos, pos + len)`, or `None` for an empty range.
    pub fn chunk_span(&self, pos: u64, len: u64) -> Option<RangeInclusive<ChunkIndex>> {
        if len == 0 {
            return None;
        }
        Some(self.chunk_index(pos)..=self.chunk_index(pos + len - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zero_chunk_size_rejected() {
        assert!(ChunkLayout::new(0).is_err());
    }

    #[test]
    fn test_2500_bytes_in_1k_chunks() {
        let layout = ChunkLayout::new(1024).unwrap();
        assert_eq!(layout.number_of_chunks(2500), 3);
        assert_eq!(layout.plain_chunk_len(0, 2500), 1024);
        assert_eq!(layout.plain_chunk_len(1, 2500), 1024);
        assert_eq!(layout.plain_chunk_len(2, 2500), 452);
        assert_eq!(layout.plain_chunk_len(3, 2500), 0);
        assert_eq!(layout.encrypted_file_size(2500), 2 * 1088 + 512);
        assert_eq!(layout.checksum_size(2500), 96);
    }

    #[test]
    fn test_empty_file() {
        let layout = ChunkLayout::new(1024).unwrap();
        assert_eq!(layout.number_of_chunks(0), 0);
        assert_eq!(layout.encrypted_file_size(0), 0);
        assert_eq!(layout.checksum_size(0), 0);
    }

    #[test]
    fn test_chunk_span() {
        let layout = ChunkLayout::new(1024).unwrap();
        assert_eq!(layout.chunk_span(2000, 600), Some(1..=2));
        assert_eq!(layout.chunk_span(1024, 1024), Some(1..=1));
        assert_eq!(layout.chunk_span(5, 0), None);
    }

    proptest! {
        /// The closed-form size equals the sum of real per-chunk encrypted sizes.
        #[test]
        fn encrypted_size_is_sum_of_chunks(file_size in 0u64..200_000, chunk_size in 1u64..5000) {
            let layout = ChunkLayout::new(chunk_size).unwrap();
            let chunks = layout.number_of_chunks(file_size);
            prop_assert_eq!(chunks, file_size.div_ceil(chunk_size));

            let summed: u64 = (0..chunks)
                .map(|i| encrypted_chunk_size(layout.plain_chunk_len(i, file_size)))
                .sum();
            prop_assert_eq!(layout.encrypted_file_size(file_size), summed);

            let plain: u64 = (0..chunks).map(|i| layout.plain_chunk_len(i, file_size)).sum();
            prop_assert_eq!(plain, file_size);
        }
    }
}
