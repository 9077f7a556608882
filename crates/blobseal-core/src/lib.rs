//! blobseal-core: shared types, configuration schema and the error type used
//! by every blobseal crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::{BlobsealConfig, EngineConfig};
pub use error::{BlobsealError, BlobsealResult, ErrorKind};
pub use types::{ChunkIndex, CipherType, FileId, HandleId, RequestId, Version};

/// Size of a chunk HMAC / hash-list entry in bytes
pub const HASH_SIZE: usize = 32;

/// Size of the per-chunk AES-CBC initialisation vector
pub const IV_SIZE: usize = 16;

/// AES block size, used for PKCS#7 padding arithmetic
pub const BLOCK_SIZE: u64 = 16;

/// Fixed per-chunk overhead: HMAC + IV
pub const CHUNK_OVERHEAD: u64 = (HASH_SIZE + IV_SIZE) as u64;

/// Size in bytes of a chunk with `plain_len` plaintext bytes once encrypted:
/// the plaintext padded to the next full block (PKCS#7 always pads), plus
/// HMAC and IV.
pub const fn encrypted_chunk_size(plain_len: u64) -> u64 {
    plain_len + (BLOCK_SIZE - plain_len % BLOCK_SIZE) + CHUNK_OVERHEAD
}
