//! blobseal-crypto: client-side chunk encryption for blobseal
//!
//! Architecture: Encrypt-then-MAC per fixed-size chunk
//!
//! Pipeline: plaintext chunk → AES-256-CBC (PKCS#7, random IV) → HMAC-SHA256 → upload
//!
//! Key hierarchy:
//! ```text
//! File Key (256-bit, provisioned by the caller, never sent to the server)
//!   ├── Chunk Key i = SHA256(file_key || BE32(i))
//!   │   ├── Chunk cipher: AES-256-CBC(key=chunk_key_i, iv=random_128bit)
//!   │   └── Chunk tag:    HMAC-SHA256(chunk_key_i, iv || ciphertext)
//!   └── Top hash: HMAC-SHA256(file_key, tag_0 || tag_1 || ... || tag_n)
//! ```

pub mod chunk;
pub mod hash_list;
pub mod keys;

pub use chunk::{ChunkCodec, EncryptedChunk};
pub use hash_list::{compute_top_hash, split_hashes, ChunkHashList, HashListState};
pub use keys::{derive_chunk_key, generate_key, EncryptionKey};

/// Size of a file key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// A 32-byte chunk HMAC / hash-list entry
pub type ChunkHash = [u8; blobseal_core::HASH_SIZE];
