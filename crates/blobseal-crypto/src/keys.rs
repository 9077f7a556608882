//! File keys and per-chunk key derivation

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use blobseal_core::{BlobsealError, BlobsealResult, ChunkIndex};

use crate::KEY_SIZE;

/// A 256-bit file encryption key. Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> BlobsealResult<Self> {
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            BlobsealError::InvalidKey(format!(
                "key has wrong size: {} bytes (expected {KEY_SIZE})",
                bytes.len()
            ))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Standard base64 form, as stored in key files.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }

    pub fn from_base64(s: &str) -> BlobsealResult<Self> {
        let mut decoded = STANDARD
            .decode(s.trim())
            .map_err(|e| BlobsealError::InvalidKey(format!("base64 decode: {e}")))?;
        let key = Self::from_slice(&decoded);
        decoded.zeroize();
        key
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit file encryption key.
pub fn generate_key() -> EncryptionKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    EncryptionKey::from_bytes(bytes)
}

/// Per-chunk key: `SHA256(file_key || BE32(index))`. Zeroized on drop.
pub fn derive_chunk_key(
    key: &EncryptionKey,
    index: ChunkIndex,
) -> BlobsealResult<Zeroizing<[u8; KEY_SIZE]>> {
    let index32 = u32::try_from(index).map_err(|_| BlobsealError::ChunkIndexOverflow(index))?;
    let digest = Sha256::new()
        .chain_update(key.as_bytes())
        .chain_update(index32.to_be_bytes())
        .finalize();
    Ok(Zeroizing::new(digest.into()))
}
