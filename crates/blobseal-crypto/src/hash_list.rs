//! Ordered list of per-chunk HMACs and the file-level top hash
//!
//! The top hash is `HMAC-SHA256(file_key, hash_0 || hash_1 || ... || hash_n)`.
//! It is persisted in the file metadata and authenticates the chunk order and
//! count; each chunk's own HMAC authenticates its content.

use std::cell::OnceCell;

use hmac::Mac;

use blobseal_core::{BlobsealError, BlobsealResult, ChunkIndex, HASH_SIZE};

use crate::chunk::HmacSha256;
use crate::keys::EncryptionKey;
use crate::ChunkHash;

/// Immutable copy of a hash list's entries, used to roll back a failed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashListState {
    hashes: Vec<ChunkHash>,
}

impl HashListState {
    pub fn hashes(&self) -> &[ChunkHash] {
        &self.hashes
    }
}

#[derive(Debug, Clone)]
pub struct ChunkHashList {
    key: EncryptionKey,
    hashes: Vec<ChunkHash>,
    top_hash: OnceCell<ChunkHash>,
}

impl ChunkHashList {
    pub fn new(key: EncryptionKey, hashes: Vec<ChunkHash>) -> Self {
        Self {
            key,
            hashes,
            top_hash: OnceCell::new(),
        }
    }

    /// Parse the remote checksum blob (concatenated 32-byte hashes).
    pub fn from_bytes(key: EncryptionKey, bytes: &[u8]) -> BlobsealResult<Self> {
        Ok(Self::new(key, split_hashes(bytes)?))
    }

    pub fn len(&self) -> u64 {
        self.hashes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    pub fn get(&self, index: ChunkIndex) -> BlobsealResult<&ChunkHash> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.hashes.get(i))
            .ok_or(BlobsealError::HashIndexOutOfBounds {
                index,
                len: self.len(),
            })
    }

    pub fn get_all(&self) -> &[ChunkHash] {
        &self.hashes
    }

    /// Concatenated hashes, as stored remotely.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.hashes.concat()
    }

    /// Replace the hash at `index`, or append it when `index == len()`.
    ///
    /// With `truncate`, every entry after `index` is discarded.
    pub fn set(&mut self, index: ChunkIndex, hash: ChunkHash, truncate: bool) -> BlobsealResult<()> {
        let len = self.len();
        if index > len {
            return Err(BlobsealError::HashIndexOutOfBounds { index, len });
        }
        let i = index as usize;
        if index == len {
            self.hashes.push(hash);
        } else {
            self.hashes[i] = hash;
        }
        if truncate {
            self.hashes.truncate(i + 1);
        }
        self.top_hash.take();
        Ok(())
    }

    /// Keep only the first `len` entries.
    pub fn truncate(&mut self, len: u64) {
        if len < self.len() {
            self.hashes.truncate(len as usize);
            self.top_hash.take();
        }
    }

    /// Aggregate HMAC over all chunk hashes, memoized until the next mutation.
    pub fn top_hash(&self) -> ChunkHash {
        *self
            .top_hash
            .get_or_init(|| compute_top_hash(&self.key, &self.hashes))
    }

    /// Replace the whole state after a remote resync or key rotation.
    ///
    /// The new top hash must authenticate the new hashes under the new key;
    /// on mismatch the list is left untouched.
    pub fn sync(
        &mut self,
        new_key: EncryptionKey,
        new_top_hash: ChunkHash,
        new_hashes: Vec<ChunkHash>,
    ) -> BlobsealResult<()> {
        let computed = compute_top_hash(&new_key, &new_hashes);
        if computed != new_top_hash {
            return Err(BlobsealError::FileCorrupted(
                "top hash does not match the chunk hash list".into(),
            ));
        }
        self.key = new_key;
        self.hashes = new_hashes;
        self.top_hash = OnceCell::from(computed);
        Ok(())
    }

    pub fn snapshot(&self) -> HashListState {
        HashListState {
            hashes: self.hashes.clone(),
        }
    }

    pub fn restore(&mut self, state: HashListState) {
        self.hashes = state.hashes;
        self.top_hash.take();
    }
}

/// Split a concatenated checksum blob into 32-byte hashes.
pub fn split_hashes(bytes: &[u8]) -> BlobsealResult<Vec<ChunkHash>> {
    if bytes.len() % HASH_SIZE != 0 {
        return Err(BlobsealError::FileCorrupted(format!(
            "checksum blob length {} is not a multiple of {HASH_SIZE}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(HASH_SIZE)
        .map(|c| {
            let mut hash = [0u8; HASH_SIZE];
            hash.copy_from_slice(c);
            hash
        })
        .collect())
}

/// `HMAC-SHA256(key, concat(hashes))`
pub fn compute_top_hash(key: &EncryptionKey, hashes: &[ChunkHash]) -> ChunkHash {
    // HMAC accepts keys of any length, so this cannot fail for a 32-byte key.
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
        .unwrap_or_else(|_| unreachable!("HMAC-SHA256 accepts any key length"));
    for hash in hashes {
        mac.update(hash);
    }
    mac.finalize().into_bytes().into()
}
