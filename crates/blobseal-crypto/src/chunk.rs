//! Per-chunk AES-256-CBC + HMAC-SHA256 encryption/decryption
//!
//! Encrypted chunk format (binary):
//! ```text
//! [32 bytes: HMAC-SHA256(chunk_key, iv || ciphertext)][16 bytes: random IV][N bytes: ciphertext]
//! chunk_key = SHA256(file_key || BE32(chunk_index))
//! ```
//!
//! Deriving the key from the index binds each chunk to its position: a chunk
//! moved to another index fails its HMAC check.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use blobseal_core::{BlobsealError, BlobsealResult, ChunkIndex, BLOCK_SIZE, HASH_SIZE, IV_SIZE};

use crate::keys::{derive_chunk_key, EncryptionKey};
use crate::ChunkHash;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
pub(crate) type HmacSha256 = Hmac<Sha256>;

/// Smallest valid encrypted chunk: HMAC, IV and one padding block.
const MIN_ENCRYPTED_LEN: usize = HASH_SIZE + IV_SIZE + BLOCK_SIZE as usize;

/// Output of [`ChunkCodec::encrypt`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedChunk {
    /// `hmac || iv || ciphertext`, exactly what is stored remotely
    pub data: Vec<u8>,
    /// The leading HMAC, recorded in the hash list
    pub hmac: ChunkHash,
}

/// Encrypts and decrypts the chunks of one file under its file key.
#[derive(Debug, Clone)]
pub struct ChunkCodec {
    key: EncryptionKey,
}

impl ChunkCodec {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }

    pub fn key(&self) -> &EncryptionKey {
        &self.key
    }

    /// Encrypt the plaintext of chunk `index` under a fresh random IV.
    pub fn encrypt(&self, index: ChunkIndex, plaintext: &[u8]) -> BlobsealResult<EncryptedChunk> {
        let chunk_key = derive_chunk_key(&self.key, index)?;

        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new_from_slices(chunk_key.as_slice(), &iv)
            .map_err(|e| BlobsealError::Crypto(format!("cipher init: {e}")))?
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut data = Vec::with_capacity(HASH_SIZE + IV_SIZE + ciphertext.len());
        data.extend_from_slice(&[0u8; HASH_SIZE]);
        data.extend_from_slice(&iv);
        data.extend_from_slice(&ciphertext);

        let hmac: ChunkHash = chunk_mac(chunk_key.as_slice(), &data[HASH_SIZE..])?
            .finalize()
            .into_bytes()
            .into();
        data[..HASH_SIZE].copy_from_slice(&hmac);

        Ok(EncryptedChunk { data, hmac })
    }

    /// Verify and decrypt chunk `index`.
    ///
    /// `expected` is the chunk's entry in the hash list. It must equal the
    /// chunk's own leading HMAC, which in turn must authenticate the rest of
    /// the chunk under the derived chunk key.
    pub fn decrypt(
        &self,
        index: ChunkIndex,
        chunk: &[u8],
        expected: &ChunkHash,
    ) -> BlobsealResult<Vec<u8>> {
        if chunk.len() < MIN_ENCRYPTED_LEN
            || (chunk.len() - HASH_SIZE - IV_SIZE) % BLOCK_SIZE as usize != 0
        {
            return Err(BlobsealError::CipherChecksumMismatch { index });
        }

        let (stored_hmac, body) = chunk.split_at(HASH_SIZE);
        if stored_hmac != expected.as_slice() {
            return Err(BlobsealError::ChecksumMismatch { index });
        }

        let chunk_key = derive_chunk_key(&self.key, index)?;
        chunk_mac(chunk_key.as_slice(), body)?
            .verify_slice(stored_hmac)
            .map_err(|_| BlobsealError::CipherChecksumMismatch { index })?;

        let (iv, ciphertext) = body.split_at(IV_SIZE);
        Aes256CbcDec::new_from_slices(chunk_key.as_slice(), iv)
            .map_err(|e| BlobsealError::Crypto(format!("cipher init: {e}")))?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| BlobsealError::FileCorrupted(format!("chunk {index}: invalid padding")))
    }
}

fn chunk_mac(chunk_key: &[u8], data: &[u8]) -> BlobsealResult<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(chunk_key)
        .map_err(|e| BlobsealError::Crypto(format!("HMAC init: {e}")))?;
    mac.update(data);
    Ok(mac)
}
