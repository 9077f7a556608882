//! Client-side view of one remote file

use blobseal_chunks::ChunkLayout;
use blobseal_core::{encrypted_chunk_size, BlobsealResult, FileId, Version};
use blobseal_crypto::{ChunkHash, EncryptionKey};
use blobseal_storage::{FileMeta, RemoteBlobApi, RemoteFile};

/// Everything a session needs to address and authenticate a file.
///
/// Mutated only after the remote acknowledges a write.
#[derive(Debug, Clone)]
pub struct FileDescriptor {
    pub file_id: FileId,
    pub plain_size: u64,
    pub encrypted_size: u64,
    pub version: Version,
    pub chunk_size: u64,
    pub encrypted_chunk_size: u64,
    pub key: EncryptionKey,
    pub key_id: String,
    pub top_hash: ChunkHash,
}

impl FileDescriptor {
    pub fn from_remote(file_id: FileId, remote: RemoteFile, key: EncryptionKey) -> Self {
        let RemoteFile { meta, version } = remote;
        Self {
            file_id,
            plain_size: meta.plain_size,
            encrypted_size: meta.encrypted_size,
            version,
            chunk_size: meta.chunk_size,
            encrypted_chunk_size: encrypted_chunk_size(meta.chunk_size),
            key,
            key_id: meta.key_id,
            top_hash: meta.top_hash,
        }
    }

    /// Stat the file and build its descriptor.
    pub fn fetch(
        remote: &dyn RemoteBlobApi,
        file_id: &FileId,
        key: EncryptionKey,
    ) -> BlobsealResult<Self> {
        let stat = remote.stat(file_id)?;
        Ok(Self::from_remote(file_id.clone(), stat, key))
    }

    pub fn layout(&self) -> BlobsealResult<ChunkLayout> {
        ChunkLayout::new(self.chunk_size)
    }

    /// Metadata as the remote stores it
    pub fn meta(&self) -> FileMeta {
        FileMeta {
            plain_size: self.plain_size,
            encrypted_size: self.encrypted_size,
            chunk_size: self.chunk_size,
            top_hash: self.top_hash,
            key_id: self.key_id.clone(),
        }
    }
}

/// Latest server-observed state of a file, handed to `sync`.
#[derive(Debug, Clone)]
pub struct SyncParams {
    pub descriptor: FileDescriptor,
    /// Concatenated chunk hashes
    pub checksums: Vec<u8>,
}

impl SyncParams {
    /// Fetch the current metadata and checksum blob.
    ///
    /// The two calls are not atomic; a write landing in between shows up as
    /// a top-hash mismatch when the params are applied.
    pub fn fetch(
        remote: &dyn RemoteBlobApi,
        file_id: &FileId,
        key: EncryptionKey,
    ) -> BlobsealResult<Self> {
        let descriptor = FileDescriptor::fetch(remote, file_id, key)?;
        let checksums = remote.read_checksums(file_id)?;
        Ok(Self {
            descriptor,
            checksums,
        })
    }
}
