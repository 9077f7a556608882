//! Remote blob and upload-request interfaces
//!
//! The engine only ever talks to storage through these two traits. All calls
//! are blocking; a backend that is async internally must block on its own
//! runtime. Neither trait retries: an error fails the calling operation.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use blobseal_core::{BlobsealResult, FileId, RequestId, Version, HASH_SIZE};

/// Metadata the server keeps next to a file's encrypted bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Plaintext size in bytes
    pub plain_size: u64,
    /// Size of the encrypted data blob
    pub encrypted_size: u64,
    /// Plaintext chunk size the file was written with
    pub chunk_size: u64,
    /// HMAC over all chunk hashes, keyed by the file key
    pub top_hash: [u8; HASH_SIZE],
    /// Opaque label of the key the file is encrypted with
    pub key_id: String,
}

/// A file as reported by [`RemoteBlobApi::stat`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub meta: FileMeta,
    pub version: Version,
}

/// Bytes read from a file, tagged with the version the server served them at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRead {
    pub version: Version,
    pub data: Vec<u8>,
}

/// Overwrite `data` at `pos`; with `truncate`, the blob ends right after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub pos: u64,
    pub data: Vec<u8>,
    pub truncate: bool,
}

impl Patch {
    pub fn end(&self) -> u64 {
        self.pos + self.data.len() as u64
    }
}

/// One write operation: a patch of the encrypted data and the matching patch
/// of the checksum blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    pub data: Patch,
    pub checksums: Patch,
}

/// A versioned, all-or-nothing batch of patches for one file.
#[derive(Debug, Clone)]
pub struct WriteRequest<'a> {
    /// Version the patches were computed against
    pub version: Version,
    pub patches: &'a [FilePatch],
    /// Metadata to store once the patches are applied (carries the key id)
    pub meta: &'a FileMeta,
    /// Skip the version check
    pub force: bool,
}

/// Random-access view of stored files.
pub trait RemoteBlobApi: Send + Sync {
    fn stat(&self, file_id: &FileId) -> BlobsealResult<RemoteFile>;

    /// Read `range` of the encrypted data. The range is clamped to the blob;
    /// the returned version lets the caller detect a concurrent change.
    fn read_range(
        &self,
        file_id: &FileId,
        range: Range<u64>,
        version: Version,
    ) -> BlobsealResult<RemoteRead>;

    /// The concatenated chunk HMACs.
    fn read_checksums(&self, file_id: &FileId) -> BlobsealResult<Vec<u8>>;

    /// Apply a batch of patches. Fails with `VersionConflict` if the file is
    /// no longer at `request.version` (unless forced). Returns the new version.
    fn write(&self, file_id: &FileId, request: WriteRequest<'_>) -> BlobsealResult<Version>;
}

/// Declared sizes of one file in an upload request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadFileSpec {
    pub encrypted_size: u64,
    pub checksum_size: u64,
}

/// Final message of one file's upload
#[derive(Debug, Clone)]
pub struct UploadCommit {
    /// Logical chunks encrypted
    pub chunk_count: u64,
    /// Concatenated chunk HMACs
    pub checksums: Vec<u8>,
    pub meta: FileMeta,
}

/// Sequential upload of new files.
pub trait UploadApi: Send + Sync {
    fn create_request(&self, files: &[UploadFileSpec]) -> BlobsealResult<RequestId>;

    /// Append `data` to file `file_index`. `seq` numbers physical writes
    /// from 0 and must arrive in order.
    fn send_chunk(
        &self,
        request: &RequestId,
        file_index: usize,
        seq: u64,
        data: &[u8],
    ) -> BlobsealResult<()>;

    /// Finish file `file_index`; `seq` is the number of physical writes sent.
    /// Returns the id of the newly created file.
    fn commit_file(
        &self,
        request: &RequestId,
        file_index: usize,
        seq: u64,
        commit: &UploadCommit,
    ) -> BlobsealResult<FileId>;
}
