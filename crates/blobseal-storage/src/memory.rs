//! In-process remote: both storage traits over a `Mutex`-guarded map.
//!
//! Used by the test suites and for local experiments. Besides the plain
//! storage behaviour it counts calls ([`RemoteStats`]) and can be told to
//! fail a future write, which is how rollback paths get exercised.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};

use blobseal_core::{BlobsealError, BlobsealResult, FileId, RequestId, Version};

use crate::api::{
    FileMeta, RemoteBlobApi, RemoteFile, RemoteRead, UploadApi, UploadCommit, UploadFileSpec,
    WriteRequest,
};
use crate::pending::{apply_file_patches, PendingUpload};

/// Call counters, for asserting cache behaviour and batching.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteStats {
    pub stats: u64,
    pub range_reads: u64,
    pub checksum_reads: u64,
    /// Successful `write` calls (one per batch)
    pub writes: u64,
    /// Patches applied across all successful writes
    pub patches: u64,
    pub chunk_sends: u64,
    pub commits: u64,
}

/// Failure returned by an injected write fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Transport,
    VersionConflict,
}

#[derive(Debug, Clone)]
struct StoredFile {
    meta: FileMeta,
    version: Version,
    data: Vec<u8>,
    checksums: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    files: HashMap<FileId, StoredFile>,
    uploads: HashMap<RequestId, PendingUpload>,
    stats: RemoteStats,
    /// Write calls to let through before the injected failure fires
    fail_write: Option<(u64, InjectedFailure)>,
}

impl State {
    fn file(&self, file_id: &FileId) -> BlobsealResult<&StoredFile> {
        self.files
            .get(file_id)
            .ok_or_else(|| BlobsealError::NotFound(file_id.clone()))
    }

    fn upload(&mut self, request: &RequestId) -> BlobsealResult<&mut PendingUpload> {
        self.uploads.get_mut(request).ok_or_else(|| {
            BlobsealError::transport(anyhow::anyhow!("unknown upload request {request}"))
        })
    }

    fn take_injected_failure(&mut self) -> Option<InjectedFailure> {
        match self.fail_write.as_mut() {
            Some((0, failure)) => {
                let failure = *failure;
                self.fail_write = None;
                Some(failure)
            }
            Some((remaining, _)) => {
                *remaining -= 1;
                None
            }
            None => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a file directly, bypassing the upload protocol. Starts at version 1.
    pub fn insert_file(&self, meta: FileMeta, data: Vec<u8>, checksums: Vec<u8>) -> FileId {
        let file_id = FileId::generate();
        self.lock().files.insert(
            file_id.clone(),
            StoredFile {
                meta,
                version: 1,
                data,
                checksums,
            },
        );
        file_id
    }

    pub fn file_data(&self, file_id: &FileId) -> Option<Vec<u8>> {
        self.lock().files.get(file_id).map(|f| f.data.clone())
    }

    pub fn file_checksums(&self, file_id: &FileId) -> Option<Vec<u8>> {
        self.lock().files.get(file_id).map(|f| f.checksums.clone())
    }

    pub fn file_count(&self) -> usize {
        self.lock().files.len()
    }

    /// Simulate another writer committing to the file.
    pub fn bump_version(&self, file_id: &FileId) -> Option<Version> {
        let mut state = self.lock();
        let file = state.files.get_mut(file_id)?;
        file.version += 1;
        Some(file.version)
    }

    /// Let `successes` more write calls through, then fail the next one.
    pub fn fail_write_after(&self, successes: u64, failure: InjectedFailure) {
        self.lock().fail_write = Some((successes, failure));
    }

    pub fn stats(&self) -> RemoteStats {
        self.lock().stats
    }

    pub fn reset_stats(&self) {
        self.lock().stats = RemoteStats::default();
    }
}

impl RemoteBlobApi for MemoryRemote {
    fn stat(&self, file_id: &FileId) -> BlobsealResult<RemoteFile> {
        let mut state = self.lock();
        state.stats.stats += 1;
        let file = state.file(file_id)?;
        Ok(RemoteFile {
            meta: file.meta.clone(),
            version: file.version,
        })
    }

    fn read_range(
        &self,
        file_id: &FileId,
        range: Range<u64>,
        _version: Version,
    ) -> BlobsealResult<RemoteRead> {
        let mut state = self.lock();
        state.stats.range_reads += 1;
        let file = state.file(file_id)?;
        let len = file.data.len() as u64;
        let start = range.start.min(len) as usize;
        let end = range.end.clamp(range.start.min(len), len) as usize;
        Ok(RemoteRead {
            version: file.version,
            data: file.data[start..end].to_vec(),
        })
    }

    fn read_checksums(&self, file_id: &FileId) -> BlobsealResult<Vec<u8>> {
        let mut state = self.lock();
        state.stats.checksum_reads += 1;
        Ok(state.file(file_id)?.checksums.clone())
    }

    fn write(&self, file_id: &FileId, request: WriteRequest<'_>) -> BlobsealResult<Version> {
        let mut state = self.lock();
        let current = state.file(file_id)?.version;

        match state.take_injected_failure() {
            Some(InjectedFailure::Transport) => {
                return Err(BlobsealError::transport(anyhow::anyhow!(
                    "injected transport failure"
                )))
            }
            Some(InjectedFailure::VersionConflict) => {
                return Err(BlobsealError::VersionConflict {
                    file_id: file_id.clone(),
                    expected: request.version,
                    actual: current + 1,
                })
            }
            None => {}
        }

        if !request.force && request.version != current {
            return Err(BlobsealError::VersionConflict {
                file_id: file_id.clone(),
                expected: request.version,
                actual: current,
            });
        }

        let file = state.file(file_id)?;
        let mut data = file.data.clone();
        let mut checksums = file.checksums.clone();
        apply_file_patches(&mut data, &mut checksums, request.patches)?;

        let version = current + 1;
        state.files.insert(
            file_id.clone(),
            StoredFile {
                meta: request.meta.clone(),
                version,
                data,
                checksums,
            },
        );
        state.stats.writes += 1;
        state.stats.patches += request.patches.len() as u64;
        Ok(version)
    }
}

impl UploadApi for MemoryRemote {
    fn create_request(&self, files: &[UploadFileSpec]) -> BlobsealResult<RequestId> {
        let request = RequestId::generate();
        self.lock()
            .uploads
            .insert(request.clone(), PendingUpload::new(files));
        Ok(request)
    }

    fn send_chunk(
        &self,
        request: &RequestId,
        file_index: usize,
        seq: u64,
        data: &[u8],
    ) -> BlobsealResult<()> {
        let mut state = self.lock();
        state.stats.chunk_sends += 1;
        state.upload(request)?.append(request, file_index, seq, data)
    }

    fn commit_file(
        &self,
        request: &RequestId,
        file_index: usize,
        seq: u64,
        commit: &UploadCommit,
    ) -> BlobsealResult<FileId> {
        let mut state = self.lock();
        let upload = state.upload(request)?;
        let data = upload.commit(request, file_index, seq, commit)?;
        if upload.is_complete() {
            state.uploads.remove(request);
        }

        let file_id = FileId::generate();
        state.files.insert(
            file_id.clone(),
            StoredFile {
                meta: commit.meta.clone(),
                version: 1,
                data,
                checksums: commit.checksums.clone(),
            },
        );
        state.stats.commits += 1;
        Ok(file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{FilePatch, Patch};

    fn meta(encrypted_size: u64) -> FileMeta {
        FileMeta {
            plain_size: 0,
            encrypted_size,
            chunk_size: 16,
            top_hash: [0u8; 32],
            key_id: "test".into(),
        }
    }

    fn patch(pos: u64, data: &[u8], truncate: bool) -> FilePatch {
        FilePatch {
            data: Patch {
                pos,
                data: data.to_vec(),
                truncate,
            },
            checksums: Patch {
                pos: 0,
                data: vec![],
                truncate: false,
            },
        }
    }

    #[test]
    fn test_read_range_clamped() {
        let remote = MemoryRemote::new();
        let id = remote.insert_file(meta(6), b"abcdef".to_vec(), vec![]);

        let read = remote.read_range(&id, 2..100, 1).unwrap();
        assert_eq!(read.data, b"cdef");
        assert_eq!(read.version, 1);
        assert!(remote.read_range(&id, 10..20, 1).unwrap().data.is_empty());
        assert_eq!(remote.stats().range_reads, 2);
    }

    #[test]
    fn test_write_bumps_version() {
        let remote = MemoryRemote::new();
        let id = remote.insert_file(meta(6), b"abcdef".to_vec(), vec![]);

        let version = remote
            .write(
                &id,
                WriteRequest {
                    version: 1,
                    patches: &[patch(4, b"XYZ", false)],
                    meta: &meta(7),
                    force: false,
                },
            )
            .unwrap();
        assert_eq!(version, 2);
        assert_eq!(remote.file_data(&id).unwrap(), b"abcdXYZ");
        assert_eq!(remote.stat(&id).unwrap().meta.encrypted_size, 7);
    }

    #[test]
    fn test_stale_write_rejected_unless_forced() {
        let remote = MemoryRemote::new();
        let id = remote.insert_file(meta(3), b"abc".to_vec(), vec![]);
        remote.bump_version(&id);

        let patches = [patch(0, b"z", false)];
        let request = WriteRequest {
            version: 1,
            patches: &patches,
            meta: &meta(3),
            force: false,
        };
        let err = remote.write(&id, request.clone()).unwrap_err();
        assert!(err.is_version_conflict());
        assert_eq!(remote.file_data(&id).unwrap(), b"abc");

        let forced = WriteRequest {
            force: true,
            ..request
        };
        assert_eq!(remote.write(&id, forced).unwrap(), 3);
        assert_eq!(remote.file_data(&id).unwrap(), b"zbc");
    }

    #[test]
    fn test_injected_failure_fires_once() {
        let remote = MemoryRemote::new();
        let id = remote.insert_file(meta(3), b"abc".to_vec(), vec![]);
        remote.fail_write_after(1, InjectedFailure::Transport);

        let patches = [patch(0, b"x", false)];
        let write = |version| {
            remote.write(
                &id,
                WriteRequest {
                    version,
                    patches: &patches,
                    meta: &meta(3),
                    force: false,
                },
            )
        };
        assert_eq!(write(1).unwrap(), 2);
        assert!(write(2).is_err());
        assert_eq!(write(2).unwrap(), 3);
        assert_eq!(remote.stats().writes, 2);
    }

    #[test]
    fn test_upload_commit_creates_file() {
        let remote = MemoryRemote::new();
        let request = remote
            .create_request(&[UploadFileSpec {
                encrypted_size: 5,
                checksum_size: 32,
            }])
            .unwrap();
        remote.send_chunk(&request, 0, 0, b"hel").unwrap();
        remote.send_chunk(&request, 0, 1, b"lo").unwrap();

        let id = remote
            .commit_file(
                &request,
                0,
                2,
                &UploadCommit {
                    chunk_count: 1,
                    checksums: vec![7u8; 32],
                    meta: meta(5),
                },
            )
            .unwrap();

        assert_eq!(remote.file_data(&id).unwrap(), b"hello");
        assert_eq!(remote.read_checksums(&id).unwrap(), vec![7u8; 32]);
        assert_eq!(remote.stat(&id).unwrap().version, 1);
        assert!(remote.send_chunk(&request, 0, 2, b"x").is_err());
    }

    #[test]
    fn test_missing_file() {
        let remote = MemoryRemote::new();
        let err = remote.stat(&FileId::from("nope")).unwrap_err();
        assert!(matches!(err, BlobsealError::NotFound(_)));
    }
}
