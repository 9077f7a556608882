//! Directory-backed remote
//!
//! Layout under `{root}/{container}/`:
//! ```text
//! <file_id>.data       encrypted chunks, back to back
//! <file_id>.sums       concatenated chunk HMACs
//! <file_id>.meta.json  {"meta": FileMeta, "version": n}
//! ```
//! Every file is replaced atomically (temp → rename). The metadata file is
//! written last, so its version only moves once the blobs are in place.
//! Upload requests are staged in memory until their commit.

use std::collections::HashMap;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use blobseal_core::{BlobsealError, BlobsealResult, FileId, RequestId, Version};

use crate::api::{
    FileMeta, RemoteBlobApi, RemoteFile, RemoteRead, UploadApi, UploadCommit, UploadFileSpec,
    WriteRequest,
};
use crate::pending::{apply_file_patches, PendingUpload};

#[derive(Debug, Serialize, Deserialize)]
struct MetaRecord {
    meta: FileMeta,
    version: Version,
}

#[derive(Debug)]
pub struct DirRemote {
    dir: PathBuf,
    /// Serializes mutations; readers only ever see renamed, complete files.
    write_lock: Mutex<()>,
    uploads: Mutex<HashMap<RequestId, PendingUpload>>,
}

impl DirRemote {
    /// Open (creating if needed) the container directory `root/container`.
    pub fn open(root: impl AsRef<Path>, container: &str) -> BlobsealResult<Self> {
        if container.is_empty() || container.contains(['/', '\\']) || container == ".." {
            return Err(BlobsealError::Config(format!(
                "invalid container name: {container:?}"
            )));
        }
        let dir = root.as_ref().join(container);
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "opened directory remote");
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
            uploads: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ids of every stored file, sorted.
    pub fn list(&self) -> BlobsealResult<Vec<FileId>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            if let Some(id) = name.to_string_lossy().strip_suffix(".meta.json") {
                ids.push(FileId::from(id));
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn path(&self, file_id: &FileId, ext: &str) -> BlobsealResult<PathBuf> {
        let id = file_id.as_str();
        if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
            return Err(BlobsealError::NotFound(file_id.clone()));
        }
        Ok(self.dir.join(format!("{id}.{ext}")))
    }

    fn read_record(&self, file_id: &FileId) -> BlobsealResult<MetaRecord> {
        let path = self.path(file_id, "meta.json")?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BlobsealError::NotFound(file_id.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| {
            BlobsealError::FileCorrupted(format!("{}: {e}", path.display()))
        })
    }

    fn read_blob(&self, file_id: &FileId, ext: &str) -> BlobsealResult<Vec<u8>> {
        Ok(fs::read(self.path(file_id, ext)?)?)
    }

    fn store(
        &self,
        file_id: &FileId,
        record: &MetaRecord,
        data: &[u8],
        checksums: &[u8],
    ) -> BlobsealResult<()> {
        let meta = serde_json::to_vec_pretty(record)
            .map_err(|e| BlobsealError::transport(anyhow::Error::new(e)))?;
        write_atomic(&self.path(file_id, "data")?, data)?;
        write_atomic(&self.path(file_id, "sums")?, checksums)?;
        write_atomic(&self.path(file_id, "meta.json")?, &meta)?;
        Ok(())
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_uploads(&self) -> MutexGuard<'_, HashMap<RequestId, PendingUpload>> {
        self.uploads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)
}

impl RemoteBlobApi for DirRemote {
    fn stat(&self, file_id: &FileId) -> BlobsealResult<RemoteFile> {
        let record = self.read_record(file_id)?;
        Ok(RemoteFile {
            meta: record.meta,
            version: record.version,
        })
    }

    fn read_range(
        &self,
        file_id: &FileId,
        range: Range<u64>,
        _version: Version,
    ) -> BlobsealResult<RemoteRead> {
        let _guard = self.lock_writes();
        let record = self.read_record(file_id)?;
        let data = self.read_blob(file_id, "data")?;
        let len = data.len() as u64;
        let start = range.start.min(len);
        let end = range.end.clamp(start, len);
        Ok(RemoteRead {
            version: record.version,
            data: data[start as usize..end as usize].to_vec(),
        })
    }

    fn read_checksums(&self, file_id: &FileId) -> BlobsealResult<Vec<u8>> {
        let _guard = self.lock_writes();
        self.read_record(file_id)?;
        self.read_blob(file_id, "sums")
    }

    fn write(&self, file_id: &FileId, request: WriteRequest<'_>) -> BlobsealResult<Version> {
        let _guard = self.lock_writes();
        let record = self.read_record(file_id)?;
        if !request.force && request.version != record.version {
            return Err(BlobsealError::VersionConflict {
                file_id: file_id.clone(),
                expected: request.version,
                actual: record.version,
            });
        }

        let mut data = self.read_blob(file_id, "data")?;
        let mut checksums = self.read_blob(file_id, "sums")?;
        apply_file_patches(&mut data, &mut checksums, request.patches)?;

        let version = record.version + 1;
        let record = MetaRecord {
            meta: request.meta.clone(),
            version,
        };
        self.store(file_id, &record, &data, &checksums)?;
        debug!(
            file_id = %file_id,
            version,
            patches = request.patches.len(),
            "stored patches"
        );
        Ok(version)
    }
}

impl UploadApi for DirRemote {
    fn create_request(&self, files: &[UploadFileSpec]) -> BlobsealResult<RequestId> {
        let request = RequestId::generate();
        self.lock_uploads()
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
        let mut uploads = self.lock_uploads();
        let upload = uploads.get_mut(request).ok_or_else(|| {
            BlobsealError::transport(anyhow::anyhow!("unknown upload request {request}"))
        })?;
        upload.append(request, file_index, seq, data)
    }

    fn commit_file(
        &self,
        request: &RequestId,
        file_index: usize,
        seq: u64,
        commit: &UploadCommit,
    ) -> BlobsealResult<FileId> {
        let data = {
            let mut uploads = self.lock_uploads();
            let upload = uploads.get_mut(request).ok_or_else(|| {
                BlobsealError::transport(anyhow::anyhow!("unknown upload request {request}"))
            })?;
            let data = upload.commit(request, file_index, seq, commit)?;
            if upload.is_complete() {
                uploads.remove(request);
            }
            data
        };

        let file_id = FileId::generate();
        let _guard = self.lock_writes();
        let record = MetaRecord {
            meta: commit.meta.clone(),
            version: 1,
        };
        self.store(&file_id, &record, &data, &commit.checksums)?;
        debug!(file_id = %file_id, request = %request, bytes = data.len(), "committed upload");
        Ok(file_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{FilePatch, Patch};

    fn meta(encrypted_size: u64) -> FileMeta {
        FileMeta {
            plain_size: encrypted_size,
            encrypted_size,
            chunk_size: 16,
            top_hash: [1u8; 32],
            key_id: "disk".into(),
        }
    }

    fn upload(remote: &DirRemote, data: &[u8]) -> FileId {
        let request = remote
            .create_request(&[UploadFileSpec {
                encrypted_size: data.len() as u64,
                checksum_size: 32,
            }])
            .unwrap();
        remote.send_chunk(&request, 0, 0, data).unwrap();
        remote
            .commit_file(
                &request,
                0,
                1,
                &UploadCommit {
                    chunk_count: 1,
                    checksums: vec![9u8; 32],
                    meta: meta(data.len() as u64),
                },
            )
            .unwrap()
    }

    #[test]
    fn test_upload_then_read_back() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = DirRemote::open(tmp.path(), "box").unwrap();
        let id = upload(&remote, b"sealed bytes");

        let stat = remote.stat(&id).unwrap();
        assert_eq!(stat.version, 1);
        assert_eq!(stat.meta, meta(12));
        assert_eq!(remote.read_range(&id, 7..100, 1).unwrap().data, b"bytes");
        assert_eq!(remote.read_checksums(&id).unwrap(), vec![9u8; 32]);
        assert_eq!(remote.list().unwrap(), vec![id]);
    }

    #[test]
    fn test_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let id = {
            let remote = DirRemote::open(tmp.path(), "box").unwrap();
            upload(&remote, b"persist")
        };
        let remote = DirRemote::open(tmp.path(), "box").unwrap();
        assert_eq!(remote.read_range(&id, 0..7, 1).unwrap().data, b"persist");
    }

    #[test]
    fn test_patch_with_truncate() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = DirRemote::open(tmp.path(), "box").unwrap();
        let id = upload(&remote, b"0123456789");

        let patches = [FilePatch {
            data: Patch {
                pos: 4,
                data: b"ab".to_vec(),
                truncate: true,
            },
            checksums: Patch {
                pos: 0,
                data: vec![1u8; 32],
                truncate: true,
            },
        }];
        let version = remote
            .write(
                &id,
                WriteRequest {
                    version: 1,
                    patches: &patches,
                    meta: &meta(6),
                    force: false,
                },
            )
            .unwrap();
        assert_eq!(version, 2);
        assert_eq!(remote.read_range(&id, 0..100, 2).unwrap().data, b"0123ab");
        assert_eq!(remote.read_checksums(&id).unwrap(), vec![1u8; 32]);

        let stale = remote
            .write(
                &id,
                WriteRequest {
                    version: 1,
                    patches: &patches,
                    meta: &meta(6),
                    force: false,
                },
            )
            .unwrap_err();
        assert!(stale.is_version_conflict());
    }

    #[test]
    fn test_checksums_stay_whole_under_concurrent_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = DirRemote::open(tmp.path(), "box").unwrap();
        let id = upload(&remote, b"0123456789");

        std::thread::scope(|s| {
            s.spawn(|| {
                for round in 0..40u8 {
                    let chunks = 1 + usize::from(round % 3);
                    let patches = [FilePatch {
                        data: Patch {
                            pos: 0,
                            data: vec![round; 10 * chunks],
                            truncate: true,
                        },
                        checksums: Patch {
                            pos: 0,
                            data: vec![round; 32 * chunks],
                            truncate: true,
                        },
                    }];
                    let version = remote.stat(&id).unwrap().version;
                    remote
                        .write(
                            &id,
                            WriteRequest {
                                version,
                                patches: &patches,
                                meta: &meta(10 * chunks as u64),
                                force: false,
                            },
                        )
                        .unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..200 {
                    let sums = remote.read_checksums(&id).unwrap();
                    assert!(!sums.is_empty() && sums.len() % 32 == 0);
                    assert!(sums.iter().all(|b| *b == sums[0]), "torn checksum blob");
                }
            });
        });
    }

    #[test]
    fn test_unknown_and_malformed_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = DirRemote::open(tmp.path(), "box").unwrap();
        assert!(matches!(
            remote.stat(&FileId::from("missing")),
            Err(BlobsealError::NotFound(_))
        ));
        assert!(matches!(
            remote.stat(&FileId::from("../escape")),
            Err(BlobsealError::NotFound(_))
        ));
        assert!(DirRemote::open(tmp.path(), "a/b").is_err());
    }
}
