//! Server-side bookkeeping shared by the bundled remotes: upload request
//! validation and patch application.

use blobseal_core::{BlobsealError, BlobsealResult, RequestId};

use crate::api::{FilePatch, Patch, UploadCommit, UploadFileSpec};

/// One file of an in-flight upload request
#[derive(Debug, Clone, Default)]
pub struct PendingFile {
    pub data: Vec<u8>,
    pub next_seq: u64,
    pub committed: bool,
}

#[derive(Debug, Clone)]
pub struct PendingUpload {
    pub specs: Vec<UploadFileSpec>,
    pub files: Vec<PendingFile>,
}

impl PendingUpload {
    pub fn new(specs: &[UploadFileSpec]) -> Self {
        Self {
            specs: specs.to_vec(),
            files: vec![PendingFile::default(); specs.len()],
        }
    }

    fn file_mut(
        &mut self,
        request: &RequestId,
        file_index: usize,
    ) -> BlobsealResult<(&UploadFileSpec, &mut PendingFile)> {
        match (self.specs.get(file_index), self.files.get_mut(file_index)) {
            (Some(spec), Some(file)) if !file.committed => Ok((spec, file)),
            (Some(_), Some(_)) => Err(BlobsealError::transport(anyhow::anyhow!(
                "request {request}: file {file_index} already committed"
            ))),
            _ => Err(BlobsealError::transport(anyhow::anyhow!(
                "request {request}: no file {file_index}"
            ))),
        }
    }

    /// Append one physical write, enforcing order and the declared size.
    pub fn append(
        &mut self,
        request: &RequestId,
        file_index: usize,
        seq: u64,
        data: &[u8],
    ) -> BlobsealResult<()> {
        let (spec, file) = self.file_mut(request, file_index)?;
        if seq != file.next_seq {
            return Err(BlobsealError::transport(anyhow::anyhow!(
                "request {request}: expected write {}, got {seq}",
                file.next_seq
            )));
        }
        let attempted = file.data.len() as u64 + data.len() as u64;
        if attempted > spec.encrypted_size {
            return Err(BlobsealError::DataBiggerThanDeclared {
                declared: spec.encrypted_size,
                attempted,
            });
        }
        file.data.extend_from_slice(data);
        file.next_seq += 1;
        Ok(())
    }

    /// Validate a commit and hand back the uploaded bytes.
    pub fn commit(
        &mut self,
        request: &RequestId,
        file_index: usize,
        seq: u64,
        commit: &UploadCommit,
    ) -> BlobsealResult<Vec<u8>> {
        let (spec, file) = self.file_mut(request, file_index)?;
        if seq != file.next_seq {
            return Err(BlobsealError::transport(anyhow::anyhow!(
                "request {request}: commit after {seq} writes, received {}",
                file.next_seq
            )));
        }
        let written = file.data.len() as u64;
        if written != spec.encrypted_size {
            return Err(BlobsealError::DataSmallerThanDeclared {
                declared: spec.encrypted_size,
                written,
            });
        }
        if commit.checksums.len() as u64 != spec.checksum_size {
            return Err(BlobsealError::FileCorrupted(format!(
                "checksum blob is {} bytes, declared {}",
                commit.checksums.len(),
                spec.checksum_size
            )));
        }
        if commit.meta.encrypted_size != written {
            return Err(BlobsealError::FileCorrupted(format!(
                "metadata declares {} encrypted bytes, uploaded {written}",
                commit.meta.encrypted_size
            )));
        }
        file.committed = true;
        Ok(std::mem::take(&mut file.data))
    }

    pub fn is_complete(&self) -> bool {
        self.files.iter().all(|f| f.committed)
    }
}

/// Apply one patch to a blob. A patch may start at the end of the blob
/// (append) but not past it.
pub fn apply_patch(blob: &mut Vec<u8>, patch: &Patch) -> BlobsealResult<()> {
    let len = blob.len() as u64;
    if patch.pos > len {
        return Err(BlobsealError::transport(anyhow::anyhow!(
            "patch at {} starts past the end of a {len}-byte blob",
            patch.pos
        )));
    }
    let pos = patch.pos as usize;
    let end = pos + patch.data.len();
    if end > blob.len() {
        blob.resize(end, 0);
    }
    blob[pos..end].copy_from_slice(&patch.data);
    if patch.truncate {
        blob.truncate(end);
    }
    Ok(())
}

/// Apply a batch of patches to the data and checksum blobs.
pub fn apply_file_patches(
    data: &mut Vec<u8>,
    checksums: &mut Vec<u8>,
    patches: &[FilePatch],
) -> BlobsealResult<()> {
    for patch in patches {
        apply_patch(data, &patch.data)?;
        apply_patch(checksums, &patch.checksums)?;
    }
    Ok(())
}
