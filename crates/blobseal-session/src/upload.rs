//! Sequential upload of a new file
//!
//! Plaintext arrives one full chunk at a time. Each chunk is encrypted
//! immediately, and the ciphertext is batched into physical writes of
//! `upload_request_size` bytes. The logical chunk counter (which also selects
//! the chunk key) and the physical write counter advance independently.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use blobseal_chunks::ChunkLayout;
use blobseal_core::{
    BlobsealError, BlobsealResult, CipherType, EngineConfig, FileId, RequestId,
};
use blobseal_crypto::{compute_top_hash, ChunkCodec, ChunkHash, EncryptionKey};
use blobseal_storage::{FileMeta, UploadApi, UploadCommit, UploadFileSpec};

/// What a finished upload hands back to the caller
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub cipher_type: CipherType,
    pub key: EncryptionKey,
    /// Top hash over all chunk HMACs
    pub hmac: ChunkHash,
    pub chunk_size: u64,
    pub request_id: RequestId,
    pub file_id: FileId,
    pub plain_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Open(RequestId),
    Finalized,
    Failed,
}

pub struct UploadSession {
    api: Arc<dyn UploadApi>,
    codec: ChunkCodec,
    key_id: String,
    layout: ChunkLayout,
    upload_request_size: usize,
    file_size: u64,
    declared: UploadFileSpec,
    state: State,
    /// Encrypted bytes not yet sent
    pending: Vec<u8>,
    hashes: Vec<ChunkHash>,
    /// Plaintext bytes accepted so far
    plain_written: u64,
    /// Logical chunks encrypted so far
    chunk_seq: u64,
    /// Physical writes sent so far
    write_seq: u64,
}

impl UploadSession {
    pub fn new(
        api: Arc<dyn UploadApi>,
        config: &EngineConfig,
        key: EncryptionKey,
        key_id: impl Into<String>,
        file_size: u64,
    ) -> BlobsealResult<Self> {
        let layout = ChunkLayout::new(config.chunk_size)?;
        if config.upload_request_size == 0 {
            return Err(BlobsealError::Config(
                "upload_request_size must be positive".into(),
            ));
        }
        let declared = UploadFileSpec {
            encrypted_size: layout.encrypted_file_size(file_size),
            checksum_size: layout.checksum_size(file_size),
        };
        Ok(Self {
            api,
            codec: ChunkCodec::new(key),
            key_id: key_id.into(),
            layout,
            upload_request_size: config.upload_request_size as usize,
            file_size,
            declared,
            state: State::Idle,
            pending: Vec::new(),
            hashes: Vec::new(),
            plain_written: 0,
            chunk_seq: 0,
            write_seq: 0,
        })
    }

    /// Sizes the server is told to expect
    pub fn declared(&self) -> UploadFileSpec {
        self.declared
    }

    pub fn chunk_size(&self) -> u64 {
        self.layout.chunk_size()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn chunks_sent(&self) -> u64 {
        self.chunk_seq
    }

    pub fn writes_sent(&self) -> u64 {
        self.write_seq
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        match &self.state {
            State::Open(request) => Some(request),
            _ => None,
        }
    }

    /// Register the upload with the server.
    #[instrument(skip_all, fields(file_size = self.file_size))]
    pub fn create_request(&mut self) -> BlobsealResult<RequestId> {
        if self.state != State::Idle {
            return Err(BlobsealError::UploadStateViolation(
                "upload request already created".into(),
            ));
        }
        let request = self.api.create_request(&[self.declared])?;
        debug!(
            request = %request,
            encrypted_size = self.declared.encrypted_size,
            checksum_size = self.declared.checksum_size,
            "created upload request"
        );
        self.state = State::Open(request.clone());
        Ok(request)
    }

    fn open_request(&self) -> BlobsealResult<RequestId> {
        match &self.state {
            State::Open(request) => Ok(request.clone()),
            State::Idle => Err(BlobsealError::UploadStateViolation(
                "no upload request created".into(),
            )),
            State::Finalized => Err(BlobsealError::UploadStateViolation(
                "upload already finalized".into(),
            )),
            State::Failed => Err(BlobsealError::UploadStateViolation(
                "upload failed earlier".into(),
            )),
        }
    }

    /// Encrypt and queue one full chunk.
    pub fn send_chunk(&mut self, data: &[u8]) -> BlobsealResult<()> {
        let request = self.open_request()?;
        let chunk_size = self.layout.chunk_size();
        if data.len() as u64 != chunk_size {
            return Err(BlobsealError::InvalidChunkLength {
                expected: chunk_size,
                actual: data.len() as u64,
            });
        }
        self.encrypt_chunk(data)?;
        let result = self.flush(&request, false);
        self.fail_on_error(result)
    }

    fn encrypt_chunk(&mut self, data: &[u8]) -> BlobsealResult<()> {
        let attempted = self.plain_written + data.len() as u64;
        if attempted > self.file_size {
            return Err(BlobsealError::DataBiggerThanDeclared {
                declared: self.file_size,
                attempted,
            });
        }
        let encrypted = self.codec.encrypt(self.chunk_seq, data)?;
        self.pending.extend_from_slice(&encrypted.data);
        self.hashes.push(encrypted.hmac);
        self.plain_written = attempted;
        self.chunk_seq += 1;
        Ok(())
    }

    /// Send every full physical write; with `all`, the remainder too.
    fn flush(&mut self, request: &RequestId, all: bool) -> BlobsealResult<()> {
        let mut sent = 0;
        while self.pending.len() - sent >= self.upload_request_size
            || (all && sent < self.pending.len())
        {
            let end = (sent + self.upload_request_size).min(self.pending.len());
            self.api
                .send_chunk(request, 0, self.write_seq, &self.pending[sent..end])?;
            self.write_seq += 1;
            sent = end;
        }
        self.pending.drain(..sent);
        Ok(())
    }

    fn fail_on_error<T>(&mut self, result: BlobsealResult<T>) -> BlobsealResult<T> {
        if let Err(e) = &result {
            warn!(chunks = self.chunk_seq, writes = self.write_seq, "upload failed: {e}");
            self.state = State::Failed;
        }
        result
    }

    /// Encrypt the (possibly short, possibly empty) last chunk, flush and
    /// commit the file.
    #[instrument(skip_all, fields(file_size = self.file_size, chunks = self.chunk_seq))]
    pub fn finalize(&mut self, last: &[u8]) -> BlobsealResult<UploadReceipt> {
        let request = self.open_request()?;
        let chunk_size = self.layout.chunk_size();
        if last.len() as u64 > chunk_size {
            return Err(BlobsealError::InvalidChunkLength {
                expected: chunk_size,
                actual: last.len() as u64,
            });
        }
        let written = self.plain_written + last.len() as u64;
        if written < self.file_size {
            return Err(BlobsealError::DataSmallerThanDeclared {
                declared: self.file_size,
                written,
            });
        }
        if !last.is_empty() {
            self.encrypt_chunk(last)?;
        }

        let result = self.commit(&request);
        let receipt = self.fail_on_error(result)?;
        self.state = State::Finalized;
        Ok(receipt)
    }

    fn commit(&mut self, request: &RequestId) -> BlobsealResult<UploadReceipt> {
        self.flush(request, true)?;

        let top_hash = compute_top_hash(self.codec.key(), &self.hashes);
        let commit = UploadCommit {
            chunk_count: self.chunk_seq,
            checksums: self.hashes.concat(),
            meta: FileMeta {
                plain_size: self.file_size,
                encrypted_size: self.declared.encrypted_size,
                chunk_size: self.layout.chunk_size(),
                top_hash,
                key_id: self.key_id.clone(),
            },
        };
        let file_id = self.api.commit_file(request, 0, self.write_seq, &commit)?;
        debug!(
            file_id = %file_id,
            chunks = self.chunk_seq,
            writes = self.write_seq,
            "upload committed"
        );
        Ok(UploadReceipt {
            cipher_type: CipherType::Aes256CbcHmacSha256,
            key: self.codec.key().clone(),
            hmac: top_hash,
            chunk_size: self.layout.chunk_size(),
            request_id: request.clone(),
            file_id,
            plain_size: self.file_size,
        })
    }
}
