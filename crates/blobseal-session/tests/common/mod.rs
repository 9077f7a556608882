//! Shared fixtures for the session integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use blobseal_core::{EngineConfig, FileId};
use blobseal_crypto::EncryptionKey;
use blobseal_session::{FileDescriptor, RandomWriteEngine, UploadSession};
use blobseal_storage::MemoryRemote;

/// 1 KiB chunks, four encrypted chunks per server slice.
pub fn kib_config() -> EngineConfig {
    EngineConfig {
        chunk_size: 1024,
        server_slice_size: 4096,
        upload_request_size: 4096,
        max_operation_size: 8192,
        max_operations_per_batch: 16,
    }
}

/// 16-byte chunks (80 bytes encrypted), two per slice and per squashed patch.
pub fn small_config() -> EngineConfig {
    EngineConfig {
        chunk_size: 16,
        server_slice_size: 160,
        upload_request_size: 64,
        max_operation_size: 160,
        max_operations_per_batch: 2,
    }
}

pub fn test_key() -> EncryptionKey {
    EncryptionKey::from_bytes([42u8; 32])
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 251) as u8).collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("blobseal_session=debug")
        .with_test_writer()
        .try_init();
}

/// Upload `data` through an upload session and return the new file id.
pub fn upload(
    remote: &Arc<MemoryRemote>,
    config: &EngineConfig,
    key: &EncryptionKey,
    data: &[u8],
) -> FileId {
    let mut session =
        UploadSession::new(remote.clone(), config, key.clone(), "test-key", data.len() as u64)
            .expect("upload session");
    session.create_request().expect("create request");
    let chunk_size = config.chunk_size as usize;
    let full = data.len() / chunk_size;
    for chunk in data[..full * chunk_size].chunks_exact(chunk_size) {
        session.send_chunk(chunk).expect("send chunk");
    }
    session
        .finalize(&data[full * chunk_size..])
        .expect("finalize")
        .file_id
}

pub fn open_engine(
    remote: &Arc<MemoryRemote>,
    config: &EngineConfig,
    key: &EncryptionKey,
    file_id: &FileId,
) -> RandomWriteEngine {
    let descriptor =
        FileDescriptor::fetch(remote.as_ref(), file_id, key.clone()).expect("fetch descriptor");
    RandomWriteEngine::open(remote.clone(), descriptor, config).expect("open engine")
}
