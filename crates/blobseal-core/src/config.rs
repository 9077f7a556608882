use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{BlobsealError, BlobsealResult};

/// Top-level configuration (loaded from blobseal.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobsealConfig {
    pub engine: EngineConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

/// Chunking and remote-access granularity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Plaintext bytes per chunk (default: 1 MiB)
    pub chunk_size: u64,
    /// Remote read granularity in bytes (default: 4 MiB).
    /// Rounded up to a whole number of encrypted chunks.
    pub server_slice_size: u64,
    /// Bytes per physical upload write (default: 4 MiB)
    pub upload_request_size: u64,
    /// Upper bound for a squashed random-write patch (default: 8 MiB)
    pub max_operation_size: u64,
    /// Squashed patches sent per remote write call (default: 16)
    pub max_operations_per_batch: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            server_slice_size: 4 * 1024 * 1024,
            upload_request_size: 4 * 1024 * 1024,
            max_operation_size: 8 * 1024 * 1024,
            max_operations_per_batch: 16,
        }
    }
}

impl EngineConfig {
    /// Encrypted size of one full chunk under this configuration.
    pub fn encrypted_chunk_size(&self) -> u64 {
        crate::encrypted_chunk_size(self.chunk_size)
    }

    /// Reject configurations the engine cannot address.
    ///
    /// A server slice smaller than one encrypted chunk would split chunks
    /// across slices, so it is refused here rather than at first read.
    pub fn validate(&self) -> BlobsealResult<()> {
        if self.chunk_size == 0 {
            return Err(BlobsealError::Config("chunk_size must be positive".into()));
        }
        if self.upload_request_size == 0 {
            return Err(BlobsealError::Config(
                "upload_request_size must be positive".into(),
            ));
        }
        let encrypted_chunk = self.encrypted_chunk_size();
        if self.server_slice_size < encrypted_chunk {
            return Err(BlobsealError::Config(format!(
                "server_slice_size ({}) is smaller than one encrypted chunk ({encrypted_chunk})",
                self.server_slice_size
            )));
        }
        if self.max_operation_size < encrypted_chunk {
            return Err(BlobsealError::Config(format!(
                "max_operation_size ({}) is smaller than one encrypted chunk ({encrypted_chunk})",
                self.max_operation_size
            )));
        }
        if self.max_operations_per_batch == 0 {
            return Err(BlobsealError::Config(
                "max_operations_per_batch must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Directory-backed remote used by the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the store
    pub root: PathBuf,
    /// Container (subdirectory) files are created in
    pub container: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/.local/share/blobseal"),
            container: "default".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}
