use thiserror::Error;

use crate::types::{FileId, HandleId, Version};

pub type BlobsealResult<T> = Result<T, BlobsealError>;

/// Coarse classification of a [`BlobsealError`].
///
/// Callers branch on the kind rather than on individual variants: integrity
/// and size-contract failures are final, a version conflict means "resync
/// first", and transport failures may be retried from a freshly-synced state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    IntegrityFailure,
    SizeContractViolation,
    HandleMisuse,
    VersionConflict,
    TransportFailure,
    Config,
    Io,
}

#[derive(Debug, Error)]
pub enum BlobsealError {
    #[error("chunk {index}: stored checksum does not match the chunk header")]
    ChecksumMismatch { index: u64 },

    #[error("chunk {index}: ciphertext checksum mismatch")]
    CipherChecksumMismatch { index: u64 },

    #[error("file corrupted: {0}")]
    FileCorrupted(String),

    #[error("data bigger than declared: declared {declared} bytes, got at least {attempted}")]
    DataBiggerThanDeclared { declared: u64, attempted: u64 },

    #[error("data smaller than declared: declared {declared} bytes, written {written}")]
    DataSmallerThanDeclared { declared: u64, written: u64 },

    #[error("invalid chunk length: expected {expected} bytes, got {actual}")]
    InvalidChunkLength { expected: u64, actual: u64 },

    #[error("hash index {index} out of bounds (hash list length {len})")]
    HashIndexOutOfBounds { index: u64, len: u64 },

    #[error("chunk index {0} does not fit in 32 bits")]
    ChunkIndexOverflow(u64),

    #[error("position {pos} out of bounds (file size {size})")]
    PosOutOfBounds { pos: u64, size: u64 },

    #[error("invalid file handle: {0}")]
    InvalidFileHandle(HandleId),

    #[error("file handle {0} is not a read handle")]
    NotAReadHandle(HandleId),

    #[error("file handle {0} is not a write handle")]
    NotAWriteHandle(HandleId),

    #[error("file handle {0} is not a random-write handle")]
    NotARandomWriteHandle(HandleId),

    #[error("upload session: {0}")]
    UploadStateViolation(String),

    #[error("version conflict on {file_id}: expected {expected}, server has {actual}")]
    VersionConflict {
        file_id: FileId,
        expected: Version,
        actual: Version,
    },

    #[error("file not found: {0}")]
    NotFound(FileId),

    #[error("transport error: {0:#}")]
    Transport(anyhow::Error),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BlobsealError {
    /// Wrap an opaque backend failure.
    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        Self::Transport(err.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ChecksumMismatch { .. }
            | Self::CipherChecksumMismatch { .. }
            | Self::FileCorrupted(_)
            | Self::Crypto(_) => ErrorKind::IntegrityFailure,
            Self::DataBiggerThanDeclared { .. }
            | Self::DataSmallerThanDeclared { .. }
            | Self::InvalidChunkLength { .. } => ErrorKind::SizeContractViolation,
            Self::HashIndexOutOfBounds { .. }
            | Self::ChunkIndexOverflow(_)
            | Self::PosOutOfBounds { .. }
            | Self::InvalidFileHandle(_)
            | Self::NotAReadHandle(_)
            | Self::NotAWriteHandle(_)
            | Self::NotARandomWriteHandle(_)
            | Self::UploadStateViolation(_) => ErrorKind::HandleMisuse,
            Self::VersionConflict { .. } => ErrorKind::VersionConflict,
            Self::NotFound(_) | Self::Transport(_) => ErrorKind::TransportFailure,
            Self::Config(_) | Self::InvalidKey(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    pub fn is_integrity_failure(&self) -> bool {
        self.kind() == ErrorKind::IntegrityFailure
    }

    pub fn is_version_conflict(&self) -> bool {
        self.kind() == ErrorKind::VersionConflict
    }
}
