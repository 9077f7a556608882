//! Read-modify-write of arbitrary byte ranges in an existing file
//!
//! A write decrypts every chunk it touches, splices the new bytes in,
//! re-encrypts, and sends the resulting chunk patches (squashed and batched)
//! to the remote. The hash list is updated up front and restored from a
//! [`WriteSnapshot`] if anything fails; the descriptor only moves once the
//! remote has acknowledged every batch.
//!
//! Each intermediate batch carries the metadata of the file as it stands
//! after that batch, so a write that fails half-way leaves the server with
//! a readable file. Only the final batch carries the target metadata.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use blobseal_core::{BlobsealError, BlobsealResult, ChunkIndex, EngineConfig, Version};
use blobseal_crypto::{compute_top_hash, ChunkHash, HashListState};
use blobseal_storage::{FileMeta, FilePatch, Patch, RemoteBlobApi, WriteRequest};

use crate::descriptor::{FileDescriptor, SyncParams};
use crate::reader::{read_range, ChunkReader, ChunkSource};
use crate::squash::{squash, Squashed};

/// State a failed write rolls back to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteSnapshot {
    pub hashes: HashListState,
    pub plain_size: u64,
    pub encrypted_size: u64,
    pub version: Version,
    pub top_hash: ChunkHash,
}

/// A re-encrypted chunk waiting for the remote to acknowledge it
struct StagedChunk {
    index: ChunkIndex,
    data: Vec<u8>,
    hmac: ChunkHash,
    /// Plaintext offset just past the chunk's last byte
    plain_end: u64,
    truncate: bool,
}

#[derive(Default)]
struct StagedWrite {
    chunks: Vec<StagedChunk>,
    patches: Vec<FilePatch>,
    /// Set for a truncation exactly on a chunk boundary
    truncated_at: Option<ChunkIndex>,
}

/// Hash list and size of the remote file after a prefix of the staged
/// chunks has been applied.
struct AppliedPrefix {
    hashes: Vec<ChunkHash>,
    plain_size: u64,
}

impl AppliedPrefix {
    fn apply(&mut self, chunk: &StagedChunk) {
        let i = chunk.index as usize;
        if i < self.hashes.len() {
            self.hashes[i] = chunk.hmac;
        } else {
            self.hashes.push(chunk.hmac);
        }
        if chunk.truncate {
            self.hashes.truncate(i + 1);
            self.plain_size = chunk.plain_end;
        } else {
            self.plain_size = self.plain_size.max(chunk.plain_end);
        }
    }
}

pub struct RandomWriteEngine {
    remote: Arc<dyn RemoteBlobApi>,
    reader: ChunkReader,
    max_operation_size: u64,
    max_operations_per_batch: usize,
}

impl RandomWriteEngine {
    pub fn open(
        remote: Arc<dyn RemoteBlobApi>,
        descriptor: FileDescriptor,
        config: &EngineConfig,
    ) -> BlobsealResult<Self> {
        if config.max_operations_per_batch == 0 || config.max_operation_size == 0 {
            return Err(BlobsealError::Config(
                "max_operation_size and max_operations_per_batch must be positive".into(),
            ));
        }
        let reader = ChunkReader::open(remote.clone(), descriptor, config)?;
        Ok(Self {
            remote,
            reader,
            max_operation_size: config.max_operation_size,
            max_operations_per_batch: config.max_operations_per_batch,
        })
    }

    pub fn descriptor(&self) -> &FileDescriptor {
        self.reader.descriptor()
    }

    pub fn hashes(&self) -> &[ChunkHash] {
        self.reader.hashes().get_all()
    }

    pub fn top_hash(&self) -> ChunkHash {
        self.reader.hashes().top_hash()
    }

    pub fn snapshot(&self) -> WriteSnapshot {
        let descriptor = self.reader.descriptor();
        WriteSnapshot {
            hashes: self.reader.hashes().snapshot(),
            plain_size: descriptor.plain_size,
            encrypted_size: descriptor.encrypted_size,
            version: descriptor.version,
            top_hash: descriptor.top_hash,
        }
    }

    fn restore(&mut self, snapshot: WriteSnapshot) {
        self.reader.hashes_mut().restore(snapshot.hashes);
        let descriptor = self.reader.descriptor_mut();
        descriptor.plain_size = snapshot.plain_size;
        descriptor.encrypted_size = snapshot.encrypted_size;
        descriptor.version = snapshot.version;
        descriptor.top_hash = snapshot.top_hash;
        self.reader.slices_mut().invalidate_all();
        self.reader.drop_cached_chunk();
    }

    /// Write `data` at `offset`. With `truncate` the file ends right after
    /// the written bytes; an empty truncating write truncates at `offset`.
    /// A gap between the end of the file and `offset` is filled with zeros.
    ///
    /// Fails with `ChunkIndexOverflow`, before touching any state, when the
    /// resulting file would need a chunk index beyond 32 bits.
    #[instrument(
        skip_all,
        fields(file_id = %self.reader.descriptor().file_id, offset = offset, len = data.len(), truncate = truncate)
    )]
    pub fn write(&mut self, offset: u64, data: &[u8], truncate: bool) -> BlobsealResult<()> {
        if data.is_empty() && !truncate {
            return Ok(());
        }
        let snapshot = self.snapshot();
        let result = self.write_inner(offset, data, truncate, &snapshot.hashes);
        if let Err(e) = &result {
            warn!(
                version = snapshot.version,
                "random write failed, rolling back: {e}"
            );
            self.restore(snapshot);
        }
        result
    }

    fn write_inner(
        &mut self,
        offset: u64,
        data: &[u8],
        truncate: bool,
        before: &HashListState,
    ) -> BlobsealResult<()> {
        let layout = self.reader.layout();
        let plain_size = self.reader.descriptor().plain_size;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| BlobsealError::ChunkIndexOverflow(layout.chunk_index(offset)))?;
        let new_plain_size = if truncate { end } else { plain_size.max(end) };
        if new_plain_size > 0 {
            let last = layout.chunk_index(new_plain_size - 1);
            if u32::try_from(last).is_err() {
                return Err(BlobsealError::ChunkIndexOverflow(last));
            }
        }
        // a write past the end starts at the end, the gap reading as zeros
        let start = offset.min(plain_size);
        if start == end && new_plain_size == plain_size {
            return Ok(());
        }

        let staged = self.stage(offset, start, end, data, truncate)?;

        let descriptor = self.reader.descriptor();
        let file_id = descriptor.file_id.clone();
        let key_id = descriptor.key_id.clone();
        let mut version = descriptor.version;
        let new_encrypted_size = layout.encrypted_file_size(new_plain_size);
        let top_hash = self.reader.hashes().top_hash();
        let meta_for = |plain_size: u64, top_hash: ChunkHash| FileMeta {
            plain_size,
            encrypted_size: layout.encrypted_file_size(plain_size),
            chunk_size: layout.chunk_size(),
            top_hash,
            key_id: key_id.clone(),
        };
        let final_meta = meta_for(new_plain_size, top_hash);

        let (patches, parts): (Vec<FilePatch>, Vec<usize>) =
            squash(staged.patches, self.max_operation_size)
                .into_iter()
                .map(|Squashed { patch, parts }| (patch, parts))
                .unzip();
        let batches = patches.len().div_ceil(self.max_operations_per_batch);
        let key = self.reader.codec().key().clone();
        let mut prefix = AppliedPrefix {
            hashes: before.hashes().to_vec(),
            plain_size,
        };
        let mut applied = 0;
        for (n, (batch, batch_parts)) in patches
            .chunks(self.max_operations_per_batch)
            .zip(parts.chunks(self.max_operations_per_batch))
            .enumerate()
        {
            let interim;
            let meta = if n + 1 == batches {
                &final_meta
            } else {
                let count: usize = batch_parts.iter().sum();
                for chunk in staged.chunks.iter().skip(applied).take(count) {
                    prefix.apply(chunk);
                }
                applied += count;
                interim = meta_for(prefix.plain_size, compute_top_hash(&key, &prefix.hashes));
                &interim
            };
            version = self.remote.write(
                &file_id,
                WriteRequest {
                    version,
                    patches: batch,
                    meta,
                    force: false,
                },
            )?;
        }

        let descriptor = self.reader.descriptor_mut();
        descriptor.plain_size = new_plain_size;
        descriptor.encrypted_size = new_encrypted_size;
        descriptor.version = version;
        descriptor.top_hash = top_hash;

        let slices = self.reader.slices_mut();
        for chunk in &staged.chunks {
            slices.update(version, chunk.index, &chunk.data, new_encrypted_size, chunk.truncate);
        }
        if let Some(index) = staged.truncated_at {
            slices.update(version, index, &[], new_encrypted_size, true);
        }
        self.reader.drop_cached_chunk();

        debug!(
            version,
            plain_size = new_plain_size,
            chunks = staged.chunks.len(),
            patches = patches.len(),
            batches,
            "random write committed"
        );
        Ok(())
    }

    /// Re-encrypt every chunk touched by `[start, end)` and record the new
    /// hashes. `data` covers `[offset, end)`; anything in `[start, offset)`
    /// lies past the old end of the file and is written as zeros.
    fn stage(
        &mut self,
        offset: u64,
        start: u64,
        end: u64,
        data: &[u8],
        truncate: bool,
    ) -> BlobsealResult<StagedWrite> {
        let layout = self.reader.layout();
        let chunk_size = layout.chunk_size();
        let mut staged = StagedWrite::default();

        if start == end && start % chunk_size == 0 {
            let index = layout.chunk_index(start);
            self.reader.hashes_mut().truncate(index);
            staged.patches.push(FilePatch {
                data: Patch {
                    pos: layout.encrypted_offset(index),
                    data: Vec::new(),
                    truncate: true,
                },
                checksums: Patch {
                    pos: layout.checksum_offset(index),
                    data: Vec::new(),
                    truncate: true,
                },
            });
            staged.truncated_at = Some(index);
            return Ok(staged);
        }

        let first = layout.chunk_index(start);
        let last = if start == end {
            first
        } else {
            layout.chunk_index(end - 1)
        };
        for index in first..=last {
            let chunk_start = layout.chunk_offset(index);
            let chunk_end = end.min(chunk_start + chunk_size);
            let from = (start.max(chunk_start) - chunk_start) as usize;
            let to = (chunk_end - chunk_start) as usize;
            let cut = truncate && index == last;

            let plaintext = {
                let old = self.reader.try_decrypted_chunk(index)?.unwrap_or_default();
                let mut plaintext = Vec::with_capacity(to.max(old.len()));
                plaintext.extend_from_slice(&old[..from.min(old.len())]);
                plaintext.resize(to, 0);
                let copy_from = offset.max(chunk_start + from as u64);
                if copy_from < chunk_end {
                    let src = (copy_from - offset) as usize;
                    let dst = (copy_from - chunk_start) as usize;
                    plaintext[dst..].copy_from_slice(&data[src..src + (to - dst)]);
                }
                if !cut && old.len() > to {
                    plaintext.extend_from_slice(&old[to..]);
                }
                plaintext
            };

            let encrypted = self.reader.codec().encrypt(index, &plaintext)?;
            self.reader.hashes_mut().set(index, encrypted.hmac, cut)?;
            staged.patches.push(FilePatch {
                data: Patch {
                    pos: layout.encrypted_offset(index),
                    data: encrypted.data.clone(),
                    truncate: cut,
                },
                checksums: Patch {
                    pos: layout.checksum_offset(index),
                    data: encrypted.hmac.to_vec(),
                    truncate: cut,
                },
            });
            staged.chunks.push(StagedChunk {
                index,
                data: encrypted.data,
                hmac: encrypted.hmac,
                plain_end: chunk_start + plaintext.len() as u64,
                truncate: cut,
            });
        }
        Ok(staged)
    }

    /// Up to `len` bytes at `offset`, clamped to the file.
    pub fn read(&mut self, offset: u64, len: u64) -> BlobsealResult<Vec<u8>> {
        read_range(self, offset, len)
    }

    pub fn sync(&mut self, params: SyncParams) -> BlobsealResult<()> {
        self.reader.sync(params)
    }
}

impl ChunkSource for RandomWriteEngine {
    fn chunk_size(&self) -> u64 {
        self.reader.chunk_size()
    }

    fn plain_size(&self) -> u64 {
        self.reader.plain_size()
    }

    fn decrypted_chunk(&mut self, index: ChunkIndex) -> BlobsealResult<&[u8]> {
        self.reader.get_decrypted_chunk(index)
    }
}
